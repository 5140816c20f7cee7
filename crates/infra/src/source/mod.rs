//! [`WorkItemSource`](relaysync_core::sync::WorkItemSource) adapters

pub mod memory;

pub use memory::MemoryWorkItemSource;
