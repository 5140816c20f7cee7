//! # RelaySync Infrastructure
//!
//! Infrastructure implementations of core ports.
//!
//! This crate contains:
//! - [`MemoryStore`], the in-process `SharedStore` from `relaysync-core`, re-exported
//! - [`MemoryWorkItemSource`], an in-process `WorkItemSource`
//! - Metrics sinks writing to tracing or to a JSON-lines file
//! - Configuration loading from files and environment variables
//! - Tracing subscriber initialisation
//!
//! ## Architecture
//! - Implements traits defined in `relaysync-core`
//! - Contains all "impure" code (file I/O, global subscriber)

pub mod config;
pub mod errors;
pub mod observability;
pub mod source;

// Re-export commonly used items
pub use errors::InfraError;
pub use observability::{init_tracing, JsonlSnapshotSink, LogFormat, TracingMetricsSink};
pub use source::MemoryWorkItemSource;
pub use relaysync_core::store::MemoryStore;
