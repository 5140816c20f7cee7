//! Shared key-value store port
//!
//! The store is the single source of truth for cross-process state: lock
//! ownership and the shared cache tier. Core code only ever reaches it through
//! [`GuardedStore`], which routes every call through the `infrastructure`
//! circuit breaker.

pub mod guarded;
pub mod memory;
pub mod ports;

pub use guarded::{GuardedStore, GuardedResult};
pub use memory::MemoryStore;
pub use ports::{SharedStore, StoreError, StoreResult};
