//! # RelaySync Core
//!
//! Synchronization logic and the ports it needs - no concrete stores,
//! sources or sinks.
//!
//! This crate contains:
//! - The `SyncError` taxonomy
//! - Distributed locking and the tiered sync cache over the `SharedStore` port
//! - Priority scoring and adaptive batch scheduling
//! - The worker pool
//! - The item pipeline and the `SyncEngine` composition root
//!
//! ## Architecture Principles
//! - Depends only on `relaysync-common` and `relaysync-domain`
//! - All external collaborators via traits
//! - Deterministic doubles for every port behind the `test-utils` feature

pub mod cache;
pub mod errors;
pub mod lock;
pub mod pool;
pub mod scheduling;
pub mod settings;
pub mod store;
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cache::{CacheCheck, CacheEntry, SyncCache};
pub use errors::SyncError;
pub use lock::{DistributedLock, LockHandle, LockOptions, LockedRun};
pub use pool::{PoolError, PoolMetrics, PoolTask, TaskOptions, TaskResult, WorkerPool};
pub use scheduling::{AdaptiveBatchScheduler, PriorityScorer, SchedulerStats};
pub use store::{GuardedStore, SharedStore, StoreError};
pub use sync::{MetricsSink, SyncEngine, SyncTask, TaskContext, WorkItemSource};
