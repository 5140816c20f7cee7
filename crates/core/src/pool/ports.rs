//! Task contract and value types of the worker pool

use std::time::Duration;

use async_trait::async_trait;
use relaysync_common::error::{ErrorClassification, ErrorSeverity};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::errors::SyncError;

/// A named unit of work the pool can run
///
/// Implementations must tolerate being invoked more than once for the same
/// parameters: a timed-out run is abandoned, not stopped, and may still
/// complete after the caller has moved on.
#[async_trait]
pub trait PoolTask: Send + Sync {
    async fn run(&self, params: Value) -> Result<Value, SyncError>;
}

/// Per-call options for [`WorkerPool::run_task`](super::WorkerPool::run_task)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Higher runs first; equal priorities run in arrival order
    pub priority: i64,
    /// Overrides the pool's default task timeout
    pub timeout: Option<Duration>,
    pub use_distributed_lock: bool,
    pub lock_resource_id: Option<String>,
}

impl TaskOptions {
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the task body under the distributed lock on `resource_id`.
    pub fn locked(mut self, resource_id: impl Into<String>) -> Self {
        self.use_distributed_lock = true;
        self.lock_resource_id = Some(resource_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Completed(Value),
    /// Another holder had the lock; the task body did not run
    Skipped { resource_id: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    #[error(transparent)]
    Task(SyncError),

    #[error("task '{task}' timed out after {timeout:?}")]
    Timeout { task: String, timeout: Duration },

    #[error("no task registered under '{0}'")]
    UnknownTask(String),

    #[error("worker crashed while running '{task}': {message}")]
    Crashed { task: String, message: String },

    #[error("worker pool is shut down")]
    ShutDown,

    #[error("distributed lock requested without a lock resource id")]
    MissingLockResource,
}

impl ErrorClassification for PoolError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Task(err) => err.is_retryable(),
            Self::Timeout { .. } | Self::Crashed { .. } => true,
            Self::UnknownTask(_) | Self::ShutDown | Self::MissingLockResource => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Task(err) => err.severity(),
            Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Crashed { .. } | Self::UnknownTask(_) | Self::MissingLockResource => {
                ErrorSeverity::Error
            }
            Self::ShutDown => ErrorSeverity::Info,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Task(err) if err.is_critical())
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Task(err) => err.retry_after(),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Task(err) => err.kind(),
            Self::Timeout { .. } => "task_timeout",
            Self::UnknownTask(_) => "unknown_task",
            Self::Crashed { .. } => "worker_crashed",
            Self::ShutDown => "shut_down",
            Self::MissingLockResource => "missing_lock_resource",
        }
    }
}

/// Pool occupancy and lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub workers: usize,
    pub busy: usize,
    pub idle: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub crashed: u64,
    pub spawned: u64,
    pub retired: u64,
    pub min_workers: usize,
    pub max_workers: usize,
}
