//! Port interfaces for the engine's external collaborators

use std::sync::Arc;

use async_trait::async_trait;
use relaysync_common::resilience::{CircuitTransition, QuotaSignal, RateLimitInfo, RateLimiter};
use relaysync_domain::{BatchSnapshot, ItemReport, Result, TaskOutcome, WorkItem};

use crate::errors::SyncError;

/// Caller-supplied synchronization operation for one sync kind
///
/// Must be idempotent: a timed-out run may still complete after the engine
/// has moved on, and transient failures are retried.
#[async_trait]
pub trait SyncTask: Send + Sync {
    /// External dependency this task calls; selects its breaker and limiter.
    fn dependency(&self) -> &str;

    async fn execute(&self, item: &WorkItem, ctx: &TaskContext)
        -> std::result::Result<TaskOutcome, SyncError>;
}

/// Per-attempt context handed to a [`SyncTask`]
#[derive(Clone)]
pub struct TaskContext {
    attempt: u32,
    limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("attempt", &self.attempt)
            .field("limiter", &self.limiter.name())
            .finish()
    }
}

impl TaskContext {
    pub fn new(attempt: u32, limiter: Arc<RateLimiter>) -> Self {
        Self { attempt, limiter }
    }

    /// 1-based attempt number for this item.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Feed quota information from the dependency's response into its limiter.
    pub fn report_quota(&self, signal: &QuotaSignal) {
        self.limiter.update_limit_from_response(signal);
    }
}

/// Where work items come from and where their final status goes
#[async_trait]
pub trait WorkItemSource: Send + Sync {
    /// Items for `ids`; ids the source does not know are left out.
    async fn load(&self, ids: &[String]) -> Result<Vec<WorkItem>>;

    /// Record the final status and message of one item.
    async fn record_outcome(&self, report: &ItemReport) -> Result<()>;
}

/// Receiver of progress snapshots, breaker transitions and quota usage
///
/// Failures are logged by the engine and never interrupt a run.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_snapshot(&self, snapshot: &BatchSnapshot) -> Result<()>;

    /// Called synchronously from the breaker on every transition.
    fn record_transition(&self, transition: &CircuitTransition);

    async fn record_rate_limit(&self, info: &RateLimitInfo) -> Result<()>;
}

/// Sink used when none is configured
#[derive(Debug, Default)]
pub(crate) struct DiscardSink;

#[async_trait]
impl MetricsSink for DiscardSink {
    async fn record_snapshot(&self, _snapshot: &BatchSnapshot) -> Result<()> {
        Ok(())
    }

    fn record_transition(&self, _transition: &CircuitTransition) {}

    async fn record_rate_limit(&self, _info: &RateLimitInfo) -> Result<()> {
        Ok(())
    }
}
