//! Per-item execution path
//!
//! ```text
//! cache check ── unchanged ──> skipped("no change")
//!      │
//!      └─ changed ──> retry( breaker( limiter.throttle + task ) )
//!                          │
//!                          ├─ success / skipped ──> cache record
//!                          └─ error ──> SyncError taxonomy
//! ```
//!
//! The pipeline never fails: every path ends in an [`ItemReport`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use relaysync_common::resilience::{
    policies::ClassifiedRetry, CircuitBreaker, QuotaSignal, RateLimiter, ResilienceError,
    RetryConfig, RetryExecutor,
};
use relaysync_domain::constants::{SKIP_REASON_LOCKED, SKIP_REASON_NO_CHANGE};
use relaysync_domain::{ItemReport, TaskOutcome, WorkItem};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::ports::{SyncTask, TaskContext};
use crate::cache::SyncCache;
use crate::errors::SyncError;
use crate::pool::PoolTask;

pub struct ItemPipeline {
    sync_kind: String,
    task: Arc<dyn SyncTask>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor<ClassifiedRetry>,
    cache: Option<Arc<SyncCache>>,
}

impl std::fmt::Debug for ItemPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemPipeline")
            .field("sync_kind", &self.sync_kind)
            .field("dependency", &self.task.dependency())
            .field("cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl ItemPipeline {
    pub fn new(
        sync_kind: impl Into<String>,
        task: Arc<dyn SyncTask>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        retry: RetryConfig,
        cache: Option<Arc<SyncCache>>,
    ) -> Self {
        Self {
            sync_kind: sync_kind.into(),
            task,
            breaker,
            limiter,
            retry: RetryExecutor::new(retry, ClassifiedRetry),
            cache,
        }
    }

    pub fn sync_kind(&self) -> &str {
        &self.sync_kind
    }

    pub fn cache_key(&self, item: &WorkItem) -> String {
        format!("{}:{}", self.sync_kind, item.id)
    }

    #[instrument(skip(self, item), fields(kind = %self.sync_kind, item = %item.id))]
    pub async fn process(&self, item: &WorkItem) -> ItemReport {
        let started = Instant::now();
        let key = self.cache_key(item);
        // `item.content_hash` is the last-known value; change detection
        // always compares the payload as it is now.
        let fingerprint = SyncCache::fingerprint(&item.payload);

        if let Some(cache) = &self.cache {
            if cache.check(&key, &fingerprint).await.is_unchanged() {
                return ItemReport::skipped(&item.id, SKIP_REASON_NO_CHANGE)
                    .with_content_hash(fingerprint)
                    .with_latency(started.elapsed());
            }
        }

        let attempts = AtomicU32::new(0);
        let result = self
            .retry
            .execute(|| {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                self.attempt(item, attempt)
            })
            .await;
        let attempts = attempts.load(Ordering::Relaxed);

        let report = match result {
            Ok(outcome) => {
                if let Some(cache) = &self.cache {
                    cache.record(&key, &fingerprint).await;
                }
                let report = match outcome {
                    TaskOutcome::Success { detail } => ItemReport::success(&item.id, detail),
                    TaskOutcome::Skipped { reason } => ItemReport::skipped(&item.id, reason),
                };
                report.with_content_hash(fingerprint)
            }
            Err(err) => {
                let err = SyncError::from_retry(err);
                if err.is_skip() {
                    debug!(error = %err, "pipeline.item_contended");
                    ItemReport::skipped(&item.id, SKIP_REASON_LOCKED)
                } else {
                    warn!(error = %err, attempts, "pipeline.item_failed");
                    ItemReport::error(&item.id, err.to_string())
                }
            }
        };
        report.with_attempts(attempts).with_latency(started.elapsed())
    }

    async fn attempt(
        &self,
        item: &WorkItem,
        attempt: u32,
    ) -> Result<TaskOutcome, ResilienceError<SyncError>> {
        let ctx = TaskContext::new(attempt, Arc::clone(&self.limiter));
        self.breaker
            .execute(|| async {
                self.limiter.throttle().await;
                let result = self.task.execute(item, &ctx).await;
                if let Err(SyncError::RateLimited { retry_after: Some(delay) }) = &result {
                    self.limiter.update_limit_from_response(&QuotaSignal::retry_after(*delay));
                }
                result
            })
            .await
    }
}

/// Runs an [`ItemPipeline`] as a pool task: a serialized [`WorkItem`] in,
/// a serialized [`ItemReport`] out.
#[derive(Debug)]
pub struct PipelineTask {
    pipeline: Arc<ItemPipeline>,
}

impl PipelineTask {
    pub fn new(pipeline: Arc<ItemPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl PoolTask for PipelineTask {
    async fn run(&self, params: Value) -> Result<Value, SyncError> {
        let item: WorkItem = serde_json::from_value(params)
            .map_err(|e| SyncError::validation(format!("malformed work item: {e}")))?;
        let report = self.pipeline.process(&item).await;
        serde_json::to_value(&report)
            .map_err(|e| SyncError::permanent(format!("unserializable report: {e}")))
    }
}
