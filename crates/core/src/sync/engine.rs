//! Composition root of the synchronization engine
//!
//! The engine owns the breaker and limiter registries, the guarded shared
//! store, the lock manager, the sync cache and the worker pool, and wires
//! them into one [`ItemPipeline`] per registered sync kind.
//!
//! A submission flows through:
//!
//! 1. [`PriorityScorer::rank`] orders the items
//! 2. [`AdaptiveBatchScheduler`] runs them batch by batch
//! 3. each item is a locked pool task running its kind's pipeline
//! 4. final statuses are written back to the [`WorkItemSource`]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use relaysync_common::resilience::{
    CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitState, CircuitTransition,
    RateLimitInfo, RateLimiterRegistry,
};
use relaysync_domain::constants::{INFRASTRUCTURE_DEPENDENCY, SKIP_REASON_LOCKED};
use relaysync_domain::{
    BatchSnapshot, EngineConfig, ItemReport, RelaySyncError, Result, SubmitOptions, SubmitReport,
    WorkItem,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::pipeline::{ItemPipeline, PipelineTask};
use super::ports::{DiscardSink, MetricsSink, SyncTask, WorkItemSource};
use crate::cache::SyncCache;
use crate::lock::{DistributedLock, LockOptions};
use crate::pool::{PoolMetrics, TaskOptions, TaskResult, WorkerPool};
use crate::scheduling::{AdaptiveBatchScheduler, PriorityScorer, PriorityWeights, SchedulerStats};
use crate::settings::{breaker_config, limiter_config, lock_options, retry_config};
use crate::store::{GuardedStore, SharedStore};

/// Builder for [`SyncEngine`]
#[derive(Default)]
pub struct SyncEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn SharedStore>>,
    source: Option<Arc<dyn WorkItemSource>>,
    sink: Option<Arc<dyn MetricsSink>>,
    tasks: Vec<(String, Arc<dyn SyncTask>)>,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn source(mut self, source: Arc<dyn WorkItemSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn task(mut self, sync_kind: impl Into<String>, task: Arc<dyn SyncTask>) -> Self {
        self.tasks.push((sync_kind.into(), task));
        self
    }

    /// Validate the configuration and start the engine.
    ///
    /// Must be called inside a tokio runtime; the worker pool starts here.
    pub fn build(self) -> Result<SyncEngine> {
        let config = self.config;
        config.validate()?;
        let store = self
            .store
            .ok_or_else(|| RelaySyncError::Config("a shared store is required".to_string()))?;
        let sink = self.sink.unwrap_or_else(|| Arc::new(DiscardSink));

        let infrastructure = breaker_config(&config.infrastructure_breaker)?;
        let breakers = CircuitBreakerRegistry::new(breaker_config(&config.circuit_breaker)?)
            .and_then(|registry| registry.with_override(INFRASTRUCTURE_DEPENDENCY, infrastructure))
            .map_err(|e| RelaySyncError::Config(e.to_string()))?;
        let transitions = Arc::clone(&sink);
        breakers.add_observer(Arc::new(move |transition: &CircuitTransition| {
            transitions.record_transition(transition);
        }));

        let mut limiters = RateLimiterRegistry::new(limiter_config(&config.default_rate_limit)?)
            .map_err(|e| RelaySyncError::Config(e.to_string()))?;
        for (dependency, settings) in &config.rate_limits {
            limiters = limiters
                .with_override(dependency.clone(), limiter_config(settings)?)
                .map_err(|e| RelaySyncError::Config(e.to_string()))?;
        }

        let guarded = GuardedStore::new(store, breakers.get(INFRASTRUCTURE_DEPENDENCY));
        let lock = DistributedLock::new(guarded.clone());
        let cache = config.cache.enabled.then(|| Arc::new(SyncCache::tiered(guarded, &config.cache)));
        let pool = WorkerPool::start_with_lock(config.pool.clone(), lock.clone(), lock_options(&config.lock));

        let engine = SyncEngine {
            scheduler: AdaptiveBatchScheduler::new(config.scheduler.clone()),
            scorer: PriorityScorer::new(PriorityWeights::from(&config.priority)),
            lock_options: lock_options(&config.lock),
            config,
            breakers,
            limiters,
            lock,
            cache,
            pool,
            source: self.source,
            sink,
            kinds: DashMap::new(),
        };
        for (sync_kind, task) in self.tasks {
            engine.register_task(sync_kind, task)?;
        }
        info!(
            kinds = engine.kinds.len(),
            cache = engine.cache.is_some(),
            lock = engine.config.lock.enabled,
            "engine.started"
        );
        Ok(engine)
    }
}

/// The resilient batch synchronization engine
pub struct SyncEngine {
    config: EngineConfig,
    breakers: CircuitBreakerRegistry,
    limiters: RateLimiterRegistry,
    lock: DistributedLock,
    lock_options: LockOptions,
    cache: Option<Arc<SyncCache>>,
    pool: WorkerPool,
    scheduler: AdaptiveBatchScheduler,
    scorer: PriorityScorer,
    source: Option<Arc<dyn WorkItemSource>>,
    sink: Arc<dyn MetricsSink>,
    /// sync kind -> dependency name
    kinds: DashMap<String, String>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("kinds", &self.kinds.len())
            .field("breakers", &self.breakers)
            .field("limiters", &self.limiters)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register the task run for `sync_kind`, replacing any earlier one.
    pub fn register_task(&self, sync_kind: impl Into<String>, task: Arc<dyn SyncTask>) -> Result<()> {
        let sync_kind = sync_kind.into();
        if sync_kind.trim().is_empty() {
            return Err(RelaySyncError::InvalidInput("sync kind must not be empty".to_string()));
        }
        let dependency = task.dependency().to_string();
        let pipeline = ItemPipeline::new(
            sync_kind.clone(),
            task,
            self.breakers.get(&dependency),
            self.limiters.get(&dependency),
            retry_config(&self.config.retry)?,
            self.cache.clone(),
        );
        self.pool.register_task(sync_kind.clone(), Arc::new(PipelineTask::new(Arc::new(pipeline))));
        debug!(kind = %sync_kind, dependency = %dependency, "engine.task_registered");
        self.kinds.insert(sync_kind, dependency);
        Ok(())
    }

    /// Load `ids` from the work-item source and synchronize them.
    ///
    /// Duplicate ids are submitted once. Ids the source does not know are
    /// reported as errors so the totals still cover every distinct id.
    pub async fn submit_batch(&self, ids: &[String], options: SubmitOptions) -> Result<SubmitReport> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| RelaySyncError::Config("no work-item source configured".to_string()))?;

        let mut seen = HashSet::new();
        let unique: Vec<String> = ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect();
        let items = source.load(&unique).await?;

        let known: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
        let missing: Vec<ItemReport> = unique
            .iter()
            .filter(|id| !known.contains(id.as_str()))
            .map(|id| ItemReport::error(id, format!("not found: {id}")))
            .collect();
        if !missing.is_empty() {
            warn!(missing = missing.len(), "engine.items_not_found");
        }

        let mut report = self.submit_items(items, options).await?;
        for item in missing {
            report.total += 1;
            report.error += 1;
            report.items.push(item);
        }
        Ok(report)
    }

    /// Synchronize `items` with the task registered for `options.sync_kind`.
    #[instrument(skip(self, items, options), fields(kind = %options.sync_kind, total = items.len()))]
    pub async fn submit_items(
        &self,
        items: Vec<WorkItem>,
        options: SubmitOptions,
    ) -> Result<SubmitReport> {
        let sync_kind = options.sync_kind.clone();
        let Some(dependency) = self.kinds.get(&sync_kind).map(|entry| entry.value().clone()) else {
            return Err(RelaySyncError::InvalidInput(format!("no task registered for '{sync_kind}'")));
        };

        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let total = items.len();
        info!(%run_id, kind = %sync_kind, total, "engine.run_started");

        let ranked = self.scorer.rank(items, Utc::now());
        let plan = self.scheduler.plan(ranked, options.batch_size_hint);

        let kind = sync_kind.as_str();
        let run = self
            .scheduler
            .run(
                plan,
                move |item| self.dispatch(kind, item),
                move |stats, is_final| self.emit_snapshot(run_id, kind, stats, is_final),
            )
            .await;

        for report in &run.reports {
            self.write_back(report).await;
        }
        let info = self.limiters.limit_info(&dependency);
        if let Err(err) = self.sink.record_rate_limit(&info).await {
            warn!(error = %err, "engine.sink_failed");
        }

        let stats = run.stats;
        let report = SubmitReport {
            run_id,
            sync_kind,
            total,
            success: stats.success,
            error: stats.error,
            skipped: stats.skipped,
            final_batch_size: stats.current_batch_size,
            avg_latency_ms: stats.avg_latency.as_secs_f64() * 1000.0,
            batches: stats.batches_run,
            items: run.reports,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            %run_id,
            success = report.success,
            error = report.error,
            skipped = report.skipped,
            batches = report.batches,
            final_batch_size = report.final_batch_size,
            "engine.run_completed"
        );
        Ok(report)
    }

    async fn dispatch(&self, sync_kind: &str, item: WorkItem) -> ItemReport {
        let started = Instant::now();
        let id = item.id.clone();
        let mut options = TaskOptions::default().with_priority(item.priority);
        if self.config.lock.enabled {
            options = options.locked(format!("{sync_kind}:{id}"));
        }

        let params = match serde_json::to_value(&item) {
            Ok(params) => params,
            Err(err) => return ItemReport::error(id, format!("unserializable work item: {err}")),
        };
        let report = match self.pool.run_task(sync_kind, params, options).await {
            Ok(TaskResult::Completed(value)) => match serde_json::from_value::<ItemReport>(value) {
                Ok(report) => return report,
                Err(err) => ItemReport::error(&id, format!("malformed item report: {err}")),
            },
            Ok(TaskResult::Skipped { .. }) => ItemReport::skipped(&id, SKIP_REASON_LOCKED),
            Err(err) => ItemReport::error(&id, err.to_string()),
        };
        report.with_latency(started.elapsed())
    }

    async fn emit_snapshot(&self, run_id: Uuid, sync_kind: &str, stats: SchedulerStats, is_final: bool) {
        let snapshot = BatchSnapshot {
            run_id,
            sync_kind: sync_kind.to_string(),
            batches_completed: stats.batches_run,
            processed: stats.processed,
            success: stats.success,
            error: stats.error,
            skipped: stats.skipped,
            remaining: stats.remaining,
            current_batch_size: stats.current_batch_size,
            avg_latency_ms: stats.avg_latency.as_secs_f64() * 1000.0,
            consecutive_error_batches: stats.consecutive_error_batches,
            total_backoff_ms: u64::try_from(stats.total_backoff.as_millis()).unwrap_or(u64::MAX),
            is_final,
            at: Utc::now(),
        };
        if let Err(err) = self.sink.record_snapshot(&snapshot).await {
            warn!(error = %err, "engine.sink_failed");
        }
    }

    async fn write_back(&self, report: &ItemReport) {
        let Some(source) = &self.source else {
            return;
        };
        if let Err(err) = source.record_outcome(report).await {
            warn!(item = %report.item_id, error = %err, "engine.write_back_failed");
        }
    }

    pub fn circuit_state(&self, dependency: &str) -> CircuitState {
        self.breakers.state(dependency)
    }

    /// Force the breaker for `dependency` closed.
    pub fn reset_circuit(&self, dependency: &str) -> bool {
        self.breakers.reset(dependency)
    }

    pub fn circuit_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        self.breakers.snapshot()
    }

    pub fn limit_info(&self, dependency: &str) -> RateLimitInfo {
        self.limiters.limit_info(dependency)
    }

    pub fn pool_metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    pub fn cache(&self) -> Option<&Arc<SyncCache>> {
        self.cache.as_ref()
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!("engine.shut_down");
    }
}
