//! Adaptive batch scheduling
//!
//! Batches run strictly one after another; the items of one batch are
//! dispatched together. After each batch the scheduler folds its success
//! rate and average latency into the next batch size:
//!
//! - success rate at or above `good_success_rate` and latency fast: grow by
//!   `batch_size_step`
//! - success rate below `bad_success_rate` or latency slow: shrink by
//!   `batch_size_step`
//! - otherwise hold
//!
//! The items still waiting are always re-chunked at the adapted size.
//! Batches that contain errors also raise an exponential pause before the
//! next batch, independent of the size decision.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use relaysync_domain::{ItemReport, ItemStatus, SchedulerConfig, WorkItem};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

/// Mutable scheduling state of one run
#[derive(Debug, Clone)]
pub struct BatchPlan {
    remaining: VecDeque<WorkItem>,
    current_batch_size: usize,
    total: usize,
    latencies: VecDeque<Duration>,
    latency_window: usize,
    consecutive_error_batches: u32,
}

impl BatchPlan {
    fn new(items: Vec<WorkItem>, batch_size: usize, latency_window: usize) -> Self {
        Self {
            total: items.len(),
            remaining: items.into(),
            current_batch_size: batch_size,
            latencies: VecDeque::with_capacity(latency_window),
            latency_window,
            consecutive_error_batches: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn current_batch_size(&self) -> usize {
        self.current_batch_size
    }

    pub fn consecutive_error_batches(&self) -> u32 {
        self.consecutive_error_batches
    }

    /// Item ids of the batches still to run, chunked at the current size.
    pub fn preview(&self) -> Vec<Vec<String>> {
        let ids: Vec<String> = self.remaining.iter().map(|item| item.id.clone()).collect();
        ids.chunks(self.current_batch_size.max(1)).map(<[String]>::to_vec).collect()
    }

    /// Mean of the per-batch average latencies in the rolling window.
    pub fn rolling_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.latencies.iter().sum();
        total / u32::try_from(self.latencies.len()).unwrap_or(u32::MAX)
    }

    fn next_batch(&mut self) -> Vec<WorkItem> {
        let take = self.current_batch_size.min(self.remaining.len());
        self.remaining.drain(..take).collect()
    }

    fn fold(&mut self, batch: &BatchResult) {
        if self.latencies.len() == self.latency_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(batch.avg_latency);
        if batch.error > 0 {
            self.consecutive_error_batches += 1;
        } else {
            self.consecutive_error_batches = 0;
        }
    }
}

/// Aggregate of one completed batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub size: usize,
    pub success: usize,
    pub error: usize,
    pub skipped: usize,
    pub avg_latency: Duration,
    pub wall_time: Duration,
}

impl BatchResult {
    pub fn from_reports(reports: &[ItemReport], wall_time: Duration) -> Self {
        let count = |status| reports.iter().filter(|r| r.status == status).count();
        let latency_sum: u64 = reports.iter().map(|r| r.latency_ms).sum();
        let avg_latency = if reports.is_empty() {
            Duration::ZERO
        } else {
            Duration::from_millis(latency_sum / reports.len() as u64)
        };
        Self {
            size: reports.len(),
            success: count(ItemStatus::Success),
            error: count(ItemStatus::Error),
            skipped: count(ItemStatus::Skipped),
            avg_latency,
            wall_time,
        }
    }

    /// Skipped items did what was asked of them and count as successes.
    pub fn success_rate(&self) -> f64 {
        if self.size == 0 {
            return 1.0;
        }
        (self.success + self.skipped) as f64 / self.size as f64
    }
}

/// Batch size change applied after a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SizeDecision {
    Grow { from: usize, to: usize },
    Shrink { from: usize, to: usize },
    Hold { size: usize },
}

impl SizeDecision {
    pub fn size(self) -> usize {
        match self {
            Self::Grow { to, .. } | Self::Shrink { to, .. } => to,
            Self::Hold { size } => size,
        }
    }
}

/// Running statistics of one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub processed: usize,
    pub success: usize,
    pub error: usize,
    pub skipped: usize,
    pub remaining: usize,
    pub current_batch_size: usize,
    /// Rolling average of per-batch latency
    pub avg_latency: Duration,
    pub batches_run: usize,
    pub consecutive_error_batches: u32,
    pub total_backoff: Duration,
}

impl SchedulerStats {
    fn absorb(&mut self, batch: &BatchResult, plan: &BatchPlan) {
        self.processed += batch.size;
        self.success += batch.success;
        self.error += batch.error;
        self.skipped += batch.skipped;
        self.remaining = plan.remaining();
        self.current_batch_size = plan.current_batch_size;
        self.avg_latency = plan.rolling_latency();
        self.batches_run += 1;
        self.consecutive_error_batches = plan.consecutive_error_batches;
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct SchedulerRun {
    pub stats: SchedulerStats,
    /// One report per submitted item, in completion order of their batches
    pub reports: Vec<ItemReport>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveBatchScheduler {
    config: SchedulerConfig,
}

impl AdaptiveBatchScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Plan a run over `items`, already in priority order.
    ///
    /// `batch_size_hint` replaces the configured initial size and is clamped
    /// into the configured bounds.
    pub fn plan(&self, items: Vec<WorkItem>, batch_size_hint: Option<usize>) -> BatchPlan {
        let initial = self
            .config
            .clamp_batch_size(batch_size_hint.unwrap_or(self.config.initial_batch_size));
        BatchPlan::new(items, initial, self.config.latency_window.max(1))
    }

    pub fn decide(&self, current: usize, batch: &BatchResult) -> SizeDecision {
        let c = &self.config;
        let rate = batch.success_rate();
        let fast = batch.avg_latency <= c.fast_latency();
        let slow = batch.avg_latency > c.slow_latency();

        if rate >= c.good_success_rate && fast {
            let to = (current + c.batch_size_step).min(c.max_batch_size);
            if to > current {
                return SizeDecision::Grow { from: current, to };
            }
        } else if rate < c.bad_success_rate || slow {
            let to = current.saturating_sub(c.batch_size_step).max(c.min_batch_size);
            if to < current {
                return SizeDecision::Shrink { from: current, to };
            }
        }
        SizeDecision::Hold { size: current }
    }

    /// Pause before the next batch after `consecutive` error batches:
    /// `base * factor^consecutive`, capped.
    pub fn error_backoff(&self, consecutive: u32) -> Duration {
        if consecutive == 0 {
            return Duration::ZERO;
        }
        let c = &self.config;
        let exponent = i32::try_from(consecutive).unwrap_or(i32::MAX);
        let secs = c.error_backoff_base().as_secs_f64() * c.error_backoff_factor.powi(exponent);
        let max = c.error_backoff_max();
        if !secs.is_finite() || secs >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Drive `plan` to completion.
    ///
    /// `dispatch` runs one item and must always produce a report, so every
    /// item is accounted for exactly once. `on_progress` receives the running
    /// statistics every `snapshot_every` batches and once more, flagged
    /// final, at the end.
    pub async fn run<D, DFut, P, PFut>(
        &self,
        mut plan: BatchPlan,
        mut dispatch: D,
        mut on_progress: P,
    ) -> SchedulerRun
    where
        D: FnMut(WorkItem) -> DFut,
        DFut: Future<Output = ItemReport>,
        P: FnMut(SchedulerStats, bool) -> PFut,
        PFut: Future<Output = ()>,
    {
        let mut stats = SchedulerStats {
            remaining: plan.remaining(),
            current_batch_size: plan.current_batch_size,
            ..SchedulerStats::default()
        };
        let mut reports = Vec::with_capacity(plan.total());
        let snapshot_every = self.config.snapshot_every.max(1);

        while !plan.is_empty() {
            let backoff = self.error_backoff(plan.consecutive_error_batches);
            if !backoff.is_zero() {
                info!(
                    consecutive_error_batches = plan.consecutive_error_batches,
                    backoff_ms = backoff.as_millis() as u64,
                    "scheduler.backoff"
                );
                tokio::time::sleep(backoff).await;
                stats.total_backoff += backoff;
            }

            let batch = plan.next_batch();
            debug!(batch = stats.batches_run + 1, size = batch.len(), "scheduler.batch_started");
            let started = Instant::now();
            let batch_reports = join_all(batch.into_iter().map(&mut dispatch)).await;
            let result = BatchResult::from_reports(&batch_reports, started.elapsed());

            plan.fold(&result);
            let decision = self.decide(plan.current_batch_size, &result);
            plan.current_batch_size = decision.size();
            stats.absorb(&result, &plan);
            reports.extend(batch_reports);

            info!(
                batch = stats.batches_run,
                size = result.size,
                success = result.success,
                error = result.error,
                skipped = result.skipped,
                avg_latency_ms = result.avg_latency.as_millis() as u64,
                next_batch_size = plan.current_batch_size,
                remaining = plan.remaining(),
                "scheduler.batch_completed"
            );
            if !matches!(decision, SizeDecision::Hold { .. }) {
                debug!(?decision, "scheduler.batch_size_adapted");
            }

            if stats.batches_run % snapshot_every == 0 && !plan.is_empty() {
                on_progress(stats.clone(), false).await;
            }
        }

        on_progress(stats.clone(), true).await;
        SchedulerRun { stats, reports }
    }
}
