//! Deterministic doubles for the engine's ports
//!
//! Available to this crate's tests and, through the `test-utils` feature, to
//! downstream crates' tests.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relaysync_common::resilience::{CircuitTransition, QuotaSignal, RateLimitInfo};
use relaysync_domain::{
    BatchSnapshot, ItemReport, RelaySyncError, Result, TaskOutcome, WorkItem, WorkStatus,
};

use crate::errors::SyncError;
use crate::store::{MemoryStore, SharedStore, StoreError, StoreResult};
use crate::sync::{MetricsSink, SyncTask, TaskContext, WorkItemSource};

/* -------------------------------------------------------------------------- */
/* Shared store */
/* -------------------------------------------------------------------------- */

/// [`MemoryStore`] that can be switched off to simulate an unreachable store
///
/// Every port call is counted, including the ones refused while switched off.
#[derive(Debug)]
pub struct InMemoryStore {
    inner: MemoryStore,
    available: AtomicBool,
    calls: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { inner: MemoryStore::new(), available: AtomicBool::new(true), calls: AtomicU64::new(0) }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop `key` as if its TTL had run out.
    pub fn expire_now(&self, key: &str) {
        self.inner.evict(key);
    }

    /// Live value of `key`, bypassing availability.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.inner.peek(key)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn guard(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.guard()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.guard()?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.guard()?;
        self.inner.compare_and_expire(key, expected, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.guard()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.guard()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.guard()?;
        self.inner.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.guard()?;
        self.inner.keys(prefix).await
    }
}

/// Store that is always unreachable
#[derive(Debug, Default)]
pub struct FailingStore {
    calls: AtomicU64,
}

impl FailingStore {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> StoreResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl SharedStore for FailingStore {
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
        self.fail()
    }

    async fn compare_and_delete(&self, _key: &str, _expected: &str) -> StoreResult<bool> {
        self.fail()
    }

    async fn compare_and_expire(
        &self,
        _key: &str,
        _expected: &str,
        _ttl: Duration,
    ) -> StoreResult<bool> {
        self.fail()
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        self.fail()
    }

    async fn keys(&self, _prefix: &str) -> StoreResult<Vec<String>> {
        self.fail()
    }
}

/* -------------------------------------------------------------------------- */
/* Metrics sink */
/* -------------------------------------------------------------------------- */

/// Sink that keeps everything it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    snapshots: Mutex<Vec<BatchSnapshot>>,
    transitions: Mutex<Vec<CircuitTransition>>,
    rate_limits: Mutex<Vec<RateLimitInfo>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every async write fail (transitions are still recorded).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn snapshots(&self) -> Vec<BatchSnapshot> {
        self.snapshots.lock().clone()
    }

    pub fn transitions(&self) -> Vec<CircuitTransition> {
        self.transitions.lock().clone()
    }

    pub fn rate_limits(&self) -> Vec<RateLimitInfo> {
        self.rate_limits.lock().clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RelaySyncError::Internal("sink unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn record_snapshot(&self, snapshot: &BatchSnapshot) -> Result<()> {
        self.check()?;
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }

    fn record_transition(&self, transition: &CircuitTransition) {
        self.transitions.lock().push(transition.clone());
    }

    async fn record_rate_limit(&self, info: &RateLimitInfo) -> Result<()> {
        self.check()?;
        self.rate_limits.lock().push(info.clone());
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */
/* Work-item source */
/* -------------------------------------------------------------------------- */

/// Source backed by a map of items; records every outcome written back
#[derive(Debug, Default)]
pub struct VecSource {
    items: Mutex<HashMap<String, WorkItem>>,
    outcomes: Mutex<Vec<ItemReport>>,
    failing_writes: AtomicBool,
}

impl VecSource {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let items = items.into_iter().map(|item| (item.id.clone(), item)).collect();
        Self { items: Mutex::new(items), ..Self::default() }
    }

    pub fn insert(&self, item: WorkItem) {
        self.items.lock().insert(item.id.clone(), item);
    }

    pub fn item(&self, id: &str) -> Option<WorkItem> {
        self.items.lock().get(id).cloned()
    }

    pub fn outcomes(&self) -> Vec<ItemReport> {
        self.outcomes.lock().clone()
    }

    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkItemSource for VecSource {
    async fn load(&self, ids: &[String]) -> Result<Vec<WorkItem>> {
        let items = self.items.lock();
        Ok(ids.iter().filter_map(|id| items.get(id).cloned()).collect())
    }

    async fn record_outcome(&self, report: &ItemReport) -> Result<()> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(RelaySyncError::Source("write-back rejected".to_string()));
        }
        if let Some(item) = self.items.lock().get_mut(&report.item_id) {
            item.status = WorkStatus::from(report.status);
            item.last_message = report.message.clone();
            item.attempts += report.attempts;
            if let Some(hash) = &report.content_hash {
                item.content_hash = Some(hash.clone());
            }
        }
        self.outcomes.lock().push(report.clone());
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */
/* Sync task */
/* -------------------------------------------------------------------------- */

/// One scripted reaction of [`ScriptedTask`]
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Skip(String),
    Fail(SyncError),
    Panic,
}

impl Step {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: HashMap<String, VecDeque<Step>>,
    latencies: HashMap<String, Duration>,
    calls: HashMap<String, usize>,
    active: HashMap<String, usize>,
    max_overlap: usize,
}

/// [`SyncTask`] whose behaviour is scripted per item
///
/// Each call pops the next step of the item's script, or uses the default
/// step once the script is empty. Calls are counted per item, and the
/// highest number of concurrent calls for any single item is tracked.
#[derive(Debug)]
pub struct ScriptedTask {
    dependency: String,
    default_step: Step,
    latency: Duration,
    quota: Option<QuotaSignal>,
    state: Mutex<ScriptState>,
}

impl ScriptedTask {
    pub fn new(dependency: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            default_step: Step::Succeed,
            latency: Duration::ZERO,
            quota: None,
            state: Mutex::new(ScriptState::default()),
        }
    }

    pub fn with_default(mut self, step: Step) -> Self {
        self.default_step = step;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report `signal` to the limiter on every call.
    pub fn with_quota(mut self, signal: QuotaSignal) -> Self {
        self.quota = Some(signal);
        self
    }

    pub fn script(&self, item_id: &str, steps: impl IntoIterator<Item = Step>) {
        self.state.lock().scripts.entry(item_id.to_string()).or_default().extend(steps);
    }

    pub fn set_latency(&self, item_id: &str, latency: Duration) {
        self.state.lock().latencies.insert(item_id.to_string(), latency);
    }

    pub fn calls(&self, item_id: &str) -> usize {
        self.state.lock().calls.get(item_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    /// Highest number of simultaneous calls seen for one item.
    pub fn max_overlap(&self) -> usize {
        self.state.lock().max_overlap
    }

    fn begin(&self, item_id: &str) -> (Step, Duration) {
        let mut state = self.state.lock();
        *state.calls.entry(item_id.to_string()).or_default() += 1;
        let active = state.active.entry(item_id.to_string()).or_default();
        *active += 1;
        let active = *active;
        state.max_overlap = state.max_overlap.max(active);

        let step = state
            .scripts
            .get_mut(item_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_step.clone());
        let latency = state.latencies.get(item_id).copied().unwrap_or(self.latency);
        (step, latency)
    }

    fn end(&self, item_id: &str) {
        if let Some(active) = self.state.lock().active.get_mut(item_id) {
            *active = active.saturating_sub(1);
        }
    }
}

#[async_trait]
impl SyncTask for ScriptedTask {
    fn dependency(&self) -> &str {
        &self.dependency
    }

    async fn execute(
        &self,
        item: &WorkItem,
        ctx: &TaskContext,
    ) -> std::result::Result<TaskOutcome, SyncError> {
        let (step, latency) = self.begin(&item.id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(signal) = &self.quota {
            ctx.report_quota(signal);
        }
        self.end(&item.id);

        match step {
            Step::Succeed => Ok(TaskOutcome::success()),
            Step::Skip(reason) => Ok(TaskOutcome::skipped(reason)),
            Step::Fail(err) => Err(err),
            Step::Panic => panic!("scripted panic for item {}", item.id),
        }
    }
}
