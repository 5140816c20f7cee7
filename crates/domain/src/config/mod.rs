//! Engine configuration
//!
//! Every section deserializes with defaults, so a config file only needs the
//! values it changes. Durations are integer milliseconds; the accessor
//! methods hand out [`Duration`]s.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BAD_SUCCESS_RATE, DEFAULT_BATCH_SIZE_STEP, DEFAULT_GOOD_SUCCESS_RATE,
    DEFAULT_INITIAL_BATCH_SIZE, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MIN_BATCH_SIZE,
    HIGH_VALUE_THRESHOLD, LATENCY_WINDOW, LOW_QUANTITY_THRESHOLD, PRIORITY_HIGH_VALUE,
    PRIORITY_LAST_ATTEMPT_FAILED, PRIORITY_LOW_QUANTITY, PRIORITY_NEW_ITEM,
    PRIORITY_UPDATED_WITHIN_1H, PRIORITY_UPDATED_WITHIN_24H, PRIORITY_UPDATED_WITHIN_3H,
};
use crate::errors::{RelaySyncError, Result};

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub pool: PoolConfig,
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub retry: RetrySettings,
    pub circuit_breaker: BreakerSettings,
    pub infrastructure_breaker: BreakerSettings,
    pub default_rate_limit: RateLimitSettings,
    /// Per-dependency overrides of `default_rate_limit`
    pub rate_limits: BTreeMap<String, RateLimitSettings>,
    pub priority: PrioritySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            pool: PoolConfig::default(),
            lock: LockConfig::default(),
            cache: CacheConfig::default(),
            retry: RetrySettings::default(),
            circuit_breaker: BreakerSettings::default(),
            infrastructure_breaker: BreakerSettings::infrastructure(),
            default_rate_limit: RateLimitSettings::default(),
            rate_limits: BTreeMap::new(),
            priority: PrioritySettings::default(),
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.pool.validate()?;
        self.lock.validate()?;
        self.cache.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate("circuit_breaker")?;
        self.infrastructure_breaker.validate("infrastructure_breaker")?;
        self.default_rate_limit.validate("default_rate_limit")?;
        for (name, limit) in &self.rate_limits {
            limit.validate(&format!("rate_limits.{name}"))?;
        }
        self.priority.validate()
    }

    /// Rate limit for `dependency`, falling back to the default.
    pub fn rate_limit_for(&self, dependency: &str) -> &RateLimitSettings {
        self.rate_limits.get(dependency).unwrap_or(&self.default_rate_limit)
    }
}

fn invalid(field: &str, message: impl std::fmt::Display) -> RelaySyncError {
    RelaySyncError::Config(format!("{field}: {message}"))
}

fn check_ratio(field: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("must be within [0, 1], got {value}")))
    }
}

fn check_positive(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        Err(invalid(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */
/* Scheduler */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub batch_size_step: usize,
    /// Grow when the batch success rate reaches this
    pub good_success_rate: f64,
    /// Shrink when the batch success rate falls below this
    pub bad_success_rate: f64,
    /// Average latency at or below which a batch counts as fast
    pub fast_latency_ms: u64,
    /// Average latency above which a batch counts as slow
    pub slow_latency_ms: u64,
    pub error_backoff_base_ms: u64,
    pub error_backoff_factor: f64,
    pub error_backoff_max_ms: u64,
    /// Number of batch latencies kept for the rolling average
    pub latency_window: usize,
    /// Emit a progress snapshot every N batches (plus one at the end)
    pub snapshot_every: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: DEFAULT_INITIAL_BATCH_SIZE,
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_size_step: DEFAULT_BATCH_SIZE_STEP,
            good_success_rate: DEFAULT_GOOD_SUCCESS_RATE,
            bad_success_rate: DEFAULT_BAD_SUCCESS_RATE,
            fast_latency_ms: 1_000,
            slow_latency_ms: 5_000,
            error_backoff_base_ms: 1_000,
            error_backoff_factor: 2.0,
            error_backoff_max_ms: 30_000,
            latency_window: LATENCY_WINDOW,
            snapshot_every: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn fast_latency(&self) -> Duration {
        Duration::from_millis(self.fast_latency_ms)
    }

    pub fn slow_latency(&self) -> Duration {
        Duration::from_millis(self.slow_latency_ms)
    }

    pub fn error_backoff_base(&self) -> Duration {
        Duration::from_millis(self.error_backoff_base_ms)
    }

    pub fn error_backoff_max(&self) -> Duration {
        Duration::from_millis(self.error_backoff_max_ms)
    }

    /// Clamp a requested batch size into `[min, max]`.
    pub fn clamp_batch_size(&self, size: usize) -> usize {
        size.clamp(self.min_batch_size, self.max_batch_size)
    }

    fn validate(&self) -> Result<()> {
        if self.min_batch_size == 0 {
            return Err(invalid("scheduler.min_batch_size", "must be greater than zero"));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(invalid(
                "scheduler.min_batch_size",
                format!(
                    "{} exceeds max_batch_size {}",
                    self.min_batch_size, self.max_batch_size
                ),
            ));
        }
        check_positive("scheduler.batch_size_step", self.batch_size_step as u64)?;
        check_ratio("scheduler.good_success_rate", self.good_success_rate)?;
        check_ratio("scheduler.bad_success_rate", self.bad_success_rate)?;
        if self.bad_success_rate > self.good_success_rate {
            return Err(invalid(
                "scheduler.bad_success_rate",
                "must not exceed good_success_rate",
            ));
        }
        if self.fast_latency_ms > self.slow_latency_ms {
            return Err(invalid("scheduler.fast_latency_ms", "must not exceed slow_latency_ms"));
        }
        if self.error_backoff_factor < 1.0 {
            return Err(invalid("scheduler.error_backoff_factor", "must be at least 1.0"));
        }
        check_positive("scheduler.latency_window", self.latency_window as u64)?;
        check_positive("scheduler.snapshot_every", self.snapshot_every as u64)
    }
}

/* -------------------------------------------------------------------------- */
/* Worker pool */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub task_timeout_ms: u64,
    pub scale_check_interval_ms: u64,
    /// Queue depth above which the pool grows
    pub scale_up_queue_depth: usize,
    /// How long the queue must stay deep before growing
    pub scale_up_sustain_ms: u64,
    /// Queue depth below which idle units may be retired
    pub scale_down_queue_depth: usize,
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: default_max_workers(),
            task_timeout_ms: 30_000,
            scale_check_interval_ms: 1_000,
            scale_up_queue_depth: 4,
            scale_up_sustain_ms: 2_000,
            scale_down_queue_depth: 1,
            idle_timeout_ms: 30_000,
        }
    }
}

/// Three quarters of the available parallelism, never below two.
pub fn default_max_workers() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    (cores * 3 / 4).max(2)
}

impl PoolConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn scale_check_interval(&self) -> Duration {
        Duration::from_millis(self.scale_check_interval_ms)
    }

    pub fn scale_up_sustain(&self) -> Duration {
        Duration::from_millis(self.scale_up_sustain_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        check_positive("pool.min_workers", self.min_workers as u64)?;
        if self.min_workers > self.max_workers {
            return Err(invalid(
                "pool.min_workers",
                format!("{} exceeds max_workers {}", self.min_workers, self.max_workers),
            ));
        }
        check_positive("pool.task_timeout_ms", self.task_timeout_ms)?;
        check_positive("pool.scale_check_interval_ms", self.scale_check_interval_ms)
    }
}

/* -------------------------------------------------------------------------- */
/* Distributed lock */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Wrap each item in a distributed lock
    pub enabled: bool,
    pub ttl_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    /// Report "not acquired" at once instead of retrying
    pub skip_if_locked: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { enabled: true, ttl_ms: 30_000, retries: 3, retry_delay_ms: 200, skip_if_locked: true }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        check_positive("lock.ttl_ms", self.ttl_ms)
    }
}

/* -------------------------------------------------------------------------- */
/* Change-detection cache */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entries older than this are treated as missing
    pub max_entry_age_ms: u64,
    /// Entry limit of the in-process tier
    pub memory_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, max_entry_age_ms: 24 * 60 * 60 * 1_000, memory_capacity: 10_000 }
    }
}

impl CacheConfig {
    pub fn max_entry_age(&self) -> Duration {
        Duration::from_millis(self.max_entry_age_ms)
    }

    fn validate(&self) -> Result<()> {
        check_positive("cache.max_entry_age_ms", self.max_entry_age_ms)?;
        check_positive("cache.memory_capacity", self.memory_capacity)
    }
}

/* -------------------------------------------------------------------------- */
/* Retry */
/* -------------------------------------------------------------------------- */

/// Jitter applied to retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    None,
    Full,
    #[default]
    Equal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: JitterMode,
    /// Overall budget for one item's retries; unlimited when absent
    pub max_total_time_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: JitterMode::Equal,
            max_total_time_ms: Some(120_000),
        }
    }
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_total_time(&self) -> Option<Duration> {
        self.max_total_time_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        check_positive("retry.max_attempts", u64::from(self.max_attempts))?;
        if self.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be at least 1.0"));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(invalid("retry.initial_delay_ms", "must not exceed max_delay_ms"));
        }
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */
/* Circuit breakers */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub half_open_success_threshold: u32,
    pub reset_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_success_threshold: 2,
            reset_timeout_ms: 30_000,
            call_timeout_ms: 15_000,
        }
    }
}

impl BreakerSettings {
    /// Defaults for the breaker guarding the shared store.
    pub fn infrastructure() -> Self {
        Self {
            failure_threshold: 3,
            half_open_success_threshold: 2,
            reset_timeout_ms: 10_000,
            call_timeout_ms: 2_000,
        }
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        check_positive(&format!("{section}.failure_threshold"), u64::from(self.failure_threshold))?;
        check_positive(
            &format!("{section}.half_open_success_threshold"),
            u64::from(self.half_open_success_threshold),
        )?;
        check_positive(&format!("{section}.reset_timeout_ms"), self.reset_timeout_ms)?;
        check_positive(&format!("{section}.call_timeout_ms"), self.call_timeout_ms)
    }
}

/* -------------------------------------------------------------------------- */
/* Rate limits */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Tokens granted per window
    pub capacity: u32,
    pub window_ms: u64,
    /// Fill ratio below which `throttle` adds a proactive delay
    pub backpressure_threshold: f64,
    pub base_delay_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { capacity: 40, window_ms: 1_000, backpressure_threshold: 0.2, base_delay_ms: 500 }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        check_positive(&format!("{section}.capacity"), u64::from(self.capacity))?;
        check_positive(&format!("{section}.window_ms"), self.window_ms)?;
        check_ratio(&format!("{section}.backpressure_threshold"), self.backpressure_threshold)
    }
}

/* -------------------------------------------------------------------------- */
/* Priority scoring */
/* -------------------------------------------------------------------------- */

/// Weights of the additive urgency signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritySettings {
    pub last_attempt_failed: i64,
    pub updated_within_1h: i64,
    pub updated_within_3h: i64,
    pub updated_within_24h: i64,
    pub new_item: i64,
    pub low_quantity: i64,
    pub high_value: i64,
    /// Quantities at or below this count as low
    pub low_quantity_threshold: i64,
    /// Unit values at or above this count as high
    pub high_value_threshold: f64,
}

impl Default for PrioritySettings {
    fn default() -> Self {
        Self {
            last_attempt_failed: PRIORITY_LAST_ATTEMPT_FAILED,
            updated_within_1h: PRIORITY_UPDATED_WITHIN_1H,
            updated_within_3h: PRIORITY_UPDATED_WITHIN_3H,
            updated_within_24h: PRIORITY_UPDATED_WITHIN_24H,
            new_item: PRIORITY_NEW_ITEM,
            low_quantity: PRIORITY_LOW_QUANTITY,
            high_value: PRIORITY_HIGH_VALUE,
            low_quantity_threshold: LOW_QUANTITY_THRESHOLD,
            high_value_threshold: HIGH_VALUE_THRESHOLD,
        }
    }
}

impl PrioritySettings {
    fn validate(&self) -> Result<()> {
        if self.high_value_threshold.is_finite() {
            Ok(())
        } else {
            Err(invalid("priority.high_value_threshold", "must be a finite number"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.initial_batch_size, 10);
        assert_eq!(config.infrastructure_breaker.failure_threshold, 3);
        assert!(config.pool.max_workers >= 2);
    }

    #[test]
    fn rejects_inverted_batch_bounds() {
        let mut config = EngineConfig::default();
        config.scheduler.min_batch_size = 50;
        config.scheduler.max_batch_size = 20;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scheduler.min_batch_size"));
    }

    #[test]
    fn rejects_inverted_success_rates() {
        let mut config = EngineConfig::default();
        config.scheduler.bad_success_rate = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = EngineConfig::default();
        config.default_rate_limit.backpressure_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_capacity_override() {
        let mut config = EngineConfig::default();
        config
            .rate_limits
            .insert("erp".into(), RateLimitSettings { capacity: 0, ..Default::default() });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limits.erp.capacity"));
    }

    #[test]
    fn rate_limit_lookup_falls_back_to_default() {
        let mut config = EngineConfig::default();
        config
            .rate_limits
            .insert("shop".into(), RateLimitSettings { capacity: 2, ..Default::default() });
        assert_eq!(config.rate_limit_for("shop").capacity, 2);
        assert_eq!(config.rate_limit_for("erp").capacity, 40);
    }

    #[test]
    fn priority_weights_are_configurable() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "priority": { "new_item": 0, "last_attempt_failed": 500 }
        }))
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.priority.new_item, 0);
        assert_eq!(config.priority.last_attempt_failed, 500);
        assert_eq!(config.priority.updated_within_1h, PRIORITY_UPDATED_WITHIN_1H);

        let mut config = EngineConfig::default();
        config.priority.high_value_threshold = f64::NAN;
        assert!(config.validate().unwrap_err().to_string().contains("priority.high_value_threshold"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "scheduler": { "initial_batch_size": 25 },
            "lock": { "skip_if_locked": false }
        }))
        .unwrap();
        assert_eq!(config.scheduler.initial_batch_size, 25);
        assert_eq!(config.scheduler.max_batch_size, 100);
        assert!(!config.lock.skip_if_locked);
        assert_eq!(config.lock.ttl_ms, 30_000);
        assert_eq!(config.infrastructure_breaker.call_timeout_ms, 2_000);
    }
}
