//! Per-dependency token bucket with proactive backpressure.
//!
//! Tokens refill continuously at `capacity / window`. Callers either poll
//! with [`RateLimiter::try_acquire`] or wait in arrival order with
//! [`RateLimiter::acquire`]. [`RateLimiter::throttle`] additionally slows
//! callers down once the bucket drains below the backpressure threshold, so
//! the upstream quota is approached gradually instead of being hit.
//!
//! Quota signals reported by the dependency itself (remaining calls, limit,
//! reset time, retry-after) are folded back into the bucket through
//! [`RateLimiter::update_limit_from_response`].
//!
//! Besides the token count, a sliding log of grant instants caps grants at
//! `capacity` within any `window`. A full bucket plus continuous refill
//! could otherwise admit up to twice the capacity in one window.
//!
//! None of the operations fail: a limiter with no signals keeps managing
//! itself from elapsed time.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use super::clock::{Clock, TokioClock};
use super::circuit_breaker::{ConfigError, ConfigResult};

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Longest pause or reset delay a dependency's quota signal can impose.
/// Larger values are clamped to this.
pub const MAX_QUOTA_HINT: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for one dependency's rate budget
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum number of tokens the bucket can hold
    pub capacity: u32,
    /// Time over which a fully drained bucket refills
    pub window: Duration,
    /// Fill ratio below which `throttle` starts adding delay
    pub backpressure_threshold: f64,
    /// Delay applied by `throttle` when the bucket is empty
    pub base_delay: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 40,
            window: Duration::from_secs(1),
            backpressure_threshold: 0.2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RateLimiterConfig {
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::default()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "capacity must be greater than 0".to_string(),
            });
        }
        if self.window.is_zero() {
            return Err(ConfigError::Invalid {
                message: "window must be greater than zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.backpressure_threshold) {
            return Err(ConfigError::Invalid {
                message: "backpressure_threshold must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for RateLimiterConfig
#[derive(Debug, Default)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn backpressure_threshold(mut self, threshold: f64) -> Self {
        self.config.backpressure_threshold = threshold;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Live quota information reported by a dependency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaSignal {
    /// Calls the dependency says are still available
    pub remaining: Option<u32>,
    /// The dependency's advertised limit
    pub limit: Option<u32>,
    /// Time until the dependency's quota window resets
    pub reset_after: Option<Duration>,
    /// Explicit instruction to stop calling for a while
    pub retry_after: Option<Duration>,
}

impl QuotaSignal {
    pub fn retry_after(delay: Duration) -> Self {
        Self { retry_after: Some(delay), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_none()
            && self.limit.is_none()
            && self.reset_after.is_none()
            && self.retry_after.is_none()
    }

    /// Parse the common quota headers. Header names are matched
    /// case-insensitively; unparseable values are ignored.
    ///
    /// Recognised: `x-ratelimit-remaining`, `x-ratelimit-limit`,
    /// `x-ratelimit-reset` (delta seconds or epoch seconds), `retry-after`
    /// (delta seconds) and the `used/limit` form of
    /// `x-shopify-shop-api-call-limit`.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut signal = Self::default();
        for (name, value) in headers {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "x-ratelimit-remaining" | "ratelimit-remaining" => {
                    signal.remaining = value.parse().ok();
                }
                "x-ratelimit-limit" | "ratelimit-limit" => {
                    signal.limit = value.parse().ok();
                }
                "x-ratelimit-reset" | "ratelimit-reset" => {
                    signal.reset_after = parse_reset(value);
                }
                "retry-after" => {
                    signal.retry_after = value
                        .parse::<f64>()
                        .ok()
                        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                        .map(|delay| delay.min(MAX_QUOTA_HINT));
                }
                "x-shopify-shop-api-call-limit" => {
                    if let Some((used, limit)) = value.split_once('/') {
                        if let (Ok(used), Ok(limit)) =
                            (used.trim().parse::<u32>(), limit.trim().parse::<u32>())
                        {
                            signal.limit = Some(limit);
                            signal.remaining = Some(limit.saturating_sub(used));
                        }
                    }
                }
                _ => {}
            }
        }
        signal
    }
}

/// Values this large are absolute epoch seconds rather than deltas.
const EPOCH_THRESHOLD_SECS: u64 = 1_000_000_000;

fn parse_reset(value: &str) -> Option<Duration> {
    let secs = value.parse::<u64>().ok()?;
    let delta = if secs < EPOCH_THRESHOLD_SECS {
        secs
    } else {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        secs.saturating_sub(now)
    };
    Some(Duration::from_secs(delta).min(MAX_QUOTA_HINT))
}

/// Point-in-time view of one limiter
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitInfo {
    pub name: String,
    pub tokens: f64,
    pub capacity: u32,
    pub refill_per_second: f64,
    pub fill_ratio: f64,
    pub reset_in_ms: Option<u64>,
    pub paused_for_ms: Option<u64>,
    pub grants_in_window: usize,
    pub acquired_total: u64,
    pub throttled_total: u64,
    pub throttled_delay_total_ms: u64,
}

#[derive(Debug)]
struct Bucket {
    capacity: u32,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: Instant,
    refill_paused_until: Option<Instant>,
    reset_at: Option<Instant>,
    grants: VecDeque<Instant>,
    acquired_total: u64,
    throttled_total: u64,
    throttled_delay_total: Duration,
}

impl Bucket {
    fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity,
            tokens: f64::from(config.capacity),
            refill_per_ms: refill_rate(config.capacity, config.window),
            last_refill: now,
            refill_paused_until: None,
            reset_at: None,
            grants: VecDeque::with_capacity(config.capacity as usize),
            acquired_total: 0,
            throttled_total: 0,
            throttled_delay_total: Duration::ZERO,
        }
    }

    fn refill(&mut self, now: Instant) {
        if let Some(until) = self.refill_paused_until {
            if now < until {
                self.last_refill = now;
                return;
            }
            self.last_refill = self.last_refill.max(until);
            self.refill_paused_until = None;
        }
        if let Some(reset_at) = self.reset_at {
            if now >= reset_at {
                self.reset_at = None;
            }
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let gained = elapsed.as_secs_f64() * 1000.0 * self.refill_per_ms;
        self.tokens = (self.tokens + gained).min(f64::from(self.capacity));
        self.last_refill = now;
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.grants.front() {
            if now.saturating_duration_since(*front) >= window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until a grant could succeed, or zero if it can succeed now.
    fn wait_time(&self, now: Instant, window: Duration) -> Duration {
        let paused = self
            .refill_paused_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now));
        let token_wait = if self.tokens >= 1.0 {
            Duration::ZERO
        } else if self.refill_per_ms > 0.0 {
            paused + Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_ms / 1000.0)
        } else {
            paused.max(window)
        };
        let guard_wait = if self.grants.len() < self.capacity as usize {
            Duration::ZERO
        } else {
            // Enough of the oldest grants must age out to drop below capacity.
            let excess = self.grants.len() - self.capacity as usize;
            self.grants
                .get(excess)
                .map_or(Duration::ZERO, |t| (*t + window).saturating_duration_since(now))
        };
        token_wait.max(guard_wait)
    }

    fn fill_ratio(&self) -> f64 {
        self.tokens / f64::from(self.capacity)
    }
}

fn refill_rate(capacity: u32, window: Duration) -> f64 {
    let window_ms = window.as_secs_f64() * 1000.0;
    if window_ms <= 0.0 {
        return 0.0;
    }
    f64::from(capacity) / window_ms
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Token bucket rate limiter for one dependency
pub struct RateLimiter<C: Clock = TokioClock> {
    name: String,
    config: RateLimiterConfig,
    bucket: Mutex<Bucket>,
    /// Fair queue: waiters are served in arrival order.
    queue: tokio::sync::Mutex<()>,
    clock: C,
}

impl<C: Clock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter<TokioClock> {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, TokioClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a limiter with a custom clock.
    ///
    /// `acquire` and `throttle` sleep on tokio's timer, so the clock must
    /// advance alongside it; a [`MockClock`](super::MockClock) is only
    /// suitable for `try_acquire`-based tests.
    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config, clock))
    }

    pub(crate) fn from_validated(name: String, config: RateLimiterConfig, clock: C) -> Self {
        let bucket = Bucket::new(&config, clock.now());
        Self {
            name,
            config,
            bucket: Mutex::new(bucket),
            queue: tokio::sync::Mutex::new(()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take one token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.try_take().is_ok()
    }

    fn try_take(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock();
        bucket.refill(now);
        bucket.prune(now, self.config.window);
        let wait = bucket.wait_time(now, self.config.window);
        if wait.is_zero() {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            bucket.grants.push_back(now);
            bucket.acquired_total += 1;
            Ok(())
        } else {
            Err(wait.max(MIN_WAIT))
        }
    }

    /// Wait until a token is available and take it.
    ///
    /// Waiters are released in arrival order; only the head of the queue
    /// sleeps on the bucket.
    pub async fn acquire(&self) {
        let _turn = self.queue.lock().await;
        loop {
            match self.try_take() {
                Ok(()) => return,
                Err(wait) => {
                    trace!(limiter = %self.name, wait_ms = millis(wait), "rate_limit.waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Acquire a token, then add a proactive delay if the bucket is running
    /// low. Returns the delay that was applied.
    ///
    /// The delay grows quadratically with scarcity: with `f = (threshold -
    /// ratio) / threshold`, the caller sleeps `base_delay * f²`.
    pub async fn throttle(&self) -> Duration {
        self.acquire().await;
        let delay = {
            let mut bucket = self.bucket.lock();
            let delay = backpressure_delay(
                bucket.fill_ratio(),
                self.config.backpressure_threshold,
                self.config.base_delay,
            );
            if !delay.is_zero() {
                bucket.throttled_total += 1;
                bucket.throttled_delay_total += delay;
            }
            delay
        };
        if !delay.is_zero() {
            debug!(limiter = %self.name, delay_ms = millis(delay), "rate_limit.backpressure");
            tokio::time::sleep(delay).await;
        }
        delay
    }

    /// Fold a quota signal reported by the dependency into the bucket.
    pub fn update_limit_from_response(&self, signal: &QuotaSignal) {
        if signal.is_empty() {
            return;
        }
        let now = self.clock.now();
        let mut bucket = self.bucket.lock();
        bucket.refill(now);

        if let Some(limit) = signal.limit.filter(|l| *l > 0) {
            bucket.capacity = limit;
            bucket.refill_per_ms = refill_rate(limit, self.config.window);
            bucket.tokens = bucket.tokens.min(f64::from(limit));
        }
        if let Some(reset_after) = signal.reset_after.filter(|d| !d.is_zero()) {
            let reset_after = reset_after.min(MAX_QUOTA_HINT);
            bucket.refill_per_ms = refill_rate(bucket.capacity, reset_after);
            bucket.reset_at = now.checked_add(reset_after);
        }
        if let Some(remaining) = signal.remaining {
            bucket.tokens = bucket.tokens.min(f64::from(remaining));
        }
        if let Some(retry_after) = signal.retry_after {
            bucket.tokens = 0.0;
            bucket.refill_paused_until = now.checked_add(retry_after.min(MAX_QUOTA_HINT));
        }

        debug!(
            limiter = %self.name,
            tokens = bucket.tokens,
            capacity = bucket.capacity,
            retry_after_ms = signal.retry_after.map(millis),
            "rate_limit.signal_applied"
        );
    }

    /// Current budget and lifetime counters.
    pub fn limit_info(&self) -> RateLimitInfo {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock();
        bucket.refill(now);
        bucket.prune(now, self.config.window);
        RateLimitInfo {
            name: self.name.clone(),
            tokens: bucket.tokens,
            capacity: bucket.capacity,
            refill_per_second: bucket.refill_per_ms * 1000.0,
            fill_ratio: bucket.fill_ratio(),
            reset_in_ms: bucket.reset_at.map(|at| millis(at.saturating_duration_since(now))),
            paused_for_ms: bucket
                .refill_paused_until
                .map(|until| millis(until.saturating_duration_since(now))),
            grants_in_window: bucket.grants.len(),
            acquired_total: bucket.acquired_total,
            throttled_total: bucket.throttled_total,
            throttled_delay_total_ms: millis(bucket.throttled_delay_total),
        }
    }

    /// Restore the configured capacity and a full bucket.
    pub fn reset(&self) {
        let now = self.clock.now();
        *self.bucket.lock() = Bucket::new(&self.config, now);
    }
}

fn backpressure_delay(fill_ratio: f64, threshold: f64, base_delay: Duration) -> Duration {
    if threshold <= 0.0 || fill_ratio >= threshold {
        return Duration::ZERO;
    }
    let scarcity = ((threshold - fill_ratio) / threshold).clamp(0.0, 1.0);
    base_delay.mul_f64(scarcity * scarcity)
}
