//! Three-state circuit breaker with per-call timeout.
//!
//! A breaker isolates one named dependency. It passes calls through while
//! `Closed`, fails fast while `Open`, and admits a bounded number of trial
//! calls while `HalfOpen`. The only legal automatic transitions are
//! `Closed -> Open -> HalfOpen -> {Closed, Open}`; [`CircuitBreaker::reset`]
//! is the manual override that forces `Closed`.
//!
//! All counters live behind one mutex so a transition and the counters that
//! caused it are always observed together. Observers run after the lock is
//! released.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, TokioClock};
use crate::error::{ErrorClassification, ErrorSeverity};

//==============================================================================
// Error Types
//==============================================================================

/// Simple configuration error for validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Configuration result type using simple config errors
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced by a breaker-guarded call
///
/// Generic over the underlying operation error type `E` so the original
/// error survives the breaker untouched.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls
    #[error("Circuit breaker '{name}' is open, rejecting calls")]
    CircuitOpen { name: String },

    /// Operation exceeded the breaker's per-call timeout
    #[error("Operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The underlying operation failed
    #[error("Operation failed: {source}")]
    OperationFailed {
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Returns the wrapped operation error, if the operation itself failed.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl<E> ErrorClassification for ResilienceError<E>
where
    E: std::error::Error + ErrorClassification + Send + Sync + 'static,
{
    fn is_retryable(&self) -> bool {
        match self {
            // Recovery is left to the breaker's own half-open probing.
            Self::CircuitOpen { .. } => false,
            Self::Timeout { .. } => true,
            Self::OperationFailed { source } => source.is_retryable(),
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CircuitOpen { .. } | Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::OperationFailed { source } => source.severity(),
        }
    }

    fn is_critical(&self) -> bool {
        match self {
            Self::OperationFailed { source } => source.is_critical(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::OperationFailed { source } => source.retry_after(),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::OperationFailed { source } => source.kind(),
        }
    }
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

//==============================================================================
// State and Configuration
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) that open the circuit
    pub failure_threshold: u32,
    /// Trial calls admitted in half-open; all must succeed to close
    pub half_open_success_threshold: u32,
    /// Time spent open before the next call may probe the dependency
    pub reset_timeout: Duration,
    /// Upper bound on a single guarded call; expiry counts as a failure
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "failure_threshold must be greater than 0".to_string(),
            });
        }

        if self.half_open_success_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "half_open_success_threshold must be greater than 0".to_string(),
            });
        }

        if self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                message: "call_timeout must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn half_open_success_threshold(mut self, threshold: u32) -> Self {
        self.config.half_open_success_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Metrics and Transitions
//==============================================================================

/// Why a breaker changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    FailureThreshold,
    ResetTimeoutElapsed,
    HalfOpenFailure,
    HalfOpenSucceeded,
    ManualReset,
}

/// One state change, delivered to observers and the metrics sink
#[derive(Debug, Clone, Serialize)]
pub struct CircuitTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// Callback invoked on every state transition.
pub type TransitionObserver = Arc<dyn Fn(&CircuitTransition) + Send + Sync>;

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub timeouts: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_transition: Option<DateTime<Utc>>,
    /// Failure counts bucketed by `ErrorClassification::kind`
    pub error_histogram: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition; outcomes from an older generation only
    /// update counters.
    generation: u64,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_calls: u64,
    successes: u64,
    failures: u64,
    rejected: u64,
    timeouts: u64,
    last_transition: Option<DateTime<Utc>>,
    error_histogram: HashMap<&'static str, u64>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            opened_at: None,
            half_open_admitted: 0,
            half_open_successes: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_calls: 0,
            successes: 0,
            failures: 0,
            rejected: 0,
            timeouts: 0,
            last_transition: None,
            error_histogram: HashMap::new(),
        }
    }

    fn transition(
        &mut self,
        name: &str,
        to: CircuitState,
        reason: TransitionReason,
        now: Instant,
    ) -> CircuitTransition {
        let from = self.state;
        let at = Utc::now();
        self.state = to;
        self.generation += 1;
        self.half_open_admitted = 0;
        self.half_open_successes = 0;
        self.last_transition = Some(at);
        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {}
        }
        CircuitTransition { name: name.to_string(), from, to, reason, at }
    }
}

/// Admission ticket for one guarded call.
///
/// If the call is dropped before an outcome is recorded (the caller's future
/// was cancelled), the half-open slot it occupied is handed back.
struct Permit<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    generation: u64,
    half_open: bool,
    settled: bool,
}

impl<C: Clock> Drop for Permit<'_, C> {
    fn drop(&mut self) {
        if self.settled || !self.half_open {
            return;
        }
        let mut inner = self.breaker.inner.lock();
        if inner.generation == self.generation && inner.half_open_admitted > 0 {
            inner.half_open_admitted -= 1;
        }
    }
}

//==============================================================================
// Circuit Breaker
//==============================================================================

/// Circuit breaker guarding one named dependency
pub struct CircuitBreaker<C: Clock = TokioClock> {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    observers: RwLock<Vec<TransitionObserver>>,
    clock: C,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker<TokioClock> {
    /// Create a breaker driven by tokio's clock
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, TokioClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config, clock))
    }

    pub(crate) fn from_validated(name: String, config: CircuitBreakerConfig, clock: C) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::new()),
            observers: RwLock::new(Vec::new()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register a callback invoked after every state transition
    pub fn add_observer(&self, observer: TransitionObserver) {
        self.observers.write().push(observer);
    }

    /// Current state, applying the lazy `Open -> HalfOpen` move if the reset
    /// timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.maybe_half_open(&mut inner);
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    /// Snapshot of counters and the error histogram
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state();
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state,
            total_calls: inner.total_calls,
            successes: inner.successes,
            failures: inner.failures,
            rejected: inner.rejected,
            timeouts: inner.timeouts,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_transition: inner.last_transition,
            error_histogram: inner
                .error_histogram
                .iter()
                .map(|(kind, count)| ((*kind).to_string(), *count))
                .collect(),
        }
    }

    /// Force the breaker closed and clear every counter.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let transition = (inner.state != CircuitState::Closed).then(|| {
                inner.transition(
                    &self.name,
                    CircuitState::Closed,
                    TransitionReason::ManualReset,
                    self.clock.now(),
                )
            });
            let generation = inner.generation;
            let last_transition = inner.last_transition;
            *inner = BreakerState::new();
            inner.generation = generation;
            inner.last_transition = last_transition;
            transition
        };
        info!(breaker = %self.name, "circuit.reset");
        self.notify(transition);
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// The operation is raced against `call_timeout`; expiry is recorded as a
    /// failure and the operation future is dropped. While the circuit is
    /// open the operation is never invoked.
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        let Some(mut permit) = self.admit() else {
            debug!(breaker = %self.name, "circuit.rejected");
            return Err(ResilienceError::CircuitOpen { name: self.name.clone() });
        };

        let outcome = tokio::time::timeout(self.config.call_timeout, operation()).await;
        permit.settled = true;

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(&permit);
                Ok(value)
            }
            Ok(Err(error)) => {
                debug!(breaker = %self.name, error = %error, kind = error.kind(), "circuit.call_failed");
                self.record_failure(&permit, error.kind(), false);
                Err(ResilienceError::OperationFailed { source: error })
            }
            Err(_) => {
                warn!(
                    breaker = %self.name,
                    timeout_ms = self.config.call_timeout.as_millis() as u64,
                    "circuit.call_timeout"
                );
                self.record_failure(&permit, "timeout", true);
                Err(ResilienceError::Timeout { timeout: self.config.call_timeout })
            }
        }
    }

    /// Like [`execute`](Self::execute), but a rejected call resolves to the
    /// fallback value instead of `CircuitOpen`.
    ///
    /// Failures and timeouts of admitted calls are still returned as errors.
    pub async fn execute_with_fallback<F, Fut, T, E, FB>(
        &self,
        operation: F,
        fallback: FB,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
        FB: FnOnce() -> T,
    {
        match self.execute(operation).await {
            Err(ResilienceError::CircuitOpen { .. }) => {
                debug!(breaker = %self.name, "circuit.fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    fn admit(&self) -> Option<Permit<'_, C>> {
        let (permit, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.maybe_half_open(&mut inner);
            let admitted = match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    inner.half_open_admitted < self.config.half_open_success_threshold
                }
            };
            let permit = if admitted {
                inner.total_calls += 1;
                let half_open = inner.state == CircuitState::HalfOpen;
                if half_open {
                    inner.half_open_admitted += 1;
                }
                Some(Permit {
                    breaker: self,
                    generation: inner.generation,
                    half_open,
                    settled: false,
                })
            } else {
                inner.rejected += 1;
                None
            };
            (permit, transition)
        };
        self.notify(transition);
        permit
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) -> Option<CircuitTransition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        let now = self.clock.now();
        if now.saturating_duration_since(opened_at) < self.config.reset_timeout {
            return None;
        }
        Some(inner.transition(
            &self.name,
            CircuitState::HalfOpen,
            TransitionReason::ResetTimeoutElapsed,
            now,
        ))
    }

    fn record_success(&self, permit: &Permit<'_, C>) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.successes += 1;
            inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
            inner.consecutive_failures = 0;

            if inner.generation != permit.generation {
                None
            } else if inner.state == CircuitState::HalfOpen {
                inner.half_open_successes += 1;
                (inner.half_open_successes >= self.config.half_open_success_threshold).then(
                    || {
                        inner.transition(
                            &self.name,
                            CircuitState::Closed,
                            TransitionReason::HalfOpenSucceeded,
                            self.clock.now(),
                        )
                    },
                )
            } else {
                None
            }
        };
        self.notify(transition);
    }

    fn record_failure(&self, permit: &Permit<'_, C>, kind: &'static str, timed_out: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failures += 1;
            if timed_out {
                inner.timeouts += 1;
            }
            *inner.error_histogram.entry(kind).or_insert(0) += 1;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.consecutive_successes = 0;

            if inner.generation != permit.generation {
                None
            } else {
                match inner.state {
                    CircuitState::Closed
                        if inner.consecutive_failures >= self.config.failure_threshold =>
                    {
                        Some(inner.transition(
                            &self.name,
                            CircuitState::Open,
                            TransitionReason::FailureThreshold,
                            self.clock.now(),
                        ))
                    }
                    CircuitState::HalfOpen => Some(inner.transition(
                        &self.name,
                        CircuitState::Open,
                        TransitionReason::HalfOpenFailure,
                        self.clock.now(),
                    )),
                    _ => None,
                }
            }
        };
        self.notify(transition);
    }

    fn notify(&self, transition: Option<CircuitTransition>) {
        let Some(transition) = transition else {
            return;
        };
        match transition.to {
            CircuitState::Open => warn!(
                breaker = %transition.name,
                from = %transition.from,
                reason = ?transition.reason,
                "circuit.opened"
            ),
            _ => info!(
                breaker = %transition.name,
                from = %transition.from,
                to = %transition.to,
                reason = ?transition.reason,
                "circuit.transition"
            ),
        }
        let observers = self.observers.read().clone();
        for observer in observers {
            observer(&transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::CommonError;
    use crate::resilience::clock::MockClock;

    fn breaker(threshold: u32, half_open: u32) -> (CircuitBreaker<MockClock>, MockClock) {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .half_open_success_threshold(half_open)
            .reset_timeout(Duration::from_secs(30))
            .call_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        (CircuitBreaker::with_clock("shop", config, clock.clone()).unwrap(), clock)
    }

    async fn fail(cb: &CircuitBreaker<MockClock>) -> ResilienceResult<(), CommonError> {
        cb.execute(|| async { Err::<(), _>(CommonError::backend("shop", "502", true)) }).await
    }

    async fn succeed(cb: &CircuitBreaker<MockClock>) -> ResilienceResult<u32, CommonError> {
        cb.execute(|| async { Ok::<_, CommonError>(7) }).await
    }

    #[test]
    fn config_validation_rejects_zero_thresholds() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().half_open_success_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().call_timeout(Duration::ZERO).build().is_err());
        assert!(CircuitBreakerConfig::builder().build().is_ok());
    }

    #[tokio::test]
    async fn opens_exactly_at_failure_threshold() {
        let (cb, _clock) = breaker(3, 2);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let (cb, _clock) = breaker(3, 2);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_invoking_operation() {
        let (cb, _clock) = breaker(3, 2);
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }

        let invoked = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CommonError>(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { ref name }) if name == "shop"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().rejected, 1);
    }

    #[tokio::test]
    async fn moves_to_half_open_after_reset_timeout() {
        let (cb, clock) = breaker(1, 2);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(29));
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn single_half_open_success_below_threshold_keeps_half_open() {
        let (cb, clock) = breaker(1, 2);
        fail(&cb).await.unwrap_err();
        clock.advance(Duration::from_secs(30));

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_restarts_timer() {
        let (cb, clock) = breaker(1, 2);
        fail(&cb).await.unwrap_err();
        clock.advance(Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(29));
        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_admits_bounded_trial_calls() {
        let (cb, clock) = breaker(1, 1);
        let cb = Arc::new(cb);
        fail(&cb).await.unwrap_err();
        clock.advance(Duration::from_secs(30));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, CommonError>(())
                })
                .await
            })
        };
        started_rx.await.unwrap();

        let second = succeed(&cb).await;
        assert!(matches!(second, Err(ResilienceError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .call_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let cb = CircuitBreaker::new("slow", config).unwrap();

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, CommonError>(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
        let metrics = cb.metrics();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.error_histogram.get("timeout"), Some(&1));
    }

    #[tokio::test]
    async fn fallback_is_used_only_when_rejected() {
        let (cb, _clock) = breaker(1, 1);

        let failed = cb
            .execute_with_fallback(
                || async { Err::<u32, _>(CommonError::backend("shop", "500", true)) },
                || 0,
            )
            .await;
        assert!(failed.is_err());

        let rejected = cb
            .execute_with_fallback(|| async { Ok::<_, CommonError>(1) }, || 42)
            .await
            .unwrap();
        assert_eq!(rejected, 42);
    }

    #[tokio::test]
    async fn observers_see_transitions_in_order() {
        let (cb, clock) = breaker(1, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cb.add_observer(Arc::new(move |t: &CircuitTransition| {
            sink.lock().push((t.from, t.to, t.reason));
        }));

        fail(&cb).await.unwrap_err();
        clock.advance(Duration::from_secs(30));
        succeed(&cb).await.unwrap();

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (CircuitState::Closed, CircuitState::Open, TransitionReason::FailureThreshold),
                (CircuitState::Open, CircuitState::HalfOpen, TransitionReason::ResetTimeoutElapsed),
                (CircuitState::HalfOpen, CircuitState::Closed, TransitionReason::HalfOpenSucceeded),
            ]
        );
    }

    #[tokio::test]
    async fn error_histogram_buckets_by_kind() {
        let (cb, _clock) = breaker(10, 1);
        fail(&cb).await.unwrap_err();
        cb.execute(|| async {
            Err::<(), _>(CommonError::validation("sku", "empty"))
        })
        .await
        .unwrap_err();

        let metrics = cb.metrics();
        assert_eq!(metrics.error_histogram.get("backend"), Some(&1));
        assert_eq!(metrics.error_histogram.get("validation"), Some(&1));
        assert_eq!(metrics.failures, 2);
        assert_eq!(metrics.total_calls, 2);
    }

    #[tokio::test]
    async fn manual_reset_closes_and_clears_counters() {
        let (cb, _clock) = breaker(1, 1);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failures, 0);
        assert!(metrics.last_transition.is_some());
        succeed(&cb).await.unwrap();
    }
}
