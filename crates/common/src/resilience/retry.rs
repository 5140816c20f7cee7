//! Retry with backoff, jitter and pluggable retry decisions
//!
//! [`RetryExecutor`] re-runs a fallible async operation until it succeeds,
//! the [`RetryPolicy`] says stop, the attempt budget is spent, or the total
//! time budget runs out. The last error is always handed back to the caller.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::error::ErrorClassification;

/// Longest delay honoured from [`RetryDecision::RetryAfter`]; larger
/// requests wait this long.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors that can occur during retry operations
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All retry attempts have been exhausted
    #[error("All retry attempts exhausted after {attempts} tries: {source}")]
    AttemptsExhausted { attempts: u32, source: E },

    /// The operation failed with a non-retryable error
    #[error("Operation failed with non-retryable error: {source}")]
    NonRetryable { source: E },

    /// The retry strategy configuration is invalid
    #[error("Invalid retry configuration: {message}")]
    InvalidConfiguration { message: String },

    /// The total retry time budget ran out before another attempt
    #[error("Retry timeout exceeded after {elapsed:?}")]
    TimeoutExceeded { elapsed: Duration, last: Option<E> },
}

impl<E> RetryError<E> {
    /// The error returned by the last attempt, if any.
    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::AttemptsExhausted { source, .. } | Self::NonRetryable { source } => Some(source),
            Self::TimeoutExceeded { last, .. } => last,
            Self::InvalidConfiguration { .. } => None,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including result and summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: RetryResult<T, E>,
    pub attempts: u32,
    pub total_delay: Duration,
    pub timed_out: bool,
    /// Human-readable representation of the last error that occurred.
    pub last_error: Option<String>,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Average sleep between attempts (excludes operation execution time).
    pub fn average_delay(&self) -> Duration {
        if self.attempts <= 1 {
            return Duration::ZERO;
        }
        self.total_delay / (self.attempts - 1)
    }
}

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Decide what to do after `attempt` (0-based) failed with `error`
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation with the default backoff delay
    Retry,
    /// Retry the operation with a custom delay
    RetryAfter(Duration),
    /// Don't retry the operation
    Stop,
}

/// Backoff strategy for calculating retry delays
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Linear backoff: initial_delay + (attempt * increment)
    Linear { initial_delay: Duration, increment: Duration },
    /// Exponential backoff: initial_delay * base^attempt, capped
    Exponential { initial_delay: Duration, base: f64, max_delay: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay before the retry that follows `attempt`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Linear { initial_delay, increment } => {
                *initial_delay + increment.saturating_mul(attempt)
            }
            BackoffStrategy::Exponential { initial_delay, base, max_delay } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let delay = initial_delay.as_secs_f64() * base.powi(exponent);
                if !delay.is_finite() || delay >= max_delay.as_secs_f64() {
                    *max_delay
                } else {
                    Duration::from_secs_f64(delay.max(0.0))
                }
            }
        }
    }
}

/// Jitter type for adding randomness to retry delays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter
    None,
    /// Full jitter: 0 to calculated_delay
    Full,
    /// Equal jitter: calculated_delay/2 to calculated_delay
    Equal,
    /// Decorrelated jitter: base to 3x the previous delay
    Decorrelated { base: Duration },
}

impl Jitter {
    /// Apply jitter to the calculated delay
    pub fn apply(&self, delay: Duration, attempt: u32) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => random_between(Duration::ZERO, delay),
            Jitter::Equal => {
                let half = delay / 2;
                random_between(half, delay)
            }
            Jitter::Decorrelated { base } => {
                let previous = if attempt == 0 { *base } else { delay };
                random_between(*base, (previous * 3).max(*base))
            }
        }
    }
}

fn random_between(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let span = u64::try_from((high - low).as_micros()).unwrap_or(u64::MAX);
    low + Duration::from_micros(rand::thread_rng().gen_range(0..=span))
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
    /// Jitter type for randomizing delays
    pub jitter: Jitter,
    /// Maximum total time to spend retrying
    pub max_total_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                initial_delay: Duration::from_millis(200),
                base: 2.0,
                max_delay: Duration::from_secs(10),
            },
            jitter: Jitter::Equal,
            max_total_time: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RetryError<()>> {
        if self.max_attempts == 0 {
            return Err(RetryError::InvalidConfiguration {
                message: "max_attempts must be greater than 0".to_string(),
            });
        }

        match &self.backoff {
            BackoffStrategy::Exponential { base, .. } if *base <= 0.0 => {
                return Err(RetryError::InvalidConfiguration {
                    message: "exponential base must be greater than 0".to_string(),
                });
            }
            _ => {}
        }

        Ok(())
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Fixed(delay);
        self
    }

    pub fn linear_backoff(mut self, initial_delay: Duration, increment: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Linear { initial_delay, increment };
        self
    }

    pub fn exponential_backoff(
        mut self,
        initial_delay: Duration,
        base: f64,
        max_delay: Duration,
    ) -> Self {
        self.config.backoff = BackoffStrategy::Exponential { initial_delay, base, max_delay };
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = Jitter::None;
        self
    }

    pub fn full_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Full;
        self
    }

    pub fn equal_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Equal;
        self
    }

    pub fn max_total_time(mut self, duration: Duration) -> Self {
        self.config.max_total_time = Some(duration);
        self
    }

    pub fn unlimited_time(mut self) -> Self {
        self.config.max_total_time = None;
        self
    }

    pub fn build(self) -> Result<RetryConfig, RetryError<()>> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// The main retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor<P> {
    config: RetryConfig,
    policy: P,
}

impl<P> RetryExecutor<P> {
    /// Create a new retry executor with the given configuration and policy
    pub fn new(config: RetryConfig, policy: P) -> Self {
        Self { config, policy }
    }

    /// Create with default configuration
    pub fn with_policy(policy: P) -> Self {
        Self::new(RetryConfig::default(), policy)
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    #[instrument(skip(self, operation), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(operation).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;
        let mut total_delay = Duration::ZERO;

        loop {
            let attempt_number = attempt + 1;
            debug!(attempt = attempt_number, max = self.config.max_attempts, "retry.attempt");

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "retry.recovered");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt_number,
                        total_delay,
                        timed_out: false,
                        last_error: None,
                    };
                }
                Err(error) => error,
            };
            let last_error = Some(error.to_string());

            let delay = match self.policy.should_retry(&error, attempt) {
                RetryDecision::Stop => {
                    debug!(error = %error, "retry.stopped_by_policy");
                    return RetryOutcome {
                        result: Err(RetryError::NonRetryable { source: error }),
                        attempts: attempt_number,
                        total_delay,
                        timed_out: false,
                        last_error,
                    };
                }
                _ if attempt_number >= self.config.max_attempts => {
                    warn!(attempts = attempt_number, error = %error, "retry.exhausted");
                    return RetryOutcome {
                        result: Err(RetryError::AttemptsExhausted {
                            attempts: attempt_number,
                            source: error,
                        }),
                        attempts: attempt_number,
                        total_delay,
                        timed_out: false,
                        last_error,
                    };
                }
                RetryDecision::Retry => {
                    let delay = self.config.backoff.calculate_delay(attempt);
                    self.config.jitter.apply(delay, attempt)
                }
                RetryDecision::RetryAfter(custom) => custom.min(MAX_RETRY_AFTER),
            };

            if let Some(max_time) = self.config.max_total_time {
                let elapsed = start.elapsed();
                if elapsed.saturating_add(delay) >= max_time {
                    warn!(elapsed_ms = elapsed.as_millis() as u64, "retry.time_budget_exceeded");
                    return RetryOutcome {
                        result: Err(RetryError::TimeoutExceeded { elapsed, last: Some(error) }),
                        attempts: attempt_number,
                        total_delay,
                        timed_out: true,
                        last_error,
                    };
                }
            }

            debug!(
                attempt = attempt_number,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retry.scheduled"
            );
            tokio::time::sleep(delay).await;
            total_delay = total_delay.saturating_add(delay);
            attempt += 1;
        }
    }
}

/// Convenience function to create a retry executor and execute an operation
pub async fn retry_with_policy<F, Fut, T, E, P>(
    config: RetryConfig,
    policy: P,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Display,
{
    RetryExecutor::new(config, policy).execute(operation).await
}

/// Convenience function to retry with default configuration
pub async fn retry<F, Fut, T, E, P>(policy: P, operation: F) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Display,
{
    retry_with_policy(RetryConfig::default(), policy, operation).await
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::{ErrorClassification, RetryDecision, RetryPolicy};

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - never retries
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Retry exactly the errors that classify themselves as retryable.
    ///
    /// A `retry_after` hint from the error replaces the backoff delay.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ClassifiedRetry;

    impl<E: ErrorClassification> RetryPolicy<E> for ClassifiedRetry {
        fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
            if !error.is_retryable() {
                return RetryDecision::Stop;
            }
            match error.retry_after() {
                Some(delay) => RetryDecision::RetryAfter(delay),
                None => RetryDecision::Retry,
            }
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for backoff, jitter, the executor loop and the policies.

    use std::sync::atomic::{AtomicU32, Ordering};

    use super::policies::{AlwaysRetry, ClassifiedRetry, NeverRetry, PredicateRetry};
    use super::*;
    use crate::error::CommonError;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_attempts(max_attempts)
            .fixed_backoff(Duration::from_millis(10))
            .no_jitter()
            .unlimited_time()
            .build()
            .unwrap()
    }

    /// Validates exponential backoff growth and capping.
    ///
    /// Assertions:
    /// - Delays double per attempt
    /// - Delay never exceeds max_delay
    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = BackoffStrategy::Exponential {
            initial_delay: Duration::from_millis(100),
            base: 2.0,
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(backoff.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(backoff.calculate_delay(3), Duration::from_millis(500));
        assert_eq!(backoff.calculate_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = BackoffStrategy::Linear {
            initial_delay: Duration::from_millis(100),
            increment: Duration::from_millis(50),
        };
        assert_eq!(backoff.calculate_delay(2), Duration::from_millis(200));
    }

    /// Validates jitter bounds for every jitter kind.
    ///
    /// Assertions:
    /// - Full jitter stays in [0, delay]
    /// - Equal jitter stays in [delay/2, delay]
    /// - Decorrelated jitter never falls below base
    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(1000);
        for attempt in 0..50 {
            let full = Jitter::Full.apply(delay, attempt);
            assert!(full <= delay);

            let equal = Jitter::Equal.apply(delay, attempt);
            assert!(equal >= delay / 2 && equal <= delay);

            let base = Duration::from_millis(100);
            let decorrelated = Jitter::Decorrelated { base }.apply(delay, attempt);
            assert!(decorrelated >= base);
        }
        assert_eq!(Jitter::None.apply(delay, 3), delay);
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::builder().max_attempts(0).build().is_err());
        assert!(RetryConfig::builder()
            .exponential_backoff(Duration::from_millis(1), 0.0, Duration::from_secs(1))
            .build()
            .is_err());
    }

    /// Validates that a transient failure is retried until success.
    ///
    /// Assertions:
    /// - Operation invoked until it succeeds
    /// - Outcome reports attempts and accumulated delay
    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(fast_config(5), AlwaysRetry);

        let outcome = executor
            .execute_with_outcome(|| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(CommonError::timeout("call", Duration::from_secs(1)))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.total_delay, Duration::from_millis(20));
        assert_eq!(outcome.result.unwrap(), 2);
    }

    /// Validates that exhaustion preserves the final error.
    ///
    /// Assertions:
    /// - Exactly max_attempts invocations
    /// - AttemptsExhausted carries the last error
    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_keeps_last_error() {
        let calls = &AtomicU32::new(0);
        let result = retry_with_policy(fast_config(3), AlwaysRetry, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CommonError::backend("shop", format!("attempt {n}"), true))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RetryError::AttemptsExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("attempt 2"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_retry_stops_immediately() {
        let calls = &AtomicU32::new(0);
        let result = retry_with_policy(fast_config(5), NeverRetry, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CommonError::internal("boom"))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::NonRetryable { .. })));
    }

    /// Validates that classification drives retry decisions.
    ///
    /// Assertions:
    /// - Non-retryable errors stop after one attempt
    /// - retry_after replaces the backoff delay
    #[tokio::test(start_paused = true)]
    async fn test_classified_retry() {
        let calls = &AtomicU32::new(0);
        let result = retry_with_policy(fast_config(5), ClassifiedRetry, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CommonError::validation("sku", "empty"))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::NonRetryable { .. })));

        let calls = &AtomicU32::new(0);
        let outcome = RetryExecutor::new(fast_config(2), ClassifiedRetry)
            .execute_with_outcome(|| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(CommonError::rate_limit(Some(Duration::from_secs(3))))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.total_delay, Duration::from_secs(3));
    }

    /// Validates that an oversized retry_after hint is clamped.
    ///
    /// Assertions:
    /// - No overflow when the hint is Duration::MAX, with or without a time budget
    /// - The wait is capped at MAX_RETRY_AFTER
    #[tokio::test(start_paused = true)]
    async fn test_oversized_retry_after_is_clamped() {
        let calls = &AtomicU32::new(0);
        let outcome = RetryExecutor::new(fast_config(2), ClassifiedRetry)
            .execute_with_outcome(|| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CommonError::rate_limit(Some(Duration::MAX)))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.total_delay, MAX_RETRY_AFTER);

        let budgeted = RetryConfig::builder()
            .max_attempts(3)
            .fixed_backoff(Duration::from_millis(10))
            .no_jitter()
            .max_total_time(Duration::from_secs(60))
            .build()
            .unwrap();
        let outcome = RetryExecutor::new(budgeted, ClassifiedRetry)
            .execute_with_outcome(|| async move {
                Err::<(), _>(CommonError::rate_limit(Some(Duration::MAX)))
            })
            .await;
        assert!(outcome.timed_out);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_retry_sees_attempt_number() {
        let policy = PredicateRetry::new(|_e: &CommonError, attempt: u32| attempt < 1);
        let calls = &AtomicU32::new(0);
        let result = retry_with_policy(fast_config(10), policy, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CommonError::internal("x"))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(result.is_err());
    }

    /// Validates the total time budget.
    ///
    /// Assertions:
    /// - Executor gives up before sleeping past max_total_time
    /// - The last error is still available
    #[tokio::test(start_paused = true)]
    async fn test_time_budget_exceeded() {
        let config = RetryConfig::builder()
            .max_attempts(100)
            .fixed_backoff(Duration::from_secs(1))
            .no_jitter()
            .max_total_time(Duration::from_millis(2500))
            .build()
            .unwrap();

        let outcome = RetryExecutor::new(config, AlwaysRetry)
            .execute_with_outcome(|| async move {
                Err::<(), _>(CommonError::timeout("op", Duration::from_secs(1)))
            })
            .await;

        assert!(outcome.timed_out);
        assert_eq!(outcome.attempts, 3);
        let last = outcome.result.unwrap_err().into_last_error();
        assert!(last.is_some());
    }
}
