//! Resilience patterns for calling unreliable dependencies
//!
//! This module provides **generic, reusable** building blocks:
//! - **Circuit Breaker**: isolates a failing dependency and probes for
//!   recovery
//! - **Rate Limiter**: token bucket with backpressure and live quota signals
//! - **Retry Logic**: backoff strategies, jitter and pluggable retry policies
//! - **Registries**: name-keyed breakers and limiters owned by the caller
//!
//! Everything is generic over the caller's error type and reads time through
//! the [`Clock`] trait, so behaviour can be tested deterministically.
//!
//! The usual nesting when calling a dependency is
//! `retry(breaker(limiter(call)))`: the limiter paces each attempt, the
//! breaker sees every attempt's outcome, and the retry loop stops as soon as
//! the breaker opens because `CircuitOpen` is not retryable.

pub mod circuit_breaker;
pub mod clock;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

// Re-export circuit breaker types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState, CircuitTransition, ConfigError, ConfigResult, ResilienceError,
    ResilienceResult, TransitionObserver, TransitionReason,
};
pub use clock::{Clock, MockClock, SystemClock, TokioClock};
pub use rate_limiter::{
    QuotaSignal, RateLimitInfo, RateLimiter, RateLimiterConfig, RateLimiterConfigBuilder,
    MAX_QUOTA_HINT,
};
pub use registry::{CircuitBreakerRegistry, RateLimiterRegistry};
// Re-export retry types
pub use retry::{
    policies, retry, retry_with_policy, BackoffStrategy, Jitter, RetryConfig, RetryConfigBuilder,
    RetryDecision, RetryError, RetryExecutor, RetryOutcome, RetryPolicy, RetryResult,
    MAX_RETRY_AFTER,
};
