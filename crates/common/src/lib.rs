//! Generic building blocks shared across RelaySync crates.
//!
//! Nothing in this crate knows about work items or synchronization; it only
//! provides the error taxonomy and the resilience primitives the engine is
//! assembled from.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error taxonomy and classification
//! - `runtime`: async resilience primitives (circuit breaker, rate limiter,
//!   retry, registries)
//! - `observability`: tracing output (implied by `runtime`)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{CommonError, CommonResult, ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use resilience::{
    retry, retry_with_policy, BackoffStrategy, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitState,
    CircuitTransition, Clock, Jitter, MockClock, QuotaSignal, RateLimitInfo, RateLimiter,
    RateLimiterConfig, RateLimiterConfigBuilder, RateLimiterRegistry, ResilienceError,
    ResilienceResult, RetryConfig, RetryConfigBuilder, RetryDecision, RetryError, RetryExecutor,
    RetryPolicy, RetryResult, SystemClock, TokioClock,
};
