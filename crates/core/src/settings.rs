//! Conversions from domain config sections to resilience configs

use relaysync_common::resilience::{
    CircuitBreakerConfig, RateLimiterConfig, RetryConfig, RetryConfigBuilder, RetryError,
};
use relaysync_domain::{
    BreakerSettings, JitterMode, LockConfig, RateLimitSettings, RelaySyncError, Result,
    RetrySettings,
};

use crate::lock::LockOptions;

pub fn breaker_config(settings: &BreakerSettings) -> Result<CircuitBreakerConfig> {
    CircuitBreakerConfig::builder()
        .failure_threshold(settings.failure_threshold)
        .half_open_success_threshold(settings.half_open_success_threshold)
        .reset_timeout(settings.reset_timeout())
        .call_timeout(settings.call_timeout())
        .build()
        .map_err(|e| RelaySyncError::Config(e.to_string()))
}

pub fn limiter_config(settings: &RateLimitSettings) -> Result<RateLimiterConfig> {
    RateLimiterConfig::builder()
        .capacity(settings.capacity)
        .window(settings.window())
        .backpressure_threshold(settings.backpressure_threshold)
        .base_delay(settings.base_delay())
        .build()
        .map_err(|e| RelaySyncError::Config(e.to_string()))
}

pub fn retry_config(settings: &RetrySettings) -> Result<RetryConfig> {
    let builder = RetryConfigBuilder::new().max_attempts(settings.max_attempts).exponential_backoff(
        settings.initial_delay(),
        settings.multiplier,
        settings.max_delay(),
    );
    let builder = match settings.jitter {
        JitterMode::None => builder.no_jitter(),
        JitterMode::Full => builder.full_jitter(),
        JitterMode::Equal => builder.equal_jitter(),
    };
    let builder = match settings.max_total_time() {
        Some(budget) => builder.max_total_time(budget),
        None => builder.unlimited_time(),
    };
    builder.build().map_err(|err| match err {
        RetryError::InvalidConfiguration { message } => RelaySyncError::Config(message),
        _ => RelaySyncError::Config("invalid retry configuration".to_string()),
    })
}

pub fn lock_options(config: &LockConfig) -> LockOptions {
    LockOptions {
        ttl: config.ttl(),
        retries: config.retries,
        retry_delay: config.retry_delay(),
        skip_if_locked: config.skip_if_locked,
    }
}
