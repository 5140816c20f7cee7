//! Error taxonomy for synchronization work
//!
//! Every per-item failure is expressed as a [`SyncError`]. The variants group
//! into four families that drive the engine's reaction:
//!
//! - transient (`Transient`, `RateLimited`, `Timeout`): retried with backoff
//! - permanent (`Permanent`, `NotFound`, `Validation`): the item fails at once
//! - lock contention: the item is reported as skipped, not failed
//! - circuit open: fast failure, left to the breaker's own probing
//!
//! `Infrastructure` covers the shared store being unreachable and `Cancelled`
//! an abandoned run; neither is retried at the item level.

use std::time::Duration;

use relaysync_common::error::{ErrorClassification, ErrorSeverity};
use relaysync_common::resilience::{ResilienceError, RetryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncError {
    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("rate limited by dependency{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("permanent failure: {message}")]
    Permanent { message: String },

    #[error("not found: {reference}")]
    NotFound { reference: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("circuit '{name}' is open")]
    CircuitOpen { name: String },

    #[error("'{resource}' is locked by another holder")]
    LockContention { resource: String },

    #[error("infrastructure unavailable: {message}")]
    Infrastructure { message: String },

    #[error("cancelled")]
    Cancelled,
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default()
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn not_found(reference: impl Into<String>) -> Self {
        Self::NotFound { reference: reference.into() }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited { retry_after }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure { message: message.into() }
    }

    /// The item should be reported as skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }

    /// Collapse the result of a retried, breaker-guarded call into the
    /// error that ended it.
    pub fn from_retry(err: RetryError<ResilienceError<SyncError>>) -> Self {
        match err {
            RetryError::InvalidConfiguration { message } => Self::Permanent { message },
            RetryError::TimeoutExceeded { elapsed, last } => {
                last.map_or(Self::Timeout { timeout: elapsed }, Self::from)
            }
            other => other.into_last_error().map_or(Self::Cancelled, Self::from),
        }
    }
}

impl From<ResilienceError<SyncError>> for SyncError {
    fn from(err: ResilienceError<SyncError>) -> Self {
        match err {
            ResilienceError::CircuitOpen { name } => Self::CircuitOpen { name },
            ResilienceError::Timeout { timeout } => Self::Timeout { timeout },
            ResilienceError::OperationFailed { source } => source,
        }
    }
}

impl ErrorClassification for SyncError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. } | Self::Timeout { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Transient { .. }
            | Self::RateLimited { .. }
            | Self::Timeout { .. }
            | Self::CircuitOpen { .. } => ErrorSeverity::Warning,
            Self::LockContention { .. } | Self::Cancelled => ErrorSeverity::Info,
            Self::Permanent { .. } | Self::NotFound { .. } | Self::Validation { .. } => {
                ErrorSeverity::Error
            }
            Self::Infrastructure { .. } => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Infrastructure { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::Permanent { .. } => "permanent",
            Self::NotFound { .. } => "not_found",
            Self::Validation { .. } => "validation",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::LockContention { .. } => "lock_contention",
            Self::Infrastructure { .. } => "infrastructure",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_family_is_retryable() {
        assert!(SyncError::transient("503").is_retryable());
        assert!(SyncError::rate_limited(None).is_retryable());
        assert!(SyncError::Timeout { timeout: Duration::from_secs(1) }.is_retryable());

        assert!(!SyncError::permanent("bad sku").is_retryable());
        assert!(!SyncError::not_found("gid://1").is_retryable());
        assert!(!SyncError::validation("price < 0").is_retryable());
        assert!(!SyncError::CircuitOpen { name: "shop".into() }.is_retryable());
        assert!(!SyncError::LockContention { resource: "a".into() }.is_retryable());
        assert!(!SyncError::infrastructure("store down").is_retryable());
    }

    #[test]
    fn rate_limit_carries_retry_hint() {
        let err = SyncError::rate_limited(Some(Duration::from_secs(2)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(err.to_string(), "rate limited by dependency, retry after 2s");
        assert_eq!(err.kind(), "rate_limited");
    }

    #[test]
    fn breaker_errors_collapse_into_taxonomy() {
        let open: SyncError = ResilienceError::CircuitOpen { name: "erp".into() }.into();
        assert_eq!(open, SyncError::CircuitOpen { name: "erp".into() });

        let timeout: SyncError =
            ResilienceError::<SyncError>::Timeout { timeout: Duration::from_secs(3) }.into();
        assert_eq!(timeout, SyncError::Timeout { timeout: Duration::from_secs(3) });

        let failed: SyncError =
            ResilienceError::OperationFailed { source: SyncError::permanent("x") }.into();
        assert_eq!(failed, SyncError::permanent("x"));
    }

    #[test]
    fn retry_errors_keep_the_last_failure() {
        let exhausted = RetryError::AttemptsExhausted {
            attempts: 3,
            source: ResilienceError::OperationFailed { source: SyncError::transient("503") },
        };
        assert_eq!(SyncError::from_retry(exhausted), SyncError::transient("503"));

        let budget = RetryError::<ResilienceError<SyncError>>::TimeoutExceeded {
            elapsed: Duration::from_secs(9),
            last: None,
        };
        assert_eq!(
            SyncError::from_retry(budget),
            SyncError::Timeout { timeout: Duration::from_secs(9) }
        );
    }

    #[test]
    fn contention_is_a_skip() {
        assert!(SyncError::LockContention { resource: "a".into() }.is_skip());
        assert!(!SyncError::transient("x").is_skip());
    }
}
