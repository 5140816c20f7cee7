//! Common error types and classification for RelaySync crates
//!
//! # Error Handling Architecture
//!
//! The error handling system is built on three pieces:
//!
//! 1. **`CommonError`**: recurring error patterns (timeouts, rate limiting,
//!    serialization, backend failures) that several layers need to express.
//!
//! 2. **`ErrorClassification` trait**: a standard interface for classifying
//!    errors by retryability, severity and criticality. The retry executor,
//!    the circuit breaker's error histogram and the batch statistics all read
//!    errors through this trait, so layer-specific error enums only need to
//!    implement it once.
//!
//! 3. **`ErrorSeverity` enum**: a unified severity level used for log levels
//!    and sink reporting.
//!
//! ## Composition
//!
//! Layer-specific errors compose with `CommonError` rather than duplicating
//! its variants:
//!
//! ```rust,ignore
//! #[derive(Debug, Error)]
//! pub enum StoreError {
//!     #[error("store unavailable: {0}")]
//!     Unavailable(String),
//!
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//! }
//!
//! impl_error_classification!(StoreError, Common,
//!     Self::Unavailable(_) => {
//!         retryable: true,
//!         severity: ErrorSeverity::Warning,
//!         critical: false,
//!         kind: "store_unavailable",
//!     }
//! );
//! ```
//!
//! ## ErrorSeverity Levels
//!
//! | Level | Use Case | Examples |
//! |-------|----------|----------|
//! | **Info** | Expected conditions | Missing record, skipped item |
//! | **Warning** | Degraded but operational | Rate limiting, lock contention, transient failures |
//! | **Error** | Failure requiring attention | Validation failure, config errors |
//! | **Critical** | System integrity at risk | Invariant violations |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Standard result type using CommonError
pub type CommonResult<T> = Result<T, CommonError>;

/// Common error variants that appear across multiple layers
#[derive(Debug, Clone, Error)]
pub enum CommonError {
    /// Configuration-related errors
    #[error("Configuration error{}: {message}", field_suffix(.field))]
    Config { message: String, field: Option<String> },

    /// Circuit breaker is open, preventing operations
    #[error("Circuit breaker open for service '{service}'")]
    CircuitBreakerOpen { service: String, retry_after: Option<Duration> },

    /// Serialization or deserialization errors
    #[error("Serialization error{}: {message}", format_suffix(.format))]
    Serialization { message: String, format: Option<String> },

    /// Data persistence errors (file I/O, store operations)
    #[error("Persistence error: {message}")]
    Persistence { message: String, operation: Option<String> },

    /// Rate limiting errors
    #[error("Rate limit exceeded")]
    RateLimitExceeded { limit: Option<u32>, retry_after: Option<Duration> },

    /// Timeout errors
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    /// Network or backend connectivity errors
    #[error("Backend error from '{service}': {message}")]
    Backend { service: String, message: String, is_retryable: bool },

    /// Validation errors
    #[error("Validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// Resource not found errors
    #[error("{resource_type} not found{}", id_suffix(.identifier))]
    NotFound { resource_type: String, identifier: Option<String> },

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Task cancellation (async)
    #[error("Task '{task_id}' was cancelled")]
    TaskCancelled { task_id: String },
}

fn field_suffix(field: &Option<String>) -> String {
    field.as_ref().map(|f| format!(" in field '{f}'")).unwrap_or_default()
}

fn format_suffix(format: &Option<String>) -> String {
    format.as_ref().map(|f| format!(" ({f})")).unwrap_or_default()
}

fn id_suffix(identifier: &Option<String>) -> String {
    identifier.as_ref().map(|id| format!(": {id}")).unwrap_or_default()
}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitBreakerOpen { .. }
            | Self::RateLimitExceeded { .. }
            | Self::Timeout { .. } => true,
            Self::Backend { is_retryable, .. } => *is_retryable,
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CircuitBreakerOpen { .. }
            | Self::RateLimitExceeded { .. }
            | Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::NotFound { .. } | Self::TaskCancelled { .. } => ErrorSeverity::Info,
            Self::Internal { .. } => ErrorSeverity::Critical,
            Self::Config { .. }
            | Self::Serialization { .. }
            | Self::Persistence { .. }
            | Self::Backend { .. }
            | Self::Validation { .. } => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitBreakerOpen { retry_after, .. }
            | Self::RateLimitExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::CircuitBreakerOpen { .. } => "circuit_open",
            Self::Serialization { .. } => "serialization",
            Self::Persistence { .. } => "persistence",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::Backend { .. } => "backend",
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Internal { .. } => "internal",
            Self::TaskCancelled { .. } => "cancelled",
        }
    }
}

impl CommonError {
    /// Create a simple configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), field: None }
    }

    /// Create a configuration error tied to a specific field
    pub fn config_field<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Config { message: message.into(), field: Some(field.into()) }
    }

    pub fn circuit_breaker<S: Into<String>>(service: S) -> Self {
        Self::CircuitBreakerOpen { service: service.into(), retry_after: None }
    }

    pub fn serialization_format<F: Into<String>, S: Into<String>>(format: F, message: S) -> Self {
        Self::Serialization { message: message.into(), format: Some(format.into()) }
    }

    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence { message: message.into(), operation: None }
    }

    pub fn persistence_op<O: Into<String>, S: Into<String>>(operation: O, message: S) -> Self {
        Self::Persistence { message: message.into(), operation: Some(operation.into()) }
    }

    pub fn rate_limit(retry_after: Option<Duration>) -> Self {
        Self::RateLimitExceeded { limit: None, retry_after }
    }

    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    pub fn backend<S: Into<String>, M: Into<String>>(
        service: S,
        message: M,
        is_retryable: bool,
    ) -> Self {
        Self::Backend { service: service.into(), message: message.into(), is_retryable }
    }

    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    pub fn not_found_with_id<T: Into<String>, I: Into<String>>(
        resource_type: T,
        identifier: I,
    ) -> Self {
        Self::NotFound { resource_type: resource_type.into(), identifier: Some(identifier.into()) }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    pub fn task_cancelled<S: Into<String>>(task_id: S) -> Self {
        Self::TaskCancelled { task_id: task_id.into() }
    }

    /// Structured fields suitable for attaching to a tracing event.
    pub fn as_tracing_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("error.kind", self.kind().to_string()),
            ("error.severity", self.severity().to_string()),
            ("error.retryable", self.is_retryable().to_string()),
        ];
        match self {
            Self::Timeout { operation, duration } => {
                fields.push(("operation", operation.clone()));
                fields.push(("timeout_ms", duration.as_millis().to_string()));
            }
            Self::Backend { service, .. } | Self::CircuitBreakerOpen { service, .. } => {
                fields.push(("service", service.clone()));
            }
            Self::Validation { field, .. } => fields.push(("field", field.clone())),
            Self::Persistence { operation: Some(op), .. } => fields.push(("operation", op.clone())),
            _ => {}
        }
        if let Some(delay) = self.retry_after() {
            fields.push(("retry_after_ms", delay.as_millis().to_string()));
        }
        fields
    }
}

/// Standard interface for classifying errors
///
/// Implemented by every error that can reach a retry decision. The retry
/// executor consults `is_retryable` and `retry_after`; the circuit breaker
/// buckets failures by `kind`.
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient issues that may succeed if attempted
    /// again: timeouts, rate limiting, temporary service unavailability.
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    ///
    /// Returns `Some(Duration)` when the failing dependency told us how long
    /// to wait (e.g. a Retry-After header).
    fn retry_after(&self) -> Option<Duration>;

    /// Stable, low-cardinality label for histograms and log fields.
    fn kind(&self) -> &'static str {
        "error"
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<serde_json::Error> for CommonError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_format("JSON", err.to_string())
    }
}

impl From<std::io::Error> for CommonError {
    fn from(err: std::io::Error) -> Self {
        Self::persistence(err.to_string())
    }
}

/// Macro to implement ErrorClassification by delegating to CommonError
///
/// # Usage
///
/// ```rust,ignore
/// impl_error_classification!(MyError, Common,
///     Self::Specific(_) => {
///         retryable: false,
///         severity: ErrorSeverity::Error,
///         critical: false,
///         kind: "specific",
///     }
/// );
/// ```
#[macro_export]
macro_rules! impl_error_classification {
    (@retry_after $retry_after:expr) => { $retry_after };
    (@retry_after) => { None };
    (
        $error_type:ty,
        $common_variant:ident
        $(,
            $variant:pat => {
                retryable: $retryable:expr,
                severity: $severity:expr,
                critical: $critical:expr,
                kind: $kind:expr
                $(, retry_after: $retry_after:expr)?
                $(,)?
            }
        )*
        $(,)?
    ) => {
        impl $crate::error::ErrorClassification for $error_type {
            fn is_retryable(&self) -> bool {
                match self {
                    Self::$common_variant(e) => e.is_retryable(),
                    $(
                        $variant => $retryable,
                    )*
                }
            }

            fn severity(&self) -> $crate::error::ErrorSeverity {
                match self {
                    Self::$common_variant(e) => e.severity(),
                    $(
                        $variant => $severity,
                    )*
                }
            }

            fn is_critical(&self) -> bool {
                match self {
                    Self::$common_variant(e) => e.is_critical(),
                    $(
                        $variant => $critical,
                    )*
                }
            }

            fn retry_after(&self) -> Option<std::time::Duration> {
                match self {
                    Self::$common_variant(e) => e.retry_after(),
                    $(
                        $variant => $crate::impl_error_classification!(@retry_after $($retry_after)?),
                    )*
                }
            }

            fn kind(&self) -> &'static str {
                match self {
                    Self::$common_variant(e) => e.kind(),
                    $(
                        $variant => $kind,
                    )*
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config_with_field() {
        let err = CommonError::config_field("pool.max_workers", "must be >= min_workers");
        assert_eq!(
            err.to_string(),
            "Configuration error in field 'pool.max_workers': must be >= min_workers"
        );
        assert!(!err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Error);
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_error_timeout_is_retryable_warning() {
        let err = CommonError::timeout("store.get", Duration::from_secs(2));
        assert!(err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        assert!(err.to_string().contains("store.get"));
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let err = CommonError::rate_limit(Some(Duration::from_millis(1500)));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(err.kind(), "rate_limited");
    }

    #[test]
    fn test_backend_retryability_follows_flag() {
        assert!(CommonError::backend("shop", "502", true).is_retryable());
        assert!(!CommonError::backend("shop", "422", false).is_retryable());
    }

    #[test]
    fn test_internal_is_critical() {
        let err = CommonError::internal("broken invariant");
        assert!(err.is_critical());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_not_found_display_includes_identifier() {
        let err = CommonError::not_found_with_id("WorkItem", "sku-42");
        assert_eq!(err.to_string(), "WorkItem not found: sku-42");
        assert_eq!(err.severity(), ErrorSeverity::Info);
    }

    #[test]
    fn test_error_severity_ordering() {
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Warning < ErrorSeverity::Error);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARN");
    }

    #[test]
    fn test_conversion_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid").unwrap_err();
        let err: CommonError = json_err.into();
        assert!(matches!(err, CommonError::Serialization { format: Some(ref f), .. } if f == "JSON"));
    }

    #[test]
    fn test_as_tracing_fields_timeout() {
        let err = CommonError::timeout("lock.renew", Duration::from_millis(250));
        let fields = err.as_tracing_fields();
        assert!(fields.contains(&("error.kind", "timeout".to_string())));
        assert!(fields.contains(&("operation", "lock.renew".to_string())));
        assert!(fields.contains(&("timeout_ms", "250".to_string())));
    }

    #[derive(Debug, thiserror::Error)]
    enum ModuleError {
        #[error("gone: {0}")]
        Gone(String),
        #[error("slow down")]
        Throttled,
        #[error(transparent)]
        Common(#[from] CommonError),
    }

    impl_error_classification!(ModuleError, Common,
        Self::Gone(_) => {
            retryable: false,
            severity: ErrorSeverity::Info,
            critical: false,
            kind: "gone",
        },
        Self::Throttled => {
            retryable: true,
            severity: ErrorSeverity::Warning,
            critical: false,
            kind: "throttled",
            retry_after: Some(Duration::from_secs(1)),
        }
    );

    #[test]
    fn test_error_classification_macro() {
        let gone = ModuleError::Gone("x".into());
        assert!(!gone.is_retryable());
        assert_eq!(gone.kind(), "gone");
        assert_eq!(gone.retry_after(), None);

        let throttled = ModuleError::Throttled;
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(1)));

        let wrapped: ModuleError = CommonError::timeout("op", Duration::from_secs(1)).into();
        assert!(wrapped.is_retryable());
        assert_eq!(wrapped.kind(), "timeout");
    }
}
