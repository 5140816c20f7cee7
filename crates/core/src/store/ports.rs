//! Port interface for the shared key-value store

use std::time::Duration;

use async_trait::async_trait;
use relaysync_common::error::{CommonError, ErrorSeverity};
use relaysync_common::impl_error_classification;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected the operation: {0}")]
    Rejected(String),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl_error_classification!(StoreError, Common,
    Self::Unavailable(_) => {
        retryable: true,
        severity: ErrorSeverity::Error,
        critical: false,
        kind: "store_unavailable",
    },
    Self::Rejected(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
        kind: "store_rejected",
    }
);

pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value store shared by every engine instance
///
/// All conditional operations must be atomic with respect to every other
/// client of the store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Set `key` to `value` with expiry `ttl` only if the key is absent.
    /// Returns whether the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Reset the expiry of `key` to `ttl` only if its value equals `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
        -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditional write; `None` keeps the entry until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}
