//! Shared store calls routed through the infrastructure breaker

use std::sync::Arc;
use std::time::Duration;

use relaysync_common::resilience::{CircuitBreaker, CircuitState, ResilienceError};

use super::ports::{SharedStore, StoreError};

pub type GuardedResult<T> = Result<T, ResilienceError<StoreError>>;

/// A [`SharedStore`] whose calls are bounded and counted by one breaker
///
/// Repeated store failures open the breaker; while it is open every call
/// fails fast with `CircuitOpen` so callers can switch to degraded mode
/// without waiting on a dead store.
#[derive(Clone)]
pub struct GuardedStore {
    store: Arc<dyn SharedStore>,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for GuardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedStore").field("breaker", &self.breaker.name()).finish_non_exhaustive()
    }
}

impl GuardedStore {
    pub fn new(store: Arc<dyn SharedStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The store is currently considered reachable.
    pub fn is_available(&self) -> bool {
        self.breaker.state() != CircuitState::Open
    }

    pub async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> GuardedResult<bool> {
        self.breaker.execute(|| self.store.set_if_absent(key, value, ttl)).await
    }

    pub async fn compare_and_delete(&self, key: &str, expected: &str) -> GuardedResult<bool> {
        self.breaker.execute(|| self.store.compare_and_delete(key, expected)).await
    }

    pub async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> GuardedResult<bool> {
        self.breaker.execute(|| self.store.compare_and_expire(key, expected, ttl)).await
    }

    pub async fn get(&self, key: &str) -> GuardedResult<Option<String>> {
        self.breaker.execute(|| self.store.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GuardedResult<()> {
        self.breaker.execute(|| self.store.set(key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> GuardedResult<bool> {
        self.breaker.execute(|| self.store.delete(key)).await
    }

    pub async fn keys(&self, prefix: &str) -> GuardedResult<Vec<String>> {
        self.breaker.execute(|| self.store.keys(prefix)).await
    }
}
