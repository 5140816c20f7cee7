//! Distributed mutual exclusion over the shared store
//!
//! A lock is a store entry `lock:<resource>` holding a random ownership
//! token. It is taken with an atomic set-if-absent and given back with an
//! atomic compare-and-delete, so a holder whose lock expired and was taken by
//! someone else can never remove the new holder's entry.
//!
//! While a [`LockHandle`] is alive a renewal task pushes the expiry forward
//! every two thirds of the TTL. The task is tied to the handle's
//! cancellation token and stops on release or drop.
//!
//! # Example
//!
//! ```no_run
//! # use relaysync_core::lock::{DistributedLock, LockedRun, LockOptions};
//! # use relaysync_core::SyncError;
//! # async fn example(lock: DistributedLock) -> Result<(), Box<dyn std::error::Error>> {
//! let run = lock
//!     .with_lock("sku-42", &LockOptions::default(), || async {
//!         Ok::<_, SyncError>("pushed")
//!     })
//!     .await?;
//! match run {
//!     LockedRun::Completed(value) => println!("done: {value}"),
//!     LockedRun::Failed(err) => println!("failed: {err}"),
//!     LockedRun::Skipped => println!("another worker holds sku-42"),
//! }
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relaysync_common::resilience::ResilienceError;
use relaysync_domain::constants::LOCK_KEY_PREFIX;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::store::{GuardedStore, StoreError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    Unavailable(#[from] ResilienceError<StoreError>),
}

pub type LockResult<T> = Result<T, LockError>;

/// How a single acquisition behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Extra attempts after the first one when `skip_if_locked` is off
    pub retries: u32,
    pub retry_delay: Duration,
    /// Give up after the first failed attempt
    pub skip_if_locked: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_millis(200),
            skip_if_locked: true,
        }
    }
}

impl LockOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn skip_if_locked(mut self, skip: bool) -> Self {
        self.skip_if_locked = skip;
        self
    }

    fn attempts(&self) -> u32 {
        if self.skip_if_locked {
            1
        } else {
            self.retries.saturating_add(1)
        }
    }

    fn renewal_interval(&self) -> Duration {
        (self.ttl * 2 / 3).max(Duration::from_millis(1))
    }
}

/// Result of running a closure under a lock
#[derive(Debug)]
pub enum LockedRun<T, E> {
    Completed(T),
    Failed(E),
    /// The lock was held elsewhere; the closure did not run
    Skipped,
}

impl<T, E> LockedRun<T, E> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Lock manager bound to one shared store
#[derive(Debug, Clone)]
pub struct DistributedLock {
    store: GuardedStore,
}

impl DistributedLock {
    pub fn new(store: GuardedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &GuardedStore {
        &self.store
    }

    fn key(resource_id: &str) -> String {
        format!("{LOCK_KEY_PREFIX}{resource_id}")
    }

    /// Try to take the lock on `resource_id`.
    ///
    /// Returns `Ok(None)` when another holder owns it after the configured
    /// attempts, and an error only when the store itself cannot be reached.
    #[instrument(skip(self, options), fields(ttl_ms = options.ttl.as_millis() as u64))]
    pub async fn acquire(
        &self,
        resource_id: &str,
        options: &LockOptions,
    ) -> LockResult<Option<LockHandle>> {
        let key = Self::key(resource_id);
        let token = Uuid::new_v4().to_string();
        let attempts = options.attempts();

        for attempt in 1..=attempts {
            if self.store.set_if_absent(&key, &token, options.ttl).await? {
                debug!(resource = resource_id, attempt, "lock.acquired");
                return Ok(Some(LockHandle::start(
                    self.store.clone(),
                    resource_id.to_string(),
                    key,
                    token,
                    options,
                )));
            }
            if attempt < attempts {
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        debug!(resource = resource_id, attempts, "lock.contended");
        Ok(None)
    }

    /// Run `f` while holding the lock on `resource_id`.
    ///
    /// The lock is released on every exit path. If `f` panics, dropping the
    /// handle schedules the release.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        resource_id: &str,
        options: &LockOptions,
        f: F,
    ) -> LockResult<LockedRun<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(handle) = self.acquire(resource_id, options).await? else {
            return Ok(LockedRun::Skipped);
        };

        let result = f().await;

        if handle.is_lost() {
            warn!(resource = resource_id, "lock.lost_during_run");
        }
        if let Err(err) = handle.release().await {
            warn!(resource = resource_id, error = %err, "lock.release_failed");
        }

        Ok(match result {
            Ok(value) => LockedRun::Completed(value),
            Err(err) => LockedRun::Failed(err),
        })
    }

    /// Current owner token of `resource_id`, if locked.
    pub async fn owner(&self, resource_id: &str) -> LockResult<Option<String>> {
        Ok(self.store.get(&Self::key(resource_id)).await?)
    }

    /// Resources currently locked by any holder.
    pub async fn locked_resources(&self) -> LockResult<Vec<String>> {
        let keys = self.store.keys(LOCK_KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(LOCK_KEY_PREFIX).map(str::to_string))
            .collect())
    }
}

/// Exclusive claim on one resource
///
/// Owned by the acquiring worker. Call [`LockHandle::release`] when done;
/// dropping the handle without releasing cancels renewal and schedules a
/// best-effort release on the current runtime.
pub struct LockHandle {
    resource_id: String,
    key: String,
    token: String,
    ttl: Duration,
    store: GuardedStore,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
    renewal: Option<JoinHandle<()>>,
    released: bool,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource_id", &self.resource_id)
            .field("ttl", &self.ttl)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    fn start(
        store: GuardedStore,
        resource_id: String,
        key: String,
        token: String,
        options: &LockOptions,
    ) -> Self {
        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let renewal = tokio::spawn(renew(
            store.clone(),
            key.clone(),
            token.clone(),
            options.ttl,
            options.renewal_interval(),
            cancel.clone(),
            Arc::clone(&lost),
        ));

        Self {
            resource_id,
            key,
            token,
            ttl: options.ttl,
            store,
            cancel,
            lost,
            renewal: Some(renewal),
            released: false,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Renewal found that the store no longer holds this handle's token.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Give the lock back.
    ///
    /// Returns `false` when the store entry no longer carries this handle's
    /// token (expired, or taken over by another holder); nothing is deleted
    /// in that case.
    pub async fn release(mut self) -> LockResult<bool> {
        self.released = true;
        self.stop_renewal();
        let removed = self.store.compare_and_delete(&self.key, &self.token).await?;
        if removed {
            debug!(resource = %self.resource_id, "lock.released");
        } else {
            info!(resource = %self.resource_id, "lock.release_not_owner");
        }
        Ok(removed)
    }

    fn stop_renewal(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.stop_renewal();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let resource = std::mem::take(&mut self.resource_id);
        runtime.spawn(async move {
            match store.compare_and_delete(&key, &token).await {
                Ok(_) => debug!(resource = %resource, "lock.released_on_drop"),
                Err(err) => warn!(resource = %resource, error = %err, "lock.release_failed"),
            }
        });
    }
}

async fn renew(
    store: GuardedStore,
    key: String,
    token: String,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        match store.compare_and_expire(&key, &token, ttl).await {
            Ok(true) => debug!(key = %key, "lock.renewed"),
            Ok(false) => {
                lost.store(true, Ordering::Release);
                warn!(key = %key, "lock.lost");
                return;
            }
            // Keep trying; the entry survives until its current expiry.
            Err(err) => warn!(key = %key, error = %err, "lock.renewal_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relaysync_common::resilience::{CircuitBreaker, CircuitBreakerConfig};

    use super::*;
    use crate::testing::InMemoryStore;

    fn lock_over(store: Arc<InMemoryStore>) -> DistributedLock {
        let breaker = CircuitBreaker::new("infrastructure", CircuitBreakerConfig::default()).unwrap();
        DistributedLock::new(GuardedStore::new(store, Arc::new(breaker)))
    }

    fn fast_skip() -> LockOptions {
        LockOptions::default().with_ttl(Duration::from_secs(5)).with_retries(0, Duration::ZERO)
    }

    #[tokio::test]
    async fn concurrent_acquire_has_one_winner() {
        let lock = lock_over(Arc::new(InMemoryStore::new()));
        let options = fast_skip();

        let (a, b) = tokio::join!(lock.acquire("X", &options), lock.acquire("X", &options));
        let a = a.unwrap();
        let b = b.unwrap();

        assert!(a.is_some() ^ b.is_some());
    }

    #[tokio::test]
    async fn foreign_token_cannot_release() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock_over(Arc::clone(&store));
        let handle = lock.acquire("X", &fast_skip()).await.unwrap().unwrap();
        let owner = handle.token().to_string();

        let removed = lock.store().compare_and_delete("relaysync:lock:X", "stale-token").await.unwrap();
        assert!(!removed);
        assert_eq!(lock.owner("X").await.unwrap(), Some(owner));

        assert!(handle.release().await.unwrap());
        assert_eq!(lock.owner("X").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_holder_does_not_release_new_holder() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock_over(Arc::clone(&store));
        let options = fast_skip();

        let first = lock.acquire("X", &options).await.unwrap().unwrap();
        // Simulate expiry: the entry disappears underneath the first holder.
        store.expire_now("relaysync:lock:X");
        let second = lock.acquire("X", &options).await.unwrap().unwrap();

        assert!(!first.release().await.unwrap());
        assert_eq!(lock.owner("X").await.unwrap().as_deref(), Some(second.token()));
        assert!(second.release().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_long_work_locked() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock_over(Arc::clone(&store));
        let options = fast_skip().with_ttl(Duration::from_secs(3));

        let handle = lock.acquire("X", &options).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!handle.is_lost());
        assert!(lock.acquire("X", &options).await.unwrap().is_none());
        assert!(handle.release().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_detects_takeover() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock_over(Arc::clone(&store));
        let options = fast_skip().with_ttl(Duration::from_secs(3));

        let handle = lock.acquire("X", &options).await.unwrap().unwrap();
        store.expire_now("relaysync:lock:X");
        let thief = lock.acquire("X", &options).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(handle.is_lost());
        drop(thief);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_for_release() {
        let lock = lock_over(Arc::new(InMemoryStore::new()));
        let holder = lock.acquire("X", &fast_skip()).await.unwrap().unwrap();

        let waiting = LockOptions::default()
            .skip_if_locked(false)
            .with_retries(5, Duration::from_millis(100));
        let contender = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("X", &waiting).await })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(holder.release().await.unwrap());

        let acquired = contender.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn with_lock_reports_skip_and_releases() {
        let lock = lock_over(Arc::new(InMemoryStore::new()));
        let options = fast_skip();

        let holder = lock.acquire("X", &options).await.unwrap().unwrap();
        let skipped = lock
            .with_lock("X", &options, || async { Ok::<_, String>(1) })
            .await
            .unwrap();
        assert!(skipped.is_skipped());
        holder.release().await.unwrap();

        let failed = lock
            .with_lock("X", &options, || async { Err::<i32, _>("boom".to_string()) })
            .await
            .unwrap();
        assert!(matches!(failed, LockedRun::Failed(ref e) if e == "boom"));
        assert_eq!(lock.owner("X").await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropped_handle_releases_in_background() {
        let lock = lock_over(Arc::new(InMemoryStore::new()));
        let handle = lock.acquire("X", &fast_skip()).await.unwrap().unwrap();
        drop(handle);

        for _ in 0..10 {
            if lock.owner("X").await.unwrap().is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(lock.owner("X").await.unwrap(), None);
        assert!(lock.locked_resources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_store_is_an_error_not_a_skip() {
        let store = Arc::new(InMemoryStore::new());
        store.set_available(false);
        let lock = lock_over(store);

        let err = lock.acquire("X", &fast_skip()).await.unwrap_err();
        assert!(matches!(err, LockError::Unavailable(_)));
    }
}
