//! In-process [`SharedStore`] adapter
//!
//! Keys live in a `DashMap`; every conditional operation runs under the
//! shard lock of its key, so it is atomic with respect to every other caller
//! in the process. Expired entries are invisible immediately and removed
//! lazily, or eagerly through [`MemoryStore::purge_expired`].
//!
//! Suitable for single-process deployments and tests. Several engines in one
//! process can share a `MemoryStore` through an `Arc`. A networked store is
//! plugged in by implementing [`SharedStore`] instead.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relaysync_common::resilience::{Clock, TokioClock};
use tracing::debug;

use super::ports::{SharedStore, StoreResult};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, now: Instant, ttl: Option<Duration>) -> Self {
        Self { value: value.to_string(), expires_at: ttl.map(|ttl| now + ttl) }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Key-value store with per-key expiry held in process memory
///
/// # Type Parameters
/// - `C`: Clock used for expiry (defaults to `TokioClock`)
pub struct MemoryStore<C: Clock = TokioClock> {
    entries: DashMap<String, StoredValue>,
    clock: C,
}

impl<C: Clock> std::fmt::Debug for MemoryStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("entries", &self.entries.len()).finish()
    }
}

impl Default for MemoryStore<TokioClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore<TokioClock> {
    pub fn new() -> Self {
        Self::with_clock(TokioClock)
    }
}

impl<C: Clock> MemoryStore<C> {
    /// Create a store with a custom clock (useful for testing)
    pub fn with_clock(clock: C) -> Self {
        Self { entries: DashMap::new(), clock }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|entry| entry.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of `key`; `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|stored| stored.is_live(now))
            .and_then(|stored| stored.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Live value of `key` without going through the async port.
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        self.entries.get(key).filter(|stored| stored.is_live(now)).map(|stored| stored.value.clone())
    }

    /// Drop `key` whether or not it has expired.
    pub fn evict(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "store.purged_expired");
        }
        removed
    }
}

#[async_trait]
impl<C: Clock> SharedStore for MemoryStore<C> {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        Ok(match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(StoredValue::new(value, now, Some(ttl)));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, now, Some(ttl)));
                true
            }
        })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove_if(key, |_, stored| stored.is_live(now) && stored.value == expected)
            .is_some())
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        Ok(match self.entries.get_mut(key) {
            Some(mut stored) if stored.is_live(now) && stored.value == expected => {
                stored.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        Ok(self.entries.get(key).filter(|stored| stored.is_live(now)).map(|stored| stored.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = self.clock.now();
        self.entries.insert(key.to_string(), StoredValue::new(value, now, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        Ok(self.entries.remove(key).is_some_and(|(_, stored)| stored.is_live(now)))
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.purge_expired();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relaysync_common::resilience::MockClock;

    use super::*;

    fn store() -> (MemoryStore<MockClock>, MockClock) {
        let clock = MockClock::new();
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn set_if_absent_respects_live_entries() {
        let (store, clock) = store();
        assert!(store.set_if_absent("k", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn compare_operations_check_the_value() {
        let (store, clock) = store();
        store.set("k", "owner", Some(Duration::from_secs(10))).await.unwrap();

        assert!(!store.compare_and_delete("k", "intruder").await.unwrap());
        assert!(!store.compare_and_expire("k", "intruder", Duration::from_secs(60)).await.unwrap());

        clock.advance(Duration::from_secs(8));
        assert!(store.compare_and_expire("k", "owner", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(10)));

        assert!(store.compare_and_delete("k", "owner").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_cannot_be_claimed_by_their_old_owner() {
        let (store, clock) = store();
        store.set_if_absent("k", "owner", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert!(!store.compare_and_expire("k", "owner", Duration::from_secs(1)).await.unwrap());
        assert!(!store.compare_and_delete("k", "owner").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn keys_filter_by_prefix_and_skip_expired() {
        let (store, clock) = store();
        store.set("lock:b", "1", Some(Duration::from_secs(1))).await.unwrap();
        store.set("lock:a", "1", None).await.unwrap();
        store.set("cache:a", "1", None).await.unwrap();

        assert_eq!(store.keys("lock:").await.unwrap(), vec!["lock:a", "lock:b"]);
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.keys("lock:").await.unwrap(), vec!["lock:a"]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.ttl("lock:a"), None);
    }

    #[tokio::test]
    async fn peek_and_evict_bypass_the_port() {
        let (store, clock) = store();
        store.set("k", "v", Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(store.peek("k").as_deref(), Some("v"));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.peek("k"), None);
        assert!(store.evict("k"));
        assert!(!store.evict("k"));
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let (store, clock) = store();
        for i in 0..4 {
            store.set(&format!("k{i}"), "v", Some(Duration::from_secs(i + 1))).await.unwrap();
        }
        clock.advance(Duration::from_millis(2_500));
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.set_if_absent("k", &format!("w{i}"), Duration::from_secs(30)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
