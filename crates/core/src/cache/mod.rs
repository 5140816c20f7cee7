//! Change detection for work items
//!
//! The cache remembers the fingerprint of each item's content at its last
//! successful (or skip-worthy) sync. An item whose current fingerprint
//! matches is skipped with reason "no change".
//!
//! Storage is a list of [`CacheTier`]s tried in order: normally the shared
//! store first and an in-process moka cache second. Writes go to every tier,
//! so when the shared store becomes unreachable the memory tier already holds
//! recent entries and lookups degrade instead of failing.

pub mod tier;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relaysync_domain::CacheConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use tier::{CacheTier, MemoryTier, SharedStoreTier, TierError};

use crate::store::GuardedStore;

/// Last synchronized fingerprint of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub content_hash: String,
    pub last_synced: DateTime<Utc>,
    pub sync_count: u64,
}

/// Verdict of a change check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCheck {
    Unchanged,
    Changed { previous: Option<String> },
}

impl CacheCheck {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierHealth {
    pub name: &'static str,
    /// The last operation on this tier succeeded
    pub available: bool,
    pub failures: u64,
    pub last_error: Option<String>,
}

struct TierSlot {
    tier: Arc<dyn CacheTier>,
    available: AtomicBool,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl TierSlot {
    fn new(tier: Arc<dyn CacheTier>) -> Self {
        Self {
            tier,
            available: AtomicBool::new(true),
            failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn mark_ok(&self) {
        if !self.available.swap(true, Ordering::AcqRel) {
            debug!(tier = self.tier.name(), "cache.tier_recovered");
        }
    }

    fn mark_failed(&self, err: &TierError) {
        self.available.store(false, Ordering::Release);
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(err.to_string());
        warn!(tier = self.tier.name(), error = %err, "cache.tier_unavailable");
    }
}

/// Tiered fingerprint cache
pub struct SyncCache {
    tiers: Vec<TierSlot>,
    max_age: Duration,
}

impl std::fmt::Debug for SyncCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.tiers.iter().map(|slot| slot.tier.name()).collect();
        f.debug_struct("SyncCache").field("tiers", &names).field("max_age", &self.max_age).finish()
    }
}

impl SyncCache {
    pub fn new(tiers: Vec<Arc<dyn CacheTier>>, max_age: Duration) -> Self {
        Self { tiers: tiers.into_iter().map(TierSlot::new).collect(), max_age }
    }

    /// Shared store first, in-process memory second.
    pub fn tiered(store: GuardedStore, config: &CacheConfig) -> Self {
        Self::new(
            vec![
                Arc::new(SharedStoreTier::new(store, config.max_entry_age())),
                Arc::new(MemoryTier::new(config.memory_capacity, config.max_entry_age())),
            ],
            config.max_entry_age(),
        )
    }

    pub fn memory_only(config: &CacheConfig) -> Self {
        Self::new(
            vec![Arc::new(MemoryTier::new(config.memory_capacity, config.max_entry_age()))],
            config.max_entry_age(),
        )
    }

    /// Hex-encoded blake3 hash of the payload's JSON form.
    ///
    /// Object keys serialize in sorted order, so equal values always produce
    /// equal fingerprints.
    pub fn fingerprint(payload: &serde_json::Value) -> String {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        hex::encode(blake3::hash(&bytes).as_bytes())
    }

    /// Fresh entry for `key` from the first tier able to answer.
    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        for slot in &self.tiers {
            match slot.tier.load(key).await {
                Ok(found) => {
                    slot.mark_ok();
                    return found.filter(|entry| !self.is_stale(entry));
                }
                Err(err) => slot.mark_failed(&err),
            }
        }
        None
    }

    pub async fn check(&self, key: &str, fingerprint: &str) -> CacheCheck {
        match self.entry(key).await {
            Some(entry) if entry.content_hash == fingerprint => {
                debug!(key, "cache.unchanged");
                CacheCheck::Unchanged
            }
            previous => CacheCheck::Changed { previous: previous.map(|e| e.content_hash) },
        }
    }

    /// Store `fingerprint` as the last synced content of `key`.
    pub async fn record(&self, key: &str, fingerprint: &str) -> CacheEntry {
        let sync_count = self.entry(key).await.map_or(1, |previous| previous.sync_count + 1);
        let entry = CacheEntry {
            key: key.to_string(),
            content_hash: fingerprint.to_string(),
            last_synced: Utc::now(),
            sync_count,
        };
        for slot in &self.tiers {
            match slot.tier.save(&entry).await {
                Ok(()) => slot.mark_ok(),
                Err(err) => slot.mark_failed(&err),
            }
        }
        entry
    }

    pub async fn invalidate(&self, key: &str) {
        for slot in &self.tiers {
            match slot.tier.remove(key).await {
                Ok(()) => slot.mark_ok(),
                Err(err) => slot.mark_failed(&err),
            }
        }
    }

    pub fn tier_health(&self) -> Vec<TierHealth> {
        self.tiers
            .iter()
            .map(|slot| TierHealth {
                name: slot.tier.name(),
                available: slot.available.load(Ordering::Acquire),
                failures: slot.failures.load(Ordering::Relaxed),
                last_error: slot.last_error.lock().clone(),
            })
            .collect()
    }

    fn is_stale(&self, entry: &CacheEntry) -> bool {
        let age = Utc::now().signed_duration_since(entry.last_synced);
        age.to_std().is_ok_and(|age| age > self.max_age)
    }
}

#[cfg(test)]
mod tests {
    use relaysync_common::resilience::{CircuitBreaker, CircuitBreakerConfig};
    use serde_json::json;

    use super::*;
    use crate::testing::InMemoryStore;

    fn tiered_over(store: Arc<InMemoryStore>) -> SyncCache {
        let breaker = CircuitBreaker::new("infrastructure", CircuitBreakerConfig::default()).unwrap();
        SyncCache::tiered(GuardedStore::new(store, Arc::new(breaker)), &CacheConfig::default())
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = SyncCache::fingerprint(&json!({ "sku": "A-1", "qty": 3 }));
        let b = SyncCache::fingerprint(&json!({ "qty": 3, "sku": "A-1" }));
        let c = SyncCache::fingerprint(&json!({ "qty": 4, "sku": "A-1" }));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn round_trip_detects_no_change() {
        let cache = SyncCache::memory_only(&CacheConfig::default());
        let fp = SyncCache::fingerprint(&json!({ "qty": 3 }));

        assert_eq!(cache.check("inv:1", &fp).await, CacheCheck::Changed { previous: None });
        cache.record("inv:1", &fp).await;
        assert_eq!(cache.check("inv:1", &fp).await, CacheCheck::Unchanged);

        let changed = SyncCache::fingerprint(&json!({ "qty": 4 }));
        assert_eq!(
            cache.check("inv:1", &changed).await,
            CacheCheck::Changed { previous: Some(fp.clone()) }
        );
        let entry = cache.record("inv:1", &changed).await;
        assert_eq!(entry.sync_count, 2);
        assert_eq!(entry.content_hash, changed);
    }

    #[tokio::test]
    async fn stale_entries_count_as_missing() {
        let cache = SyncCache::memory_only(&CacheConfig::default());
        let stale = CacheEntry {
            key: "inv:1".into(),
            content_hash: "abc".into(),
            last_synced: Utc::now() - chrono::Duration::days(2),
            sync_count: 7,
        };
        cache.tiers[0].tier.save(&stale).await.unwrap();

        assert!(cache.entry("inv:1").await.is_none());
        assert!(!cache.check("inv:1", "abc").await.is_unchanged());
    }

    #[tokio::test]
    async fn shared_tier_is_written_through() {
        let store = Arc::new(InMemoryStore::new());
        let cache = tiered_over(Arc::clone(&store));
        cache.record("inv:1", "abc").await;

        let raw = store.raw("relaysync:cache:inv:1").unwrap();
        let entry: CacheEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.content_hash, "abc");

        cache.invalidate("inv:1").await;
        assert!(store.raw("relaysync:cache:inv:1").is_none());
        assert!(cache.entry("inv:1").await.is_none());
    }

    #[tokio::test]
    async fn falls_back_to_memory_when_store_is_down() {
        let store = Arc::new(InMemoryStore::new());
        let cache = tiered_over(Arc::clone(&store));
        cache.record("inv:1", "abc").await;

        store.set_available(false);
        assert_eq!(cache.check("inv:1", "abc").await, CacheCheck::Unchanged);

        let health = cache.tier_health();
        assert_eq!(health[0].name, "shared");
        assert!(!health[0].available);
        assert!(health[0].failures >= 1);
        assert!(health[1].available);

        store.set_available(true);
        assert_eq!(cache.check("inv:1", "abc").await, CacheCheck::Unchanged);
        assert!(cache.tier_health()[0].available);
    }
}
