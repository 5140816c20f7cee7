//! Cache tiers: the shared store and an in-process fallback

use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use relaysync_domain::constants::CACHE_KEY_PREFIX;
use thiserror::Error;

use super::CacheEntry;
use crate::store::GuardedStore;

#[derive(Debug, Error)]
pub enum TierError {
    #[error("cache tier '{tier}' unavailable: {message}")]
    Unavailable { tier: &'static str, message: String },

    #[error("cache tier '{tier}' returned a corrupt entry: {message}")]
    Corrupt { tier: &'static str, message: String },
}

/// One storage layer of the sync cache
///
/// Tiers are tried in order; an `Err` means "this tier cannot answer right
/// now" and moves the lookup on to the next one.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, TierError>;

    async fn save(&self, entry: &CacheEntry) -> Result<(), TierError>;

    async fn remove(&self, key: &str) -> Result<(), TierError>;
}

/// Entries stored as JSON in the shared store, expiring after `max_age`
#[derive(Debug, Clone)]
pub struct SharedStoreTier {
    store: GuardedStore,
    max_age: Duration,
}

impl SharedStoreTier {
    pub fn new(store: GuardedStore, max_age: Duration) -> Self {
        Self { store, max_age }
    }

    fn key(key: &str) -> String {
        format!("{CACHE_KEY_PREFIX}{key}")
    }

    fn unavailable(err: impl std::fmt::Display) -> TierError {
        TierError::Unavailable { tier: "shared", message: err.to_string() }
    }
}

#[async_trait]
impl CacheTier for SharedStoreTier {
    fn name(&self) -> &'static str {
        "shared"
    }

    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        let raw = self.store.get(&Self::key(key)).await.map_err(Self::unavailable)?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| TierError::Corrupt { tier: "shared", message: e.to_string() })
        })
        .transpose()
    }

    async fn save(&self, entry: &CacheEntry) -> Result<(), TierError> {
        let json = serde_json::to_string(entry)
            .map_err(|e| TierError::Corrupt { tier: "shared", message: e.to_string() })?;
        self.store
            .set(&Self::key(&entry.key), &json, Some(self.max_age))
            .await
            .map_err(Self::unavailable)
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        self.store.delete(&Self::key(key)).await.map(|_| ()).map_err(Self::unavailable)
    }
}

/// Bounded in-process tier with age and size eviction
#[derive(Debug, Clone)]
pub struct MemoryTier {
    entries: Cache<String, CacheEntry>,
}

impl MemoryTier {
    pub fn new(capacity: u64, max_age: Duration) -> Self {
        Self { entries: Cache::builder().max_capacity(capacity).time_to_live(max_age).build() }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        Ok(self.entries.get(key).await)
    }

    async fn save(&self, entry: &CacheEntry) -> Result<(), TierError> {
        self.entries.insert(entry.key.clone(), entry.clone()).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}
