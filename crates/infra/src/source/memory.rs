//! Work-item source held in process memory
//!
//! Can be seeded from a JSON array of work items on disk.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use relaysync_core::sync::WorkItemSource;
use relaysync_domain::{ItemReport, RelaySyncError, Result, WorkItem, WorkStatus};
use tracing::{debug, info};

use crate::errors::InfraError;

/// [`WorkItemSource`] over a concurrent map of items keyed by id
#[derive(Debug, Default)]
pub struct MemoryWorkItemSource {
    items: DashMap<String, WorkItem>,
}

impl MemoryWorkItemSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let source = Self::new();
        for item in items {
            source.upsert(item);
        }
        source
    }

    /// Read a JSON array of work items.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(InfraError::from)?;
        let items: Vec<WorkItem> = serde_json::from_str(&contents).map_err(InfraError::from)?;
        info!(path = %path.display(), items = items.len(), "source.loaded");
        Ok(Self::with_items(items))
    }

    /// Insert or replace an item.
    pub fn upsert(&self, item: WorkItem) {
        self.items.insert(item.id.clone(), item);
    }

    pub fn get(&self, id: &str) -> Option<WorkItem> {
        self.items.get(id).map(|item| item.clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ids of items currently in `status`, sorted.
    pub fn ids_with_status(&self, status: WorkStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .items
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl WorkItemSource for MemoryWorkItemSource {
    async fn load(&self, ids: &[String]) -> Result<Vec<WorkItem>> {
        Ok(ids.iter().filter_map(|id| self.get(id)).collect())
    }

    async fn record_outcome(&self, report: &ItemReport) -> Result<()> {
        let mut item = self
            .items
            .get_mut(&report.item_id)
            .ok_or_else(|| RelaySyncError::NotFound(report.item_id.clone()))?;

        let next = WorkStatus::from(report.status);
        if !item.status.can_transition_to(next) {
            debug!(item = %report.item_id, from = %item.status, to = %next, "source.status_reset");
        }
        item.status = next;
        item.attempts += report.attempts;
        item.last_message = report.message.clone();
        if let Some(hash) = &report.content_hash {
            item.content_hash = Some(hash.clone());
        }
        Ok(())
    }
}
