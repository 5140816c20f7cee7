//! Reports produced by a synchronization run
//!
//! - [`ItemReport`]: final outcome of one work item
//! - [`BatchSnapshot`]: periodic progress of a run, sent to the metrics sink
//! - [`SubmitReport`]: totals returned to the caller when a run finishes

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::work_item::WorkStatus;
use crate::impl_domain_status_conversions;

/* -------------------------------------------------------------------------- */
/* Submission */
/* -------------------------------------------------------------------------- */

/// Options for one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Name of the registered task that performs the synchronization
    pub sync_kind: String,
    /// Overrides the configured initial batch size for this run
    #[serde(default)]
    pub batch_size_hint: Option<usize>,
}

impl SubmitOptions {
    pub fn new(sync_kind: impl Into<String>) -> Self {
        Self { sync_kind: sync_kind.into(), batch_size_hint: None }
    }

    pub fn with_batch_size_hint(mut self, hint: usize) -> Self {
        self.batch_size_hint = Some(hint);
        self
    }
}

/* -------------------------------------------------------------------------- */
/* Per-item outcome */
/* -------------------------------------------------------------------------- */

/// Terminal outcome class of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Error,
    Skipped,
}

impl_domain_status_conversions!(ItemStatus {
    Success => "success",
    Error => "error",
    Skipped => "skipped",
});

impl From<ItemStatus> for WorkStatus {
    fn from(status: ItemStatus) -> Self {
        match status {
            ItemStatus::Success => WorkStatus::Succeeded,
            ItemStatus::Error => WorkStatus::Failed,
            ItemStatus::Skipped => WorkStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub item_id: String,
    pub status: ItemStatus,
    /// Success detail, skip reason or error text
    pub message: Option<String>,
    /// Task invocations made for this item (0 when skipped before running)
    pub attempts: u32,
    pub latency_ms: u64,
    /// Fingerprint of the payload this outcome synchronized, when the item
    /// is now in sync with it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl ItemReport {
    pub fn success(item_id: impl Into<String>, detail: Option<String>) -> Self {
        Self::new(item_id, ItemStatus::Success, detail)
    }

    pub fn skipped(item_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(item_id, ItemStatus::Skipped, Some(reason.into()))
    }

    pub fn error(item_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(item_id, ItemStatus::Error, Some(message.into()))
    }

    fn new(item_id: impl Into<String>, status: ItemStatus, message: Option<String>) -> Self {
        Self {
            item_id: item_id.into(),
            status,
            message,
            attempts: 0,
            latency_ms: 0,
            content_hash: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_content_hash(mut self, content_hash: impl Into<String>) -> Self {
        self.content_hash = Some(content_hash.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/* -------------------------------------------------------------------------- */
/* Run progress */
/* -------------------------------------------------------------------------- */

/// Progress snapshot of a running submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub run_id: Uuid,
    pub sync_kind: String,
    /// Batches completed so far
    pub batches_completed: usize,
    pub processed: usize,
    pub success: usize,
    pub error: usize,
    pub skipped: usize,
    pub remaining: usize,
    pub current_batch_size: usize,
    pub avg_latency_ms: f64,
    pub consecutive_error_batches: u32,
    pub total_backoff_ms: u64,
    /// Last snapshot of the run
    pub is_final: bool,
    pub at: DateTime<Utc>,
}

/// Totals returned when a submission finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReport {
    pub run_id: Uuid,
    pub sync_kind: String,
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub skipped: usize,
    pub final_batch_size: usize,
    pub avg_latency_ms: f64,
    pub batches: usize,
    pub items: Vec<ItemReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SubmitReport {
    pub fn avg_latency(&self) -> Duration {
        Duration::from_secs_f64(self.avg_latency_ms.max(0.0) / 1000.0)
    }

    /// Every submitted item is accounted for exactly once.
    pub fn is_consistent(&self) -> bool {
        self.success + self.error + self.skipped == self.total && self.items.len() == self.total
    }

    pub fn item(&self, item_id: &str) -> Option<&ItemReport> {
        self.items.iter().find(|r| r.item_id == item_id)
    }
}
