//! Work items and their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::impl_domain_status_conversions;

/// Lifecycle status of a work item
///
/// `Pending -> Locked -> {Succeeded, Skipped, Failed}`. Items may also go
/// straight from `Pending` to `Skipped` (unchanged content or lock held
/// elsewhere) or `Failed` (unknown task, circuit open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    #[default]
    Pending,
    Locked,
    Succeeded,
    Skipped,
    Failed,
}

impl_domain_status_conversions!(WorkStatus {
    Pending => "pending",
    Locked => "locked",
    Succeeded => "succeeded",
    Skipped => "skipped",
    Failed => "failed",
});

impl WorkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    ///
    /// Terminal items may be resubmitted, which puts them back to `Pending`.
    pub fn can_transition_to(self, next: WorkStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Locked | Self::Skipped | Self::Failed | Self::Succeeded) => true,
            (Self::Locked, Self::Succeeded | Self::Skipped | Self::Failed) => true,
            (from, Self::Pending) => from.is_terminal(),
            _ => false,
        }
    }
}

/// Business signals supplied by the work-item source
///
/// Only used for prioritisation; the engine never interprets them otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainHints {
    /// Remaining stock or quota on the record, if known
    #[serde(default)]
    pub quantity: Option<i64>,
    /// Monetary value of one unit, if known
    #[serde(default)]
    pub unit_value: Option<f64>,
    /// Record has never been synchronized before
    #[serde(default)]
    pub is_new: bool,
}

/// One record to reconcile between the two services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub external_reference: String,
    /// Fingerprint of the content at the last successful sync
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Urgency score assigned by the priority scorer
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default)]
    pub attempts: u32,
    pub last_modified: DateTime<Utc>,
    /// Human readable message from the last terminal outcome
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub hints: DomainHints,
    /// Content handed to the task and fingerprinted for change detection
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, external_reference: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external_reference: external_reference.into(),
            content_hash: None,
            priority: 0,
            status: WorkStatus::Pending,
            attempts: 0,
            last_modified: Utc::now(),
            last_message: None,
            hints: DomainHints::default(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_content_hash(mut self, content_hash: impl Into<String>) -> Self {
        self.content_hash = Some(content_hash.into());
        self
    }

    pub fn with_hints(mut self, hints: DomainHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_status(mut self, status: WorkStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = last_modified;
        self
    }

    /// The previous attempt on this item ended in an error.
    pub fn last_attempt_failed(&self) -> bool {
        self.status == WorkStatus::Failed
    }
}

/// Non-error result of a synchronization task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        #[serde(default)]
        detail: Option<String>,
    },
    Skipped {
        reason: String,
    },
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self::Success { detail: None }
    }

    pub fn success_with(detail: impl Into<String>) -> Self {
        Self::Success { detail: Some(detail.into()) }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped { reason: reason.into() }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lifecycle() {
        assert!(WorkStatus::Pending.can_transition_to(WorkStatus::Locked));
        assert!(WorkStatus::Locked.can_transition_to(WorkStatus::Succeeded));
        assert!(WorkStatus::Failed.can_transition_to(WorkStatus::Pending));
        assert!(!WorkStatus::Locked.can_transition_to(WorkStatus::Pending));
        assert!(!WorkStatus::Succeeded.can_transition_to(WorkStatus::Locked));
        assert!(WorkStatus::Skipped.is_terminal());
        assert!(!WorkStatus::Locked.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&WorkStatus::Succeeded).unwrap(), "\"succeeded\"");
        assert_eq!("FAILED".parse::<WorkStatus>().unwrap(), WorkStatus::Failed);
    }

    #[test]
    fn work_item_deserializes_with_defaults() {
        let item: WorkItem = serde_json::from_value(serde_json::json!({
            "id": "sku-1",
            "external_reference": "gid://product/1",
            "last_modified": "2024-05-01T10:00:00Z",
            "hints": { "quantity": 3 }
        }))
        .unwrap();

        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.hints.quantity, Some(3));
        assert!(!item.hints.is_new);
        assert!(item.payload.is_null());
    }

    #[test]
    fn task_outcome_tagging() {
        let json = serde_json::to_value(TaskOutcome::skipped("no change")).unwrap();
        assert_eq!(json, serde_json::json!({ "outcome": "skipped", "reason": "no change" }));
        assert!(TaskOutcome::skipped("x").is_skipped());
        assert!(!TaskOutcome::success().is_skipped());
    }
}
