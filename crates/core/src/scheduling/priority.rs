//! Urgency scoring for pending work items
//!
//! Scores are additive and the function is pure: the same items and the same
//! `now` always give the same order.

use chrono::{DateTime, Duration, Utc};
use relaysync_domain::{PrioritySettings, WorkItem};

/// Weights of the individual scoring signals
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityWeights {
    pub last_attempt_failed: i64,
    pub updated_within_1h: i64,
    pub updated_within_3h: i64,
    pub updated_within_24h: i64,
    pub new_item: i64,
    pub low_quantity: i64,
    pub high_value: i64,
    /// Quantities at or below this count as low
    pub low_quantity_threshold: i64,
    /// Unit values at or above this count as high
    pub high_value_threshold: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self::from(&PrioritySettings::default())
    }
}

impl From<&PrioritySettings> for PriorityWeights {
    fn from(settings: &PrioritySettings) -> Self {
        Self {
            last_attempt_failed: settings.last_attempt_failed,
            updated_within_1h: settings.updated_within_1h,
            updated_within_3h: settings.updated_within_3h,
            updated_within_24h: settings.updated_within_24h,
            new_item: settings.new_item,
            low_quantity: settings.low_quantity,
            high_value: settings.high_value,
            low_quantity_threshold: settings.low_quantity_threshold,
            high_value_threshold: settings.high_value_threshold,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PriorityScorer {
    weights: PriorityWeights,
}

impl PriorityScorer {
    pub fn new(weights: PriorityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &PriorityWeights {
        &self.weights
    }

    pub fn score(&self, item: &WorkItem, now: DateTime<Utc>) -> i64 {
        let w = &self.weights;
        let mut score = 0;

        if item.last_attempt_failed() {
            score += w.last_attempt_failed;
        }

        // Timestamps from the future count as "just updated".
        let age = now.signed_duration_since(item.last_modified).max(Duration::zero());
        score += if age < Duration::hours(1) {
            w.updated_within_1h
        } else if age < Duration::hours(3) {
            w.updated_within_3h
        } else if age < Duration::hours(24) {
            w.updated_within_24h
        } else {
            0
        };

        if item.hints.is_new {
            score += w.new_item;
        }
        if item.hints.quantity.is_some_and(|q| q <= w.low_quantity_threshold) {
            score += w.low_quantity;
        }
        if item.hints.unit_value.is_some_and(|v| v >= w.high_value_threshold) {
            score += w.high_value;
        }

        score
    }

    /// Score every item and sort by descending score; ties keep arrival
    /// order.
    pub fn rank(&self, mut items: Vec<WorkItem>, now: DateTime<Utc>) -> Vec<WorkItem> {
        for item in &mut items {
            item.priority = self.score(item, now);
        }
        items.sort_by(|a, b| b.priority.cmp(&a.priority));
        items
    }
}

#[cfg(test)]
mod tests {
    use relaysync_domain::{DomainHints, WorkStatus};

    use super::*;

    fn item(id: &str, age: Duration, now: DateTime<Utc>) -> WorkItem {
        WorkItem::new(id, format!("ext-{id}")).with_last_modified(now - age)
    }

    #[test]
    fn failure_outweighs_everything_else() {
        let now = Utc::now();
        let scorer = PriorityScorer::default();

        let failed = item("failed", Duration::days(3), now).with_status(WorkStatus::Failed);
        let fresh_new = item("fresh", Duration::minutes(5), now).with_hints(DomainHints {
            quantity: Some(1),
            unit_value: Some(500.0),
            is_new: true,
        });

        assert_eq!(scorer.score(&failed, now), 100);
        assert_eq!(scorer.score(&fresh_new, now), 30 + 25 + 15 + 10);
        assert!(scorer.score(&failed, now) > scorer.score(&fresh_new, now));
    }

    #[test]
    fn recency_bands_taper() {
        let now = Utc::now();
        let scorer = PriorityScorer::default();

        assert_eq!(scorer.score(&item("a", Duration::minutes(59), now), now), 30);
        assert_eq!(scorer.score(&item("b", Duration::hours(2), now), now), 20);
        assert_eq!(scorer.score(&item("c", Duration::hours(23), now), now), 10);
        assert_eq!(scorer.score(&item("d", Duration::hours(25), now), now), 0);
        assert_eq!(scorer.score(&item("e", Duration::hours(-1), now), now), 30);
    }

    #[test]
    fn thresholds_are_inclusive() {
        let now = Utc::now();
        let scorer = PriorityScorer::default();
        let at_threshold = item("a", Duration::days(2), now).with_hints(DomainHints {
            quantity: Some(10),
            unit_value: Some(100.0),
            is_new: false,
        });
        let above = item("b", Duration::days(2), now).with_hints(DomainHints {
            quantity: Some(11),
            unit_value: Some(99.99),
            is_new: false,
        });

        assert_eq!(scorer.score(&at_threshold, now), 25);
        assert_eq!(scorer.score(&above, now), 0);
    }

    #[test]
    fn weights_follow_priority_settings() {
        let now = Utc::now();
        let settings = PrioritySettings { last_attempt_failed: 5, new_item: 200, ..PrioritySettings::default() };
        let scorer = PriorityScorer::new(PriorityWeights::from(&settings));

        let failed = item("failed", Duration::days(2), now).with_status(WorkStatus::Failed);
        let new = item("new", Duration::days(2), now)
            .with_hints(DomainHints { is_new: true, ..DomainHints::default() });

        assert_eq!(scorer.score(&failed, now), 5);
        assert_eq!(scorer.score(&new, now), 200);
        assert_eq!(PriorityWeights::default(), PriorityWeights::from(&PrioritySettings::default()));
    }

    #[test]
    fn rank_is_stable_and_descending() {
        let now = Utc::now();
        let scorer = PriorityScorer::default();
        let items = vec![
            item("old-1", Duration::days(2), now),
            item("recent", Duration::minutes(1), now),
            item("old-2", Duration::days(2), now),
            item("failed", Duration::days(2), now).with_status(WorkStatus::Failed),
            item("old-3", Duration::days(2), now),
        ];

        let ranked = scorer.rank(items, now);
        let ids: Vec<_> = ranked.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["failed", "recent", "old-1", "old-2", "old-3"]);
        assert_eq!(ranked[0].priority, 100);
    }
}
