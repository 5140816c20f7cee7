//! Ordering and batching of work items
//!
//! [`PriorityScorer`] ranks items by urgency; [`AdaptiveBatchScheduler`]
//! slices the ranked list into batches and tunes the batch size from the
//! success rate and latency of each completed batch.

pub mod batch;
pub mod priority;

pub use batch::{AdaptiveBatchScheduler, BatchPlan, SchedulerRun, SchedulerStats, SizeDecision};
pub use priority::{PriorityScorer, PriorityWeights};
