//! Domain types and models
//!
//! Work items flow in from the caller or a work-item source, are scored and
//! batched by the engine, and come back out as per-item and per-run reports.

pub mod report;
pub mod work_item;

pub use report::{BatchSnapshot, ItemReport, ItemStatus, SubmitOptions, SubmitReport};
pub use work_item::{DomainHints, TaskOutcome, WorkItem, WorkStatus};
