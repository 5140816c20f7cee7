//! Batch synchronization: ports, the per-item pipeline and the engine

pub mod engine;
pub mod pipeline;
pub mod ports;

pub use engine::{SyncEngine, SyncEngineBuilder};
pub use pipeline::{ItemPipeline, PipelineTask};
pub use ports::{MetricsSink, SyncTask, TaskContext, WorkItemSource};
