//! Dynamically scaled worker pool
//!
//! A pool keeps between `min_workers` and `max_workers` execution units.
//! Tasks are registered by name and queued with a priority; a single
//! dispatch actor hands them to idle units, highest priority first and in
//! arrival order among equals. Each run races its timeout: on expiry the
//! caller gets [`PoolError::Timeout`] and the unit is reassigned while the
//! abandoned run finishes in the background.
//!
//! Tasks submitted with [`TaskOptions::locked`] run inside
//! [`DistributedLock::with_lock`], so at most one run per resource id is in
//! flight across every pool sharing the lock store. A contended lock comes
//! back as [`TaskResult::Skipped`]. When the lock store is unreachable the
//! task runs unlocked and `pool.lock_degraded` is logged.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use relaysync_core::pool::{PoolTask, TaskOptions, WorkerPool};
//! # use relaysync_domain::PoolConfig;
//! # async fn example(task: Arc<dyn PoolTask>) -> Result<(), Box<dyn std::error::Error>> {
//! let pool = WorkerPool::start(PoolConfig::default());
//! pool.register_task("push_inventory", task);
//!
//! let result = pool
//!     .run_task("push_inventory", serde_json::json!({ "sku": "A-1" }), TaskOptions::default())
//!     .await?;
//! println!("{result:?}");
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod dispatcher;
pub mod ports;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use relaysync_domain::PoolConfig;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use dispatcher::{Command, Dispatcher, Job, LockBinding};
pub use ports::{PoolError, PoolMetrics, PoolTask, TaskOptions, TaskResult};

use crate::lock::{DistributedLock, LockOptions};

pub type PoolResult<T> = Result<T, PoolError>;

/// Handle to a running pool
///
/// Must be created inside a tokio runtime. Dropping the last handle stops
/// the dispatcher once queued work has been failed with `ShutDown`.
pub struct WorkerPool {
    config: PoolConfig,
    tasks: DashMap<String, Arc<dyn PoolTask>>,
    commands: mpsc::UnboundedSender<Command>,
    metrics: watch::Receiver<PoolMetrics>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("tasks", &self.tasks.len())
            .field("metrics", &*self.metrics.borrow())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn start(config: PoolConfig) -> Self {
        Self::spawn(config, None)
    }

    /// Start a pool whose locked tasks coordinate through `lock`.
    pub fn start_with_lock(config: PoolConfig, lock: DistributedLock, options: LockOptions) -> Self {
        Self::spawn(config, Some(LockBinding { lock, options }))
    }

    fn spawn(config: PoolConfig, lock: Option<LockBinding>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (publish, metrics) = watch::channel(PoolMetrics::default());
        let dispatcher = Dispatcher::new(config.clone(), lock, publish);
        let actor = tokio::spawn(dispatcher.run(receiver));
        info!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            "pool.started"
        );
        Self { config, tasks: DashMap::new(), commands, metrics, actor: Mutex::new(Some(actor)) }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register `task` under `name`, replacing any earlier registration.
    pub fn register_task(&self, name: impl Into<String>, task: Arc<dyn PoolTask>) {
        self.tasks.insert(name.into(), task);
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Queue `name` with `params` and wait for its result.
    #[instrument(skip(self, params, options), fields(priority = options.priority))]
    pub async fn run_task(
        &self,
        name: &str,
        params: Value,
        options: TaskOptions,
    ) -> PoolResult<TaskResult> {
        let task = self
            .tasks
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PoolError::UnknownTask(name.to_string()))?;
        if options.use_distributed_lock && options.lock_resource_id.is_none() {
            return Err(PoolError::MissingLockResource);
        }

        let timeout = options.timeout.unwrap_or_else(|| self.config.task_timeout());
        let (reply, response) = oneshot::channel();
        let job = Job { name: name.to_string(), task, params, options, timeout, reply };
        self.commands.send(Command::Submit(job)).map_err(|_| PoolError::ShutDown)?;

        response.await.unwrap_or_else(|_| {
            Err(PoolError::Crashed {
                task: name.to_string(),
                message: "worker dropped the task without replying".to_string(),
            })
        })
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.borrow().clone()
    }

    /// Receiver that observes every metrics update.
    pub fn subscribe(&self) -> watch::Receiver<PoolMetrics> {
        self.metrics.clone()
    }

    /// Fail queued tasks with [`PoolError::ShutDown`], let running tasks
    /// finish, and stop every unit. Later calls return at once.
    pub async fn shutdown(&self) {
        let (ack, acked) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = acked.await;
        }
        let actor = self.actor.lock().take();
        if let Some(actor) = actor {
            if let Err(err) = actor.await {
                warn!(error = %err, "pool.dispatcher_join_failed");
            }
        }
    }
}
