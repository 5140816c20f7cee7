//! Dispatch actor and execution units
//!
//! The dispatcher is the only owner of the queue, the unit table and the
//! counters. Callers reach it through the command channel; units report back
//! through the event channel. Units never touch shared pool state.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::ports::{PoolError, PoolMetrics, PoolTask, TaskOptions, TaskResult};
use crate::lock::{DistributedLock, LockOptions, LockedRun};
use relaysync_domain::PoolConfig;

pub(crate) type Reply = oneshot::Sender<Result<TaskResult, PoolError>>;

pub(crate) struct Job {
    pub name: String,
    pub task: Arc<dyn PoolTask>,
    pub params: Value,
    pub options: TaskOptions,
    pub timeout: Duration,
    pub reply: Reply,
}

pub(crate) enum Command {
    Submit(Job),
    Shutdown(oneshot::Sender<()>),
}

/// Lock manager and acquisition options shared by all units
#[derive(Debug, Clone)]
pub(crate) struct LockBinding {
    pub lock: DistributedLock,
    pub options: LockOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    TimedOut,
}

enum UnitEvent {
    Finished { unit: u64, outcome: Outcome },
    Crashed { unit: u64 },
}

struct Queued {
    priority: i64,
    seq: u64,
    job: Job,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier arrival.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct UnitSlot {
    id: u64,
    jobs: mpsc::Sender<Job>,
    busy: bool,
    last_used: Instant,
    handle: JoinHandle<()>,
}

pub(crate) struct Dispatcher {
    config: PoolConfig,
    lock: Option<LockBinding>,
    queue: BinaryHeap<Queued>,
    seq: u64,
    units: Vec<UnitSlot>,
    next_unit: u64,
    events_tx: mpsc::UnboundedSender<UnitEvent>,
    events_rx: mpsc::UnboundedReceiver<UnitEvent>,
    counters: PoolMetrics,
    publish: watch::Sender<PoolMetrics>,
    over_threshold_since: Option<Instant>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: PoolConfig,
        lock: Option<LockBinding>,
        publish: watch::Sender<PoolMetrics>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let counters = PoolMetrics {
            min_workers: config.min_workers,
            max_workers: config.max_workers.max(config.min_workers),
            ..PoolMetrics::default()
        };
        Self {
            config,
            lock,
            queue: BinaryHeap::new(),
            seq: 0,
            units: Vec::new(),
            next_unit: 0,
            events_tx,
            events_rx,
            counters,
            publish,
            over_threshold_since: None,
        }
    }

    fn min_workers(&self) -> usize {
        self.counters.min_workers
    }

    fn max_workers(&self) -> usize {
        self.counters.max_workers
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        for _ in 0..self.min_workers() {
            self.spawn_unit();
        }
        self.publish();

        let period = self.config.scale_check_interval().max(Duration::from_millis(1));
        let mut scaler = tokio::time::interval_at(Instant::now() + period, period);
        scaler.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit(job)) => self.enqueue(job),
                    Some(Command::Shutdown(ack)) => {
                        self.stop(&mut commands).await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.stop(&mut commands).await;
                        return;
                    }
                },
                Some(event) = self.events_rx.recv() => self.on_event(event),
                _ = scaler.tick() => self.scale(),
            }
            self.dispatch();
            self.publish();
        }
    }

    fn enqueue(&mut self, job: Job) {
        let seq = self.seq;
        self.seq += 1;
        debug!(task = %job.name, priority = job.options.priority, seq, "pool.task_queued");
        self.queue.push(Queued { priority: job.options.priority, seq, job });
    }

    fn spawn_unit(&mut self) {
        let id = self.next_unit;
        self.next_unit += 1;
        let (jobs, receiver) = mpsc::channel(1);
        let handle = tokio::spawn(unit_loop(id, receiver, self.events_tx.clone(), self.lock.clone()));
        self.units.push(UnitSlot { id, jobs, busy: false, last_used: Instant::now(), handle });
        self.counters.spawned += 1;
        debug!(unit = id, workers = self.units.len(), "pool.unit_spawned");
    }

    fn remove_unit(&mut self, id: u64) -> bool {
        let before = self.units.len();
        self.units.retain(|slot| slot.id != id);
        self.units.len() < before
    }

    fn replace_if_below_min(&mut self) {
        while self.units.len() < self.min_workers() {
            self.spawn_unit();
            info!(workers = self.units.len(), "pool.unit_replaced");
        }
    }

    fn on_event(&mut self, event: UnitEvent) {
        match event {
            UnitEvent::Finished { unit, outcome } => {
                match outcome {
                    Outcome::Completed => self.counters.completed += 1,
                    Outcome::Failed => self.counters.failed += 1,
                    Outcome::TimedOut => self.counters.timed_out += 1,
                }
                if let Some(slot) = self.units.iter_mut().find(|slot| slot.id == unit) {
                    slot.busy = false;
                    slot.last_used = Instant::now();
                }
            }
            UnitEvent::Crashed { unit } => {
                self.counters.crashed += 1;
                self.remove_unit(unit);
                warn!(unit, workers = self.units.len(), "pool.unit_crashed");
                self.replace_if_below_min();
            }
        }
    }

    /// Hand queued jobs to idle units, most recently used unit first so the
    /// least recently used ones age toward retirement.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(index) = self
                .units
                .iter()
                .enumerate()
                .filter(|(_, slot)| !slot.busy)
                .max_by_key(|(_, slot)| slot.last_used)
                .map(|(index, _)| index)
            else {
                return;
            };
            let Some(Queued { priority, seq, job }) = self.queue.pop() else {
                return;
            };

            let slot = &mut self.units[index];
            match slot.jobs.try_send(job) {
                Ok(()) => {
                    slot.busy = true;
                    slot.last_used = Instant::now();
                }
                Err(TrySendError::Full(job)) => {
                    slot.busy = true;
                    self.queue.push(Queued { priority, seq, job });
                }
                Err(TrySendError::Closed(job)) => {
                    let id = slot.id;
                    self.remove_unit(id);
                    self.queue.push(Queued { priority, seq, job });
                    self.replace_if_below_min();
                }
            }
        }
    }

    fn scale(&mut self) {
        let now = Instant::now();
        let depth = self.queue.len();
        let workers = self.units.len();

        if depth > self.config.scale_up_queue_depth {
            let since = *self.over_threshold_since.get_or_insert(now);
            if now.duration_since(since) >= self.config.scale_up_sustain()
                && workers < self.max_workers()
            {
                let add = (self.max_workers() - workers).min(depth - self.config.scale_up_queue_depth);
                for _ in 0..add {
                    self.spawn_unit();
                }
                self.over_threshold_since = None;
                info!(added = add, workers = self.units.len(), queued = depth, "pool.scaled_up");
            }
        } else {
            self.over_threshold_since = None;
        }

        if depth < self.config.scale_down_queue_depth && workers > self.min_workers() {
            let idle_timeout = self.config.idle_timeout();
            let mut idle: Vec<(Instant, u64)> = self
                .units
                .iter()
                .filter(|slot| !slot.busy && now.duration_since(slot.last_used) >= idle_timeout)
                .map(|slot| (slot.last_used, slot.id))
                .collect();
            idle.sort_unstable();

            let excess = workers - self.min_workers();
            let retired: Vec<u64> = idle.into_iter().take(excess).map(|(_, id)| id).collect();
            for id in &retired {
                self.remove_unit(*id);
            }
            if !retired.is_empty() {
                self.counters.retired += retired.len() as u64;
                info!(retired = retired.len(), workers = self.units.len(), "pool.scaled_down");
            }
        }
    }

    fn publish(&self) {
        let busy = self.units.iter().filter(|slot| slot.busy).count();
        let metrics = PoolMetrics {
            workers: self.units.len(),
            busy,
            idle: self.units.len() - busy,
            queued: self.queue.len(),
            ..self.counters.clone()
        };
        self.publish.send_replace(metrics);
    }

    async fn stop(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Submit(job) => {
                    let _ = job.reply.send(Err(PoolError::ShutDown));
                }
                Command::Shutdown(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        let abandoned = self.queue.len();
        for queued in self.queue.drain() {
            let _ = queued.job.reply.send(Err(PoolError::ShutDown));
        }

        // Closing the job channels lets each unit finish its current job.
        let units: Vec<UnitSlot> = self.units.drain(..).collect();
        let stopped = units.len();
        for slot in units {
            drop(slot.jobs);
            if let Err(err) = slot.handle.await {
                warn!(unit = slot.id, error = %err, "pool.unit_join_failed");
            }
        }
        self.counters.retired += stopped as u64;
        self.publish();
        info!(abandoned, stopped, "pool.shut_down");
    }
}

async fn unit_loop(
    id: u64,
    mut jobs: mpsc::Receiver<Job>,
    events: mpsc::UnboundedSender<UnitEvent>,
    lock: Option<LockBinding>,
) {
    while let Some(job) = jobs.recv().await {
        let Job { name, task, params, options, timeout, reply } = job;
        debug!(unit = id, task = %name, "pool.task_started");

        // Run on a separate task so a timed-out job can be abandoned while
        // this unit moves on.
        let mut running = tokio::spawn(execute(task, params, options, lock.clone()));
        let (result, outcome) = match tokio::time::timeout(timeout, &mut running).await {
            Ok(Ok(result)) => {
                let outcome = if result.is_ok() { Outcome::Completed } else { Outcome::Failed };
                (result, outcome)
            }
            Ok(Err(join_error)) => {
                let message = panic_message(join_error);
                error!(unit = id, task = %name, message = %message, "pool.task_panicked");
                let _ = reply.send(Err(PoolError::Crashed { task: name, message }));
                let _ = events.send(UnitEvent::Crashed { unit: id });
                return;
            }
            Err(_) => {
                warn!(
                    unit = id,
                    task = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "pool.task_timeout"
                );
                (Err(PoolError::Timeout { task: name, timeout }), Outcome::TimedOut)
            }
        };

        let _ = reply.send(result);
        if events.send(UnitEvent::Finished { unit: id, outcome }).is_err() {
            return;
        }
    }
    debug!(unit = id, "pool.unit_stopped");
}

async fn execute(
    task: Arc<dyn PoolTask>,
    params: Value,
    options: TaskOptions,
    lock: Option<LockBinding>,
) -> Result<TaskResult, PoolError> {
    if !options.use_distributed_lock {
        return task.run(params).await.map(TaskResult::Completed).map_err(PoolError::Task);
    }
    let Some(resource_id) = options.lock_resource_id else {
        return Err(PoolError::MissingLockResource);
    };
    let Some(binding) = lock else {
        warn!(resource = %resource_id, reason = "no lock configured", "pool.lock_degraded");
        return task.run(params).await.map(TaskResult::Completed).map_err(PoolError::Task);
    };

    let locked = binding.lock.with_lock(&resource_id, &binding.options, || task.run(params.clone())).await;
    match locked {
        Ok(LockedRun::Completed(value)) => Ok(TaskResult::Completed(value)),
        Ok(LockedRun::Failed(err)) => Err(PoolError::Task(err)),
        Ok(LockedRun::Skipped) => {
            debug!(resource = %resource_id, "pool.task_skipped_locked");
            Ok(TaskResult::Skipped { resource_id })
        }
        Err(err) => {
            warn!(resource = %resource_id, error = %err, "pool.lock_degraded");
            task.run(params).await.map(TaskResult::Completed).map_err(PoolError::Task)
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
