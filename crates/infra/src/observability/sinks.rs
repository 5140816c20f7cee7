//! [`MetricsSink`] adapters

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use relaysync_common::resilience::{CircuitState, CircuitTransition, RateLimitInfo};
use relaysync_core::sync::MetricsSink;
use relaysync_domain::{BatchSnapshot, Result};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::errors::InfraError;

/// Reports every engine signal as a structured tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn record_snapshot(&self, snapshot: &BatchSnapshot) -> Result<()> {
        info!(
            run_id = %snapshot.run_id,
            kind = %snapshot.sync_kind,
            batches = snapshot.batches_completed,
            processed = snapshot.processed,
            success = snapshot.success,
            error = snapshot.error,
            skipped = snapshot.skipped,
            remaining = snapshot.remaining,
            batch_size = snapshot.current_batch_size,
            avg_latency_ms = snapshot.avg_latency_ms,
            backoff_ms = snapshot.total_backoff_ms,
            is_final = snapshot.is_final,
            "progress.snapshot"
        );
        Ok(())
    }

    fn record_transition(&self, transition: &CircuitTransition) {
        if transition.to == CircuitState::Open {
            warn!(
                breaker = %transition.name,
                from = ?transition.from,
                reason = ?transition.reason,
                "progress.circuit_opened"
            );
        } else {
            info!(
                breaker = %transition.name,
                from = ?transition.from,
                to = ?transition.to,
                reason = ?transition.reason,
                "progress.circuit_transition"
            );
        }
    }

    async fn record_rate_limit(&self, info: &RateLimitInfo) -> Result<()> {
        debug!(
            limiter = %info.name,
            tokens = info.tokens,
            capacity = info.capacity,
            fill_ratio = info.fill_ratio,
            throttled = info.throttled_total,
            throttled_delay_ms = info.throttled_delay_total_ms,
            "progress.rate_limit"
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Line<'a> {
    Snapshot(&'a BatchSnapshot),
    RateLimit(&'a RateLimitInfo),
    Transition(&'a CircuitTransition),
}

/// Appends engine signals to a JSON-lines file
///
/// Each line is one object tagged with `"record"`: `snapshot`, `rate_limit`
/// or `transition`. Transitions arrive on a synchronous path, so they are
/// buffered and written ahead of the next asynchronous record.
#[derive(Debug)]
pub struct JsonlSnapshotSink {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    pending: Mutex<Vec<String>>,
}

impl JsonlSnapshotSink {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file =
            OpenOptions::new().create(true).append(true).open(&path).await.map_err(InfraError::from)?;
        info!(path = %path.display(), "progress.jsonl_opened");
        Ok(Self { path, file: tokio::sync::Mutex::new(file), pending: Mutex::new(Vec::new()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write buffered transitions without waiting for the next record.
    pub async fn flush(&self) -> Result<()> {
        self.append(None).await
    }

    async fn append(&self, line: Option<String>) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut buffer = String::new();
        for pending in pending {
            buffer.push_str(&pending);
            buffer.push('\n');
        }
        if let Some(line) = line {
            buffer.push_str(&line);
            buffer.push('\n');
        }
        if buffer.is_empty() {
            return Ok(());
        }

        let mut file = self.file.lock().await;
        file.write_all(buffer.as_bytes()).await.map_err(InfraError::from)?;
        file.flush().await.map_err(InfraError::from)?;
        Ok(())
    }

    fn encode(line: &Line<'_>) -> Result<String> {
        Ok(serde_json::to_string(line).map_err(InfraError::from)?)
    }
}

#[async_trait]
impl MetricsSink for JsonlSnapshotSink {
    async fn record_snapshot(&self, snapshot: &BatchSnapshot) -> Result<()> {
        let line = Self::encode(&Line::Snapshot(snapshot))?;
        self.append(Some(line)).await
    }

    fn record_transition(&self, transition: &CircuitTransition) {
        match Self::encode(&Line::Transition(transition)) {
            Ok(line) => self.pending.lock().push(line),
            Err(err) => warn!(error = %err, "progress.encode_failed"),
        }
    }

    async fn record_rate_limit(&self, info: &RateLimitInfo) -> Result<()> {
        let line = Self::encode(&Line::RateLimit(info))?;
        self.append(Some(line)).await
    }
}
