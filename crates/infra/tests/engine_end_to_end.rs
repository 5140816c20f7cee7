//! Engine wired to the infra adapters: file config, memory store and
//! source, JSON-lines progress file.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use relaysync_core::store::SharedStore;
use relaysync_core::testing::{ScriptedTask, Step};
use relaysync_core::{SyncEngine, SyncError};
use relaysync_domain::constants::SKIP_REASON_NO_CHANGE;
use relaysync_domain::{DomainHints, EngineConfig, SubmitOptions, WorkItem, WorkStatus};
use relaysync_infra::{config, JsonlSnapshotSink, MemoryStore, MemoryWorkItemSource};
use serde_json::{json, Value};
use tempfile::TempDir;

fn engine_config(dir: &TempDir) -> EngineConfig {
    let path = dir.path().join("relaysync.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"
[scheduler]
initial_batch_size = 5
min_batch_size = 5

[pool]
min_workers = 2
max_workers = 4

[retry]
max_attempts = 2
initial_delay_ms = 100
jitter = "none"
"#
    )
    .unwrap();
    config::load_from_file(Some(path)).unwrap()
}

fn catalogue(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| {
            WorkItem::new(format!("sku-{i}"), format!("gid://product/{i}"))
                .with_payload(json!({ "qty": i, "price": 5 }))
                .with_hints(DomainHints { quantity: Some(i as i64), ..DomainHints::default() })
        })
        .collect()
}

async fn progress_lines(sink: &JsonlSnapshotSink) -> Vec<Value> {
    tokio::fs::read_to_string(sink.path())
        .await
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn full_run_writes_back_statuses_and_progress() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let items = catalogue(12);
    let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();

    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(MemoryWorkItemSource::with_items(items));
    let sink = Arc::new(JsonlSnapshotSink::open(dir.path().join("progress.jsonl")).await?);
    let task = Arc::new(ScriptedTask::new("shop").with_latency(Duration::from_millis(50)));
    task.script("sku-4", [Step::Fail(SyncError::transient("503")), Step::Succeed]);
    task.script("sku-9", [Step::Fail(SyncError::not_found("gid://product/9"))]);

    let engine = SyncEngine::builder()
        .config(engine_config(&dir))
        .store(store.clone())
        .source(source.clone())
        .sink(sink.clone())
        .task("inventory", task.clone())
        .build()?;

    let report = engine.submit_batch(&ids, SubmitOptions::new("inventory")).await?;

    assert!(report.is_consistent());
    assert_eq!(report.success, 11);
    assert_eq!(report.error, 1);
    assert_eq!(report.item("sku-4").unwrap().attempts, 2);
    assert_eq!(task.calls("sku-9"), 1);

    assert_eq!(source.get("sku-4").unwrap().status, WorkStatus::Succeeded);
    let failed = source.get("sku-9").unwrap();
    assert_eq!(failed.status, WorkStatus::Failed);
    assert_eq!(failed.last_message.as_deref(), Some("not found: gid://product/9"));

    let lines = progress_lines(&sink).await;
    let snapshots: Vec<&Value> = lines.iter().filter(|line| line["record"] == "snapshot").collect();
    assert!(snapshots.len() >= 2);
    assert_eq!(snapshots.last().unwrap()["is_final"], true);
    assert_eq!(snapshots.last().unwrap()["processed"], 12);
    assert!(lines.iter().any(|line| line["record"] == "rate_limit" && line["name"] == "shop"));

    assert!(store.keys("relaysync:lock:").await?.is_empty());
    assert_eq!(store.keys("relaysync:cache:").await?.len(), 11);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn resubmitting_unchanged_items_skips_them() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let items = catalogue(6);
    let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
    let source = Arc::new(MemoryWorkItemSource::with_items(items));
    let task = Arc::new(ScriptedTask::new("shop"));

    let engine = SyncEngine::builder()
        .config(engine_config(&dir))
        .store(Arc::new(MemoryStore::new()))
        .source(source.clone())
        .task("inventory", task.clone())
        .build()?;

    engine.submit_batch(&ids, SubmitOptions::new("inventory")).await?;
    let second = engine.submit_batch(&ids, SubmitOptions::new("inventory")).await?;

    assert_eq!(second.skipped, 6);
    assert!(second.items.iter().all(|item| item.message.as_deref() == Some(SKIP_REASON_NO_CHANGE)));
    assert_eq!(task.total_calls(), 6);
    assert_eq!(source.ids_with_status(WorkStatus::Skipped).len(), 6);

    engine.shutdown().await;
    Ok(())
}
