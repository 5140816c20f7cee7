//! Integration tests for configuration loader
//!
//! Tests the end-to-end behavior of loading configuration from files and the
//! environment.

use std::io::Write;
use std::sync::Mutex;

use relaysync_domain::{JitterMode, RelaySyncError};
use relaysync_infra::config;
use tempfile::{Builder, NamedTempFile};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().expect("Failed to create temp file");
    file.write_all(contents.as_bytes()).expect("Failed to write to temp file");
    file
}

#[test]
fn test_load_config_from_toml_file() {
    let file = config_file(
        ".toml",
        r#"
[scheduler]
initial_batch_size = 20
max_batch_size = 50

[pool]
min_workers = 1
max_workers = 6
task_timeout_ms = 10000

[lock]
ttl_ms = 15000
skip_if_locked = false

[retry]
max_attempts = 5
jitter = "none"

[rate_limits.shop]
capacity = 2
window_ms = 1000
"#,
    );

    let config = config::load_from_file(Some(file.path().to_path_buf()))
        .expect("Failed to load config from TOML file");

    assert_eq!(config.scheduler.initial_batch_size, 20);
    assert_eq!(config.scheduler.max_batch_size, 50);
    assert_eq!(config.scheduler.min_batch_size, 5);
    assert_eq!(config.pool.max_workers, 6);
    assert_eq!(config.pool.task_timeout().as_secs(), 10);
    assert_eq!(config.lock.ttl_ms, 15_000);
    assert!(!config.lock.skip_if_locked);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.jitter, JitterMode::None);
    assert_eq!(config.rate_limit_for("shop").capacity, 2);
    assert_eq!(config.rate_limit_for("erp").capacity, 40);
}

#[test]
fn test_load_config_from_json_file() {
    let file = config_file(
        ".json",
        r#"{
            "cache": { "enabled": false },
            "circuit_breaker": { "failure_threshold": 3, "reset_timeout_ms": 5000 }
        }"#,
    );

    let config = config::load_from_file(Some(file.path().to_path_buf()))
        .expect("Failed to load config from JSON file");

    assert!(!config.cache.enabled);
    assert_eq!(config.circuit_breaker.failure_threshold, 3);
    assert_eq!(config.circuit_breaker.half_open_success_threshold, 2);
    assert_eq!(config.infrastructure_breaker.failure_threshold, 3);
}

#[test]
fn test_invalid_values_fail_validation() {
    let file = config_file(
        ".toml",
        r#"
[scheduler]
min_batch_size = 50
max_batch_size = 10
"#,
    );

    let err = config::load_from_file(Some(file.path().to_path_buf())).unwrap_err();
    assert!(matches!(err, RelaySyncError::Config(message) if message.contains("batch_size")));
}

#[test]
fn test_malformed_toml_is_rejected() {
    let file = config_file(".toml", "[pool\nmin_workers = ");

    let err = config::load_from_file(Some(file.path().to_path_buf())).unwrap_err();
    assert!(matches!(err, RelaySyncError::Config(_)));
}

#[test]
fn test_load_uses_explicit_path_and_env_overrides() {
    let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
    let file = config_file(".toml", "[pool]\nmin_workers = 1\nmax_workers = 3\n");

    std::env::set_var(config::CONFIG_PATH_VAR, file.path());
    std::env::set_var("RELAYSYNC_MAX_WORKERS", "5");
    let result = config::load();
    std::env::remove_var(config::CONFIG_PATH_VAR);
    std::env::remove_var("RELAYSYNC_MAX_WORKERS");

    let config = result.expect("Failed to load config");
    assert_eq!(config.pool.min_workers, 1);
    assert_eq!(config.pool.max_workers, 5);
}

#[test]
fn test_load_fails_when_explicit_path_is_missing() {
    let _guard = ENV_LOCK.lock().expect("env mutex poisoned");

    std::env::set_var(config::CONFIG_PATH_VAR, "/nonexistent/relaysync.toml");
    let result = config::load();
    std::env::remove_var(config::CONFIG_PATH_VAR);

    assert!(matches!(result, Err(RelaySyncError::Config(message)) if message.contains("not found")));
}
