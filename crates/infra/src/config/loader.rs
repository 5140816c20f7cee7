//! Configuration loader
//!
//! Loads the engine configuration from files and environment variables.
//!
//! ## Loading Strategy
//! 1. If `RELAYSYNC_CONFIG` is set, load that file (missing file is an error)
//! 2. Otherwise probe the standard locations for a config file
//! 3. Otherwise start from [`EngineConfig::default`]
//! 4. Apply scalar overrides from the environment
//! 5. Validate the result
//!
//! Every section of the file is optional; omitted values keep their
//! defaults.
//!
//! ## Environment Variables
//! - `RELAYSYNC_CONFIG`: Path of a TOML or JSON config file
//! - `RELAYSYNC_MIN_WORKERS` / `RELAYSYNC_MAX_WORKERS`: Pool bounds
//! - `RELAYSYNC_TASK_TIMEOUT_MS`: Per-task timeout
//! - `RELAYSYNC_INITIAL_BATCH_SIZE`, `RELAYSYNC_MIN_BATCH_SIZE`,
//!   `RELAYSYNC_MAX_BATCH_SIZE`: Scheduler bounds
//! - `RELAYSYNC_LOCK_ENABLED`, `RELAYSYNC_LOCK_TTL_MS`: Distributed lock
//! - `RELAYSYNC_CACHE_ENABLED`: Sync cache
//! - `RELAYSYNC_RETRY_MAX_ATTEMPTS`: Attempts per item
//!
//! ## File Locations
//! The loader probes the following paths (in order), first in the current
//! working directory and then next to the executable:
//! 1. `relaysync.toml`, `relaysync.json`
//! 2. `config.toml`, `config.json`

use std::path::{Path, PathBuf};
use std::str::FromStr;

use relaysync_domain::{EngineConfig, RelaySyncError, Result};

use crate::errors::InfraError;

/// Variable naming an explicit config file
pub const CONFIG_PATH_VAR: &str = "RELAYSYNC_CONFIG";

const CANDIDATE_FILES: [&str; 4] = ["relaysync.toml", "relaysync.json", "config.toml", "config.json"];

/// Load configuration with automatic fallback strategy
///
/// See the module documentation for the order of sources.
///
/// # Errors
/// Returns `RelaySyncError::Config` if:
/// - `RELAYSYNC_CONFIG` names a file that does not exist
/// - A config file cannot be parsed
/// - An override variable has an invalid value
/// - The resulting configuration fails validation
pub fn load() -> Result<EngineConfig> {
    let mut config = match std::env::var(CONFIG_PATH_VAR) {
        Ok(path) => read_file(&PathBuf::from(path))?,
        Err(_) => match probe_config_paths() {
            Some(path) => read_file(&path)?,
            None => {
                tracing::info!("config.defaults");
                EngineConfig::default()
            }
        },
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Defaults plus environment overrides, ignoring config files
///
/// # Errors
/// Returns `RelaySyncError::Config` if an override is malformed or the
/// result fails validation.
pub fn load_from_env() -> Result<EngineConfig> {
    let mut config = EngineConfig::default();
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations. Format is detected by
/// file extension (`.toml` or `.json`).
///
/// # Errors
/// Returns `RelaySyncError::Config` if:
/// - File not found (when path is specified)
/// - No config file found (when path is `None`)
/// - File format is invalid
/// - The configuration fails validation
pub fn load_from_file(path: Option<PathBuf>) -> Result<EngineConfig> {
    let config_path = match path {
        Some(p) => p,
        None => probe_config_paths().ok_or_else(|| {
            RelaySyncError::Config(
                "No config file found in any of the standard locations".to_string(),
            )
        })?,
    };

    let config = read_file(&config_path)?;
    config.validate()?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Err(RelaySyncError::Config(format!("Config file not found: {}", path.display())));
    }

    tracing::info!(path = %path.display(), "config.loading_file");

    let contents = std::fs::read_to_string(path).map_err(InfraError::from)?;
    parse_config(&contents, path)
}

/// Parse configuration from string content, picking the format from the
/// extension of `path`.
fn parse_config(contents: &str, path: &Path) -> Result<EngineConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => Ok(toml::from_str(contents).map_err(InfraError::from)?),
        "json" => serde_json::from_str(contents)
            .map_err(|e| RelaySyncError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(RelaySyncError::Config(format!("Unsupported config format: {extension}"))),
    }
}

/// First existing config file among the standard locations
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }
    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        dirs.push(exe_dir);
    }

    dirs.iter()
        .flat_map(|dir| CANDIDATE_FILES.iter().map(move |name| dir.join(name)))
        .find(|path| path.exists())
}

/// Apply the `RELAYSYNC_*` scalar overrides to `config`.
///
/// # Errors
/// Returns `RelaySyncError::Config` naming the variable that failed to parse.
pub fn apply_env_overrides(config: &mut EngineConfig) -> Result<()> {
    if let Some(value) = env_parse("RELAYSYNC_MIN_WORKERS")? {
        config.pool.min_workers = value;
    }
    if let Some(value) = env_parse("RELAYSYNC_MAX_WORKERS")? {
        config.pool.max_workers = value;
    }
    if let Some(value) = env_parse("RELAYSYNC_TASK_TIMEOUT_MS")? {
        config.pool.task_timeout_ms = value;
    }
    if let Some(value) = env_parse("RELAYSYNC_INITIAL_BATCH_SIZE")? {
        config.scheduler.initial_batch_size = value;
    }
    if let Some(value) = env_parse("RELAYSYNC_MIN_BATCH_SIZE")? {
        config.scheduler.min_batch_size = value;
    }
    if let Some(value) = env_parse("RELAYSYNC_MAX_BATCH_SIZE")? {
        config.scheduler.max_batch_size = value;
    }
    if let Some(value) = env_bool("RELAYSYNC_LOCK_ENABLED")? {
        config.lock.enabled = value;
    }
    if let Some(value) = env_parse("RELAYSYNC_LOCK_TTL_MS")? {
        config.lock.ttl_ms = value;
    }
    if let Some(value) = env_bool("RELAYSYNC_CACHE_ENABLED")? {
        config.cache.enabled = value;
    }
    if let Some(value) = env_parse("RELAYSYNC_RETRY_MAX_ATTEMPTS")? {
        config.retry.max_attempts = value;
    }
    Ok(())
}

/// Parse an optional environment variable
///
/// Unset or blank variables yield `None`.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RelaySyncError::Config(format!("Invalid value for {key}: {e}"))),
        _ => Ok(None),
    }
}

/// Parse a boolean environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(RelaySyncError::Config(format!("Invalid boolean for {key}: {other}"))),
        },
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_env_bool_parsing() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");

        for (value, expected) in [("1", true), ("TRUE", true), ("yes", true), ("on", true)] {
            std::env::set_var("RELAYSYNC_TEST_BOOL", value);
            assert_eq!(env_bool("RELAYSYNC_TEST_BOOL").unwrap(), Some(expected), "{value}");
        }
        for value in ["0", "false", "No", "off"] {
            std::env::set_var("RELAYSYNC_TEST_BOOL", value);
            assert_eq!(env_bool("RELAYSYNC_TEST_BOOL").unwrap(), Some(false), "{value}");
        }

        std::env::set_var("RELAYSYNC_TEST_BOOL", "maybe");
        assert!(env_bool("RELAYSYNC_TEST_BOOL").is_err());

        std::env::remove_var("RELAYSYNC_TEST_BOOL");
        assert_eq!(env_bool("RELAYSYNC_TEST_BOOL").unwrap(), None);
    }

    #[test]
    fn test_load_from_env_applies_overrides() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");

        std::env::set_var("RELAYSYNC_MIN_WORKERS", "3");
        std::env::set_var("RELAYSYNC_MAX_WORKERS", "12");
        std::env::set_var("RELAYSYNC_LOCK_TTL_MS", "45000");
        std::env::set_var("RELAYSYNC_CACHE_ENABLED", "off");

        let result = load_from_env();

        std::env::remove_var("RELAYSYNC_MIN_WORKERS");
        std::env::remove_var("RELAYSYNC_MAX_WORKERS");
        std::env::remove_var("RELAYSYNC_LOCK_TTL_MS");
        std::env::remove_var("RELAYSYNC_CACHE_ENABLED");

        let config = result.expect("overrides should load");
        assert_eq!(config.pool.min_workers, 3);
        assert_eq!(config.pool.max_workers, 12);
        assert_eq!(config.lock.ttl_ms, 45_000);
        assert!(!config.cache.enabled);
        assert_eq!(config.scheduler, EngineConfig::default().scheduler);
    }

    #[test]
    fn test_load_from_env_invalid_number() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");

        std::env::set_var("RELAYSYNC_INITIAL_BATCH_SIZE", "not-a-number");
        let result = load_from_env();
        std::env::remove_var("RELAYSYNC_INITIAL_BATCH_SIZE");

        let err = result.unwrap_err();
        assert!(
            matches!(&err, RelaySyncError::Config(message) if message.contains("RELAYSYNC_INITIAL_BATCH_SIZE")),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn test_load_from_env_rejects_invalid_result() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");

        std::env::set_var("RELAYSYNC_MIN_WORKERS", "0");
        let result = load_from_env();
        std::env::remove_var("RELAYSYNC_MIN_WORKERS");

        assert!(matches!(result, Err(RelaySyncError::Config(_))));
    }

    #[test]
    fn test_parse_config_partial_toml() {
        let toml_content = r#"
[scheduler]
initial_batch_size = 20

[rate_limits.shop]
capacity = 2
window_ms = 1000
"#;

        let config = parse_config(toml_content, Path::new("relaysync.toml")).unwrap();
        assert_eq!(config.scheduler.initial_batch_size, 20);
        assert_eq!(config.scheduler.max_batch_size, 100);
        assert_eq!(config.rate_limit_for("shop").capacity, 2);
        assert_eq!(config.rate_limit_for("other").capacity, 40);
    }

    #[test]
    fn test_parse_config_json() {
        let json_content = r#"{ "pool": { "min_workers": 1, "max_workers": 2 } }"#;

        let config = parse_config(json_content, Path::new("relaysync.json")).unwrap();
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.pool.max_workers, 2);
    }

    #[test]
    fn test_parse_config_invalid_json() {
        let result = parse_config(r#"{ "pool": "#, Path::new("config.json"));
        assert!(matches!(result, Err(RelaySyncError::Config(_))));
    }

    #[test]
    fn test_parse_config_unsupported_format() {
        let result = parse_config("some content", Path::new("config.yaml"));
        assert!(result.is_err(), "Should fail with unsupported format");
    }

    #[test]
    fn test_load_from_file_not_found() {
        let result = load_from_file(Some(PathBuf::from("/nonexistent/relaysync.toml")));
        assert!(matches!(result, Err(RelaySyncError::Config(_))));
    }
}
