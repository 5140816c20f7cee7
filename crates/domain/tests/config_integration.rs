//! Integration tests for engine configuration parsing
//!
//! Exercises full TOML documents the way operators write them.

use relaysync_domain::{EngineConfig, JitterMode};

/// Validates a complete TOML config including per-dependency rate limits.
///
/// Assertions:
/// - Every section is read from the document
/// - Unspecified fields keep their defaults
/// - The result validates
#[test]
fn test_full_toml_document() {
    let doc = r#"
        [scheduler]
        initial_batch_size = 20
        max_batch_size = 200
        snapshot_every = 5

        [pool]
        min_workers = 4
        max_workers = 8

        [retry]
        max_attempts = 5
        jitter = "full"

        [rate_limits.shop]
        capacity = 2
        window_ms = 1000

        [rate_limits.erp]
        capacity = 100
        backpressure_threshold = 0.1
    "#;

    let config: EngineConfig = toml::from_str(doc).expect("document should parse");
    config.validate().expect("document should validate");

    assert_eq!(config.scheduler.initial_batch_size, 20);
    assert_eq!(config.scheduler.min_batch_size, 5);
    assert_eq!(config.pool.max_workers, 8);
    assert_eq!(config.retry.jitter, JitterMode::Full);
    assert_eq!(config.rate_limit_for("shop").capacity, 2);
    assert_eq!(config.rate_limit_for("erp").window_ms, 1000);
    assert_eq!(config.rate_limit_for("unknown").capacity, 40);
}

/// Validates that a semantically broken document parses but fails
/// validation with a field path.
///
/// Assertions:
/// - `validate` names the offending field
#[test]
fn test_invalid_pool_bounds_are_reported() {
    let doc = r#"
        [pool]
        min_workers = 6
        max_workers = 3
    "#;

    let config: EngineConfig = toml::from_str(doc).expect("document should parse");
    let err = config.validate().expect_err("bounds are inverted");
    assert!(err.to_string().contains("pool.min_workers"), "unexpected error: {err}");
}
