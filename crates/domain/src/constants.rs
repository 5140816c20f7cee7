//! Application constants
//!
//! Centralized location for domain-level constants shared by the engine and
//! its adapters.

// Batch scheduling
pub const DEFAULT_INITIAL_BATCH_SIZE: usize = 10;
pub const DEFAULT_MIN_BATCH_SIZE: usize = 5;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_SIZE_STEP: usize = 5;
pub const DEFAULT_GOOD_SUCCESS_RATE: f64 = 0.8;
pub const DEFAULT_BAD_SUCCESS_RATE: f64 = 0.5;
pub const LATENCY_WINDOW: usize = 20;

// Priority weights
pub const PRIORITY_LAST_ATTEMPT_FAILED: i64 = 100;
pub const PRIORITY_UPDATED_WITHIN_1H: i64 = 30;
pub const PRIORITY_UPDATED_WITHIN_3H: i64 = 20;
pub const PRIORITY_UPDATED_WITHIN_24H: i64 = 10;
pub const PRIORITY_NEW_ITEM: i64 = 25;
pub const PRIORITY_LOW_QUANTITY: i64 = 15;
pub const PRIORITY_HIGH_VALUE: i64 = 10;
pub const LOW_QUANTITY_THRESHOLD: i64 = 10;
pub const HIGH_VALUE_THRESHOLD: f64 = 100.0;

// Shared store key layout
pub const LOCK_KEY_PREFIX: &str = "relaysync:lock:";
pub const CACHE_KEY_PREFIX: &str = "relaysync:cache:";

/// Breaker guarding every shared-store call.
pub const INFRASTRUCTURE_DEPENDENCY: &str = "infrastructure";

/// Skip reason reported when the cached fingerprint matches.
pub const SKIP_REASON_NO_CHANGE: &str = "no change";
/// Skip reason reported when another holder owns the item lock.
pub const SKIP_REASON_LOCKED: &str = "locked by another worker";
