//! # RelaySync Domain
//!
//! Business domain types and models for RelaySync.
//!
//! This crate contains:
//! - Work items and their lifecycle status
//! - Per-item and per-run reports produced by the engine
//! - Engine configuration sections and their validation
//! - Domain error types and Result definitions
//! - Domain constants
//!
//! ## Architecture
//! - No dependencies on other RelaySync crates
//! - Only external dependencies allowed
//! - Pure domain models and data structures

pub mod config;
pub mod constants;
pub mod errors;
pub mod macros;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use types::*;
