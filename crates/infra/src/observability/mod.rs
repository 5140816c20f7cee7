//! Observability infrastructure for logging and progress reporting
//!
//! - [`init_tracing`] installs the process-wide tracing subscriber
//! - [`TracingMetricsSink`] reports engine progress as structured events
//! - [`JsonlSnapshotSink`] appends engine progress to a JSON-lines file
//!
//! ## Log levels
//!
//! The filter is read from `RUST_LOG` and defaults to `info`. Engine events
//! use dotted names (`engine.run_completed`, `circuit.transition`,
//! `pool.scaled_up`), so a filter such as
//! `RUST_LOG=info,relaysync_core::pool=debug` narrows output to one
//! component.

pub mod sinks;

use std::str::FromStr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use sinks::{JsonlSnapshotSink, TracingMetricsSink};

/// Default filter when `RUST_LOG` is unset or invalid
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one line per event
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = TracingInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "human" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(TracingInitError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TracingInitError {
    #[error("unknown log format '{0}', expected 'pretty' or 'json'")]
    UnknownFormat(String),

    /// A global subscriber is already installed
    #[error("tracing subscriber already initialised: {0}")]
    AlreadyInitialised(String),
}

/// Install the global tracing subscriber.
///
/// Returns [`TracingInitError::AlreadyInitialised`] instead of panicking when
/// a subscriber is already set, so calling this twice is harmless.
pub fn init_tracing(format: LogFormat) -> Result<(), TracingInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };

    result.map_err(|e| TracingInitError::AlreadyInitialised(e.to_string()))
}
