//! Error types for bar data and configuration.
//!
//! Data errors skip a cycle and are never fatal. Config errors stop the
//! engine before it starts.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Problems with incoming bar data
#[derive(Debug, Error)]
pub enum DataError {
    #[error("invalid bar at {timestamp}: {reason}")]
    InvalidBar {
        timestamp: DateTime<Utc>,
        reason: String,
    },

    #[error("non-monotonic bar timestamp: {current} is not after {previous}")]
    NonMonotonic {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("bar fetch timed out after {secs}s")]
    FetchTimeout { secs: u64 },

    #[error("bar provider error: {0}")]
    Provider(String),
}

/// Configuration rejected at load time
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} = {value} is out of range (expected {expected})")]
    OutOfRange {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{key} = {value:?} is not a valid HH:MM time")]
    InvalidTime { key: &'static str, value: String },

    #[error("unknown timezone {0:?}")]
    InvalidTimezone(String),

    #[error("rr_first ({rr_first}) must be below rr_second ({rr_second})")]
    TargetOrder { rr_first: f64, rr_second: f64 },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
