//! Error Module
//!
//! Defines error types and result types used throughout the capture tracker.

use thiserror::Error;

/// Main error type for the capture tracker
#[derive(Error, Debug, Clone)]
pub enum TrackerError {
    /// Worker directories could not be created or linked.
    #[error("Setup error: {0}")]
    SetupError(String),

    /// A newly observed blockfile could not be opened.
    #[error("Discovery error: {0}")]
    DiscoveryError(String),

    /// Free disk percentage could not be read.
    #[error("Measurement error: {0}")]
    MeasurementError(String),

    /// An artifact of the oldest blockfile could not be deleted.
    #[error("Eviction error: {0}")]
    EvictionError(String),

    /// Disk is over threshold and nothing is left to evict.
    #[error("Stuck: {0}")]
    StuckError(String),

    /// Tried to untrack a file that is not tracked.
    #[error("Untrack error: {0}")]
    UntrackError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        TrackerError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for TrackerError {
    fn from(err: hyper::Error) -> Self {
        TrackerError::HttpError(err.to_string())
    }
}

impl From<serde_yaml::Error> for TrackerError {
    fn from(err: serde_yaml::Error) -> Self {
        TrackerError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::HttpError(err.to_string())
    }
}

/// Result type alias for the capture tracker
pub type Result<T> = std::result::Result<T, TrackerError>;
