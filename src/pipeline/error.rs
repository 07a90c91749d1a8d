//! Error types for stale-marker processing
//!
//! Lock contention is not an error here: a marker that cannot be locked is
//! reported as `ProcessOutcome::Skipped`.

use super::config::ConfigError;
use rusqlite::ErrorCode;

#[derive(Debug)]
pub enum StaleError {
    /// Store-level contention or connection trouble (SQLITE_BUSY/LOCKED).
    /// The marker's transaction was rolled back; it is retried next run.
    Transient(String),
    /// Finer-tier data missing or malformed for a recompute.
    DataIntegrity(String),
    Database(String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
    Config(ConfigError),
}

impl StaleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StaleError::Transient(_))
    }
}

impl From<rusqlite::Error> for StaleError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StaleError::Transient(err.to_string())
            }
            _ => StaleError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StaleError {
    fn from(err: serde_json::Error) -> Self {
        StaleError::Serialization(err)
    }
}

impl From<std::io::Error> for StaleError {
    fn from(err: std::io::Error) -> Self {
        StaleError::Io(err)
    }
}

impl From<ConfigError> for StaleError {
    fn from(err: ConfigError) -> Self {
        StaleError::Config(err)
    }
}

impl std::fmt::Display for StaleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleError::Transient(e) => write!(f, "Transient store error: {}", e),
            StaleError::DataIntegrity(e) => write!(f, "Data integrity error: {}", e),
            StaleError::Database(e) => write!(f, "Database error: {}", e),
            StaleError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StaleError::Io(e) => write!(f, "IO error: {}", e),
            StaleError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StaleError {}
