//! Error types for the local log store.

use std::path::PathBuf;

use rudder_filewatch::WatchError;
use rudder_logger::LoggerError;
use thiserror::Error;

use crate::DRIVER_NAME;

/// Errors that can occur while writing or reading the local store.
#[derive(Debug, Error)]
pub enum JsonFileError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Watching the current file failed.
    #[error("watch error: {0}")]
    Watch(#[from] WatchError),

    /// The trailing record never completed.
    #[error("incomplete record at offset {offset} of {} after {attempts} attempts", path.display())]
    Incomplete {
        /// File holding the record.
        path: PathBuf,
        /// Offset where the record starts.
        offset: u64,
        /// Number of reads tried.
        attempts: u32,
    },

    /// The store was closed.
    #[error("log file closed")]
    Closed,

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, JsonFileError>;

impl From<tokio::task::JoinError> for JsonFileError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

impl From<JsonFileError> for LoggerError {
    fn from(e: JsonFileError) -> Self {
        match e {
            JsonFileError::Io(e) => Self::Io(e),
            JsonFileError::Encode(e) => Self::Serialization(e),
            JsonFileError::Closed => Self::Closed,
            e @ JsonFileError::Incomplete { .. } => Self::Decode(e.to_string()),
            other => Self::driver(DRIVER_NAME, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(JsonFileError::Closed.to_string(), "log file closed");
        let err = JsonFileError::Incomplete {
            path: PathBuf::from("/logs/c.log"),
            offset: 120,
            attempts: 20,
        };
        assert_eq!(
            err.to_string(),
            "incomplete record at offset 120 of /logs/c.log after 20 attempts"
        );
    }

    #[test]
    fn converts_into_logger_error() {
        assert!(matches!(
            LoggerError::from(JsonFileError::Closed),
            LoggerError::Closed
        ));
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            LoggerError::from(JsonFileError::Io(io)),
            LoggerError::Io(_)
        ));
        let incomplete = JsonFileError::Incomplete {
            path: PathBuf::from("x"),
            offset: 0,
            attempts: 1,
        };
        assert!(matches!(
            LoggerError::from(incomplete),
            LoggerError::Decode(_)
        ));
        let watch = JsonFileError::Watch(WatchError::Closed);
        assert!(matches!(
            LoggerError::from(watch),
            LoggerError::Driver { driver, .. } if driver == "json-file"
        ));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<JsonFileError>();
    }
}
