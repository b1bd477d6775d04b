//! Error types for CRI log reading.

use rudder_filewatch::WatchError;
use rudder_logger::LoggerError;
use thiserror::Error;

/// Errors that can occur while reading CRI logs.
#[derive(Debug, Error)]
pub enum CriError {
    /// A log line did not match any known format.
    #[error("parse error: {0}")]
    Parse(String),

    /// Opening, seeking or reading the log file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Watching the log file failed.
    #[error("watch error: {0}")]
    Watch(#[from] WatchError),

    /// The container runtime could not report the container's state.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The read session ended with an error.
    #[error(transparent)]
    Logger(#[from] LoggerError),
}

/// Result type alias for CRI operations.
pub type Result<T> = std::result::Result<T, CriError>;

impl CriError {
    /// Creates a parse error.
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse(reason.into())
    }
}

impl From<CriError> for LoggerError {
    fn from(e: CriError) -> Self {
        match e {
            CriError::Io(e) => Self::Io(e),
            CriError::Parse(reason) => Self::Decode(reason),
            CriError::Logger(e) => e,
            other => Self::driver("cri", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(CriError::parse("no stream").to_string(), "parse error: no stream");
        assert_eq!(
            CriError::Runtime("unavailable".to_string()).to_string(),
            "runtime error: unavailable"
        );
        assert_eq!(
            CriError::Logger(LoggerError::Closed).to_string(),
            "log driver closed"
        );
    }

    #[test]
    fn converts_into_logger_error() {
        assert!(matches!(
            LoggerError::from(CriError::parse("bad")),
            LoggerError::Decode(_)
        ));
        assert!(matches!(
            LoggerError::from(CriError::Runtime("x".to_string())),
            LoggerError::Driver { .. }
        ));
        assert!(matches!(
            LoggerError::from(CriError::Logger(LoggerError::ConsumerGone)),
            LoggerError::ConsumerGone
        ));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CriError>();
    }
}
