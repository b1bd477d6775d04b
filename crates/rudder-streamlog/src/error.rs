//! Error types for the shipping client.

use rudder_logger::LoggerError;
use thiserror::Error;

/// Errors that can occur while shipping logs.
#[derive(Debug, Error)]
pub enum StreamLogError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A received frame was not valid UTF-8.
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// The discovery request failed.
    #[error("discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The discovery endpoint answered with an unusable body.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// No aggregator address is known.
    #[error("no aggregator address available")]
    NoAddress,

    /// A frame write did not finish in time.
    #[error("write to aggregator timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    /// There is no open connection.
    #[error("not connected")]
    NotConnected,

    /// The client was closed.
    #[error("client closed")]
    Closed,
}

/// Result type alias for shipping operations.
pub type Result<T> = std::result::Result<T, StreamLogError>;

impl From<StreamLogError> for LoggerError {
    fn from(e: StreamLogError) -> Self {
        match e {
            StreamLogError::Closed => Self::Closed,
            StreamLogError::Io(e) => Self::Io(e),
            other => Self::driver("streamlog", other),
        }
    }
}
