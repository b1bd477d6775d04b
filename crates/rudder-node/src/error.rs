//! Error types for the node agent.

use rudder_logger::LoggerError;
use thiserror::Error;

/// Errors that can occur while configuring or running the agent.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A log driver failed.
    #[error("log driver error: {0}")]
    Logger(#[from] LoggerError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
