//! Error types for log drivers and readers.

use thiserror::Error;

/// Errors that can occur in the logging core.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// A driver with the given name is already registered.
    #[error("log driver '{0}' is already registered")]
    DriverExists(String),

    /// No driver is registered under the given name.
    #[error("log driver '{0}' is not registered")]
    DriverNotRegistered(String),

    /// An option key is not recognized by the selected driver.
    #[error("unknown log opt '{key}' for {driver} log driver")]
    UnknownOption {
        /// Driver the option was given to.
        driver: String,
        /// The unrecognized key.
        key: String,
    },

    /// An option value failed validation.
    #[error("invalid log opt '{key}': {reason}")]
    InvalidOption {
        /// The offending option key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A log record could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The sink or reader was already closed.
    #[error("log driver closed")]
    Closed,

    /// The consumer of a read session went away.
    #[error("log consumer gone")]
    ConsumerGone,

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A driver-specific failure.
    #[error("{driver}: {message}")]
    Driver {
        /// Name of the failing driver.
        driver: String,
        /// Driver-provided detail.
        message: String,
    },
}

impl LoggerError {
    /// Builds an [`LoggerError::InvalidOption`].
    pub fn invalid_option(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`LoggerError::Driver`].
    pub fn driver(driver: impl Into<String>, message: impl ToString) -> Self {
        Self::Driver {
            driver: driver.into(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for logger operations.
pub type Result<T> = std::result::Result<T, LoggerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = LoggerError::DriverExists("json-file".to_string());
        assert_eq!(err.to_string(), "log driver 'json-file' is already registered");

        let err = LoggerError::DriverNotRegistered("syslog".to_string());
        assert_eq!(err.to_string(), "log driver 'syslog' is not registered");

        let err = LoggerError::UnknownOption {
            driver: "streamlog".to_string(),
            key: "max-size".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unknown log opt 'max-size' for streamlog log driver"
        );

        let err = LoggerError::invalid_option("mode", "unknown mode \"fast\"");
        assert_eq!(err.to_string(), "invalid log opt 'mode': unknown mode \"fast\"");

        assert_eq!(LoggerError::Closed.to_string(), "log driver closed");
    }

    #[test]
    fn error_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: LoggerError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LoggerError>();
    }
}
