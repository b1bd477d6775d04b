//! Error types for file watchers.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while watching files.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The native event backend failed.
    #[error("native watcher error: {0}")]
    Native(#[from] notify::Error),

    /// Stat or open failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The watcher was closed.
    #[error("watcher is closed")]
    Closed,

    /// The path is already being watched.
    #[error("watch already exists for {0}")]
    AlreadyWatched(PathBuf),

    /// The path is not being watched.
    #[error("no watch for {0}")]
    NotWatched(PathBuf),
}

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;
