//! # rudder-logger
//!
//! Contracts shared by every rudder log driver.
//!
//! This crate provides:
//!
//! - [`Message`] - One captured log line with stream, timestamp and attributes
//! - [`ReadConfig`] - Tail/since/until/follow parameters of a read session
//! - [`LogWatcher`] / [`LogProducer`] - The two ends of a read session
//! - [`LogSink`] / [`LogReader`] - Driver capabilities
//! - [`DriverRegistry`] - Name-keyed driver constructors and option validation
//! - [`RingBufferSink`] - Non-blocking delivery mode
//! - [`Copier`] - Turns raw stdout/stderr bytes into records
//! - [`tail_offset`] - Backwards search used by file readers
//!
//! ## Example
//!
//! ```rust
//! use rudder_logger::{DriverRegistry, Message, Source};
//! use std::collections::HashMap;
//!
//! let registry = DriverRegistry::new();
//! assert!(registry.validate_options("json-file", &HashMap::new()).is_err());
//!
//! let msg = Message::new(Source::Stdout, chrono::Utc::now(), "hello")
//!     .with_attr("tenant_id", "t1");
//! assert!(!msg.is_partial());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod copier;
pub mod error;
pub mod message;
pub mod options;
pub mod registry;
pub mod ring;
pub mod tail;
pub mod traits;
pub mod watcher;

pub use copier::{CopyStats, Copier, MAX_LINE_SIZE};
pub use error::{LoggerError, Result};
pub use message::{Message, PartialLogMeta, ReadConfig, Source};
pub use options::{LogMode, parse_byte_size};
pub use registry::{Constructor, DriverContext, DriverRegistry, OptionValidator};
pub use ring::RingBufferSink;
pub use tail::{TailPosition, tail_offset};
pub use traits::{LogReader, LogSink};
pub use watcher::{DEFAULT_WATCHER_BUFFER, LogProducer, LogWatcher, log_watcher};
