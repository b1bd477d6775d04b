//! # rudder-jsonfile
//!
//! Local rotating log store and the `json-file` driver.
//!
//! Records are kept as JSON lines in one file per container. The file is
//! rotated at a size threshold into numbered generations, optionally
//! gzip-compressed, and read back with tail, time window and follow
//! support across all retained generations.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rudder_jsonfile::{RotatingLogFile, RotationConfig};
//! use rudder_logger::{Message, ReadConfig, Source};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let file = RotatingLogFile::open(
//!     "/var/lib/rudder/c1/c1-json.log",
//!     RotationConfig::new(10 * 1024 * 1024, 3).with_compress(true),
//! )?;
//! file.write_message(&Message::new(Source::Stdout, chrono::Utc::now(), "started"))
//!     .await?;
//!
//! let mut logs = file.read_logs(ReadConfig::tail(100).with_follow(true));
//! while let Some(record) = logs.recv().await {
//!     println!("{}", record?.line_lossy());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod decoder;
pub mod driver;
pub mod error;
pub mod file;
pub mod jsonlog;
mod read;
pub mod tempfiles;

/// Name the driver registers under.
pub const DRIVER_NAME: &str = "json-file";

pub use decoder::LineDecoder;
pub use driver::{JsonFileLogger, register, validate_log_opts};
pub use error::{JsonFileError, Result};
pub use file::{RotatingLogFile, RotationConfig, generation_path};
pub use read::{DECODE_RETRIES, FORCED_CHECK_INTERVAL};
pub use tempfiles::{DecompressedFiles, TempFileRef};
