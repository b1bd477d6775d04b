//! # rudder-cri
//!
//! Reader for log files written by container runtimes in CRI format.
//!
//! This crate provides:
//!
//! - [`parse_cri_log`] - Splits a line into timestamp, stream, tag and content
//! - [`LogOptions`] - Tail, byte limit, since and follow resolved from
//!   [`PodLogOptions`]
//! - [`read_logs`] - Tail/follow read session with container liveness checks
//! - [`write_logs`] - Renders a session to stdout/stderr writers
//! - [`RuntimeService`] - The status call of the container runtime
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rudder_cri::{ContainerState, LogOptions, PodLogOptions, StaticRuntime, read_logs, write_logs};
//!
//! # async fn example() -> rudder_cri::Result<()> {
//! let api = PodLogOptions { tail_lines: Some(100), follow: true, ..Default::default() };
//! let opts = LogOptions::new(&api, chrono::Utc::now());
//! let runtime = Arc::new(StaticRuntime::new(ContainerState::Running));
//!
//! let watcher = read_logs("/var/log/pods/web/0.log", "abc123", opts.clone(), runtime);
//! write_logs(watcher, &opts, &mut tokio::io::stdout(), &mut tokio::io::stderr()).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod options;
pub mod parse;
pub mod reader;
pub mod runtime;
pub mod writer;

pub use error::{CriError, Result};
pub use options::{LogOptions, PodLogOptions};
pub use parse::{CriLogLine, LogFormat, LogTag, parse_cri_log, parse_docker_json_log};
pub use reader::{FORCED_CHECK_INTERVAL, read_logs};
pub use runtime::{ContainerState, RuntimeService, StaticRuntime, is_container_running};
pub use writer::write_logs;
