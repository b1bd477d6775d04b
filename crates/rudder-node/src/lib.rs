//! # rudder-node
//!
//! Node agent wiring for rudder.
//!
//! This crate provides:
//!
//! - [`AgentConfig`] - TOML agent configuration
//! - [`build_registry`] - A registry with every built-in driver
//! - [`capture`] - Copies a container's output through its driver
//! - [`LocalFormat`] / [`read_local`] - Reads a node-local log file back
//!
//! ## Example
//!
//! ```rust,no_run
//! use rudder_node::{AgentConfig, build_registry, capture};
//! use rudder_logger::Source;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AgentConfig::from_file("/etc/rudder/node.toml")?;
//! let registry = build_registry(&config)?;
//! let ctx = rudder_node::container_context(&config, "4f1c2a9b0d3e", Vec::new());
//! let stats = capture(&registry, &config.driver, &ctx, vec![(Source::Stdout, tokio::io::stdin())]).await?;
//! println!("captured {} records", stats.records);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rudder_cri::{LogOptions, RuntimeService};
use rudder_jsonfile::RotatingLogFile;
use rudder_logger::{CopyStats, Copier, DriverContext, DriverRegistry, LogWatcher, ReadConfig, Source};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

pub use config::{AgentConfig, StreamLogSettings};
pub use error::{NodeError, Result};

/// Builds a registry holding the `json-file` and `streamlog` drivers.
///
/// # Errors
///
/// Fails if a driver name is registered twice.
pub fn build_registry(config: &AgentConfig) -> Result<DriverRegistry> {
    let registry = DriverRegistry::new();
    rudder_jsonfile::register(&registry)?;
    rudder_streamlog::register(&registry, config.client_template())?;
    debug!(drivers = ?registry.names(), "driver registry ready");
    Ok(registry)
}

/// Describes a container to its driver.
///
/// `env` holds `KEY=value` strings, as the container sees them.
#[must_use]
pub fn container_context(config: &AgentConfig, container_id: &str, env: Vec<String>) -> DriverContext {
    let mut ctx = DriverContext::new(container_id)
        .with_config(config.driver_options.clone())
        .with_log_path(config.log_path(container_id));
    ctx.container_name = container_id.to_string();
    ctx.container_env = env;
    ctx
}

/// Copies `sources` into a freshly created sink of driver `driver`.
///
/// Returns once every source reached end of input and the sink has been
/// closed.
///
/// # Errors
///
/// Fails if the driver is unknown, its options are invalid, or the sink
/// cannot be created. Errors of individual records are counted instead.
pub async fn capture<R>(
    registry: &DriverRegistry,
    driver: &str,
    ctx: &DriverContext,
    sources: Vec<(Source, R)>,
) -> Result<CopyStats>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let sink = registry.create(driver, ctx)?;
    info!(driver = %driver, container_id = %ctx.short_id(), "capturing container output");

    let stats = Copier::start(sources, Arc::clone(&sink)).wait().await;
    if let Err(e) = sink.close().await {
        warn!(driver = %driver, container_id = %ctx.short_id(), error = %e, "failed to close log driver");
    }

    info!(
        driver = %driver,
        container_id = %ctx.short_id(),
        records = stats.records,
        errors = stats.errors,
        "capture finished"
    );
    Ok(stats)
}

/// On-disk layout of a node-local log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFormat {
    /// Rotating JSON-lines file written by the `json-file` driver.
    JsonFile,
    /// File written by a CRI runtime.
    Cri,
}

impl FromStr for LocalFormat {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json-file" => Ok(Self::JsonFile),
            "cri" => Ok(Self::Cri),
            other => Err(NodeError::Config(format!(
                "unknown log format '{other}', expected json-file or cri"
            ))),
        }
    }
}

/// Starts a read session over the log file at `path`.
///
/// json-file logs are read with the rotation settings of the agent's
/// driver options so that rotated generations are included. CRI logs
/// follow while `runtime` reports the container as running.
///
/// # Errors
///
/// Fails if the file does not exist or the driver options are invalid.
pub fn read_local(
    config: &AgentConfig,
    path: &Path,
    format: LocalFormat,
    opts: &LogOptions,
    container_id: &str,
    runtime: Arc<dyn RuntimeService>,
) -> Result<LogWatcher> {
    if !path.exists() {
        return Err(NodeError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("log file '{}' not found", path.display()),
        )));
    }

    match format {
        LocalFormat::JsonFile => {
            let rotation = rudder_jsonfile::driver::rotation_config(&config.driver_options)?;
            let file = RotatingLogFile::open(path, rotation).map_err(rudder_logger::LoggerError::from)?;
            let mut read = ReadConfig::tail(opts.tail).with_follow(opts.follow);
            if let Some(since) = opts.since {
                read = read.with_since(since);
            }
            Ok(file.read_logs(read))
        }
        LocalFormat::Cri => Ok(rudder_cri::read_logs(path, container_id, opts.clone(), runtime)),
    }
}
