//! rudder-node - container log capture agent
//!
//! Captures a container's output through the configured log driver, reads
//! node-local logs back, and validates driver options.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rudder_cri::{ContainerState, LogOptions, StaticRuntime, write_logs};
use rudder_logger::Source;
use rudder_node::{AgentConfig, LocalFormat, build_registry, capture, container_context, read_local};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "rudder-node")]
#[command(about = "Container log capture and shipping agent")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "RUDDER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy stdin as a container's stdout through the configured driver
    Capture {
        /// Container id
        #[arg(long)]
        container_id: String,

        /// Container environment variable (KEY=value)
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// Driver to use instead of the configured one
        #[arg(long)]
        driver: Option<String>,
    },

    /// Print the records of a node-local log file
    Logs {
        /// Log file
        #[arg(long)]
        path: PathBuf,

        /// File layout: json-file or cri
        #[arg(long, default_value = "json-file")]
        format: LocalFormat,

        /// Number of lines from the end (-1 for all)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        tail: i64,

        /// Only records at or after this RFC 3339 time
        #[arg(long, value_parser = parse_time)]
        since: Option<DateTime<Utc>>,

        /// Stop after this many bytes of output (-1 for no limit)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        limit_bytes: i64,

        /// Keep printing new records
        #[arg(short, long)]
        follow: bool,

        /// Prefix each line with its timestamp
        #[arg(short, long)]
        timestamps: bool,
    },

    /// Validate log options for a driver
    CheckOpts {
        /// Driver name
        #[arg(long)]
        driver: String,

        /// Options as key=value
        opts: Vec<String>,
    },
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 time '{value}': {e}"))
}

fn parse_opts(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("option '{pair}' is not key=value"))
        })
        .collect()
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    match path {
        Some(path) => {
            let config = AgentConfig::from_file(path)?;
            info!(config = %path.display(), driver = %config.driver, "loaded config");
            Ok(config)
        }
        None => Ok(AgentConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("rudder=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Capture {
            container_id,
            env,
            driver,
        } => {
            run_capture(&config, &container_id, env, driver).await?;
        }

        Commands::Logs {
            path,
            format,
            tail,
            since,
            limit_bytes,
            follow,
            timestamps,
        } => {
            let opts = LogOptions {
                tail,
                bytes: limit_bytes,
                since,
                follow,
                timestamp: timestamps,
            };
            run_logs(&config, &path, format, &opts).await?;
        }

        Commands::CheckOpts { driver, opts } => {
            let registry = build_registry(&config)?;
            let options = parse_opts(&opts)?;
            registry
                .validate_options(&driver, &options)
                .with_context(|| format!("invalid options for {driver}"))?;
            println!("options valid for {driver}");
        }
    }

    Ok(())
}

async fn run_capture(
    config: &AgentConfig,
    container_id: &str,
    env: Vec<String>,
    driver: Option<String>,
) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    let driver = driver.unwrap_or_else(|| config.driver.clone());
    let ctx = container_context(config, container_id, env);

    let stats = capture(
        &registry,
        &driver,
        &ctx,
        vec![(Source::Stdout, tokio::io::stdin())],
    )
    .await?;
    if stats.errors > 0 {
        warn!(errors = stats.errors, records = stats.records, "some records were not logged");
    }
    Ok(())
}

async fn run_logs(
    config: &AgentConfig,
    path: &Path,
    format: LocalFormat,
    opts: &LogOptions,
) -> anyhow::Result<()> {
    // A local file has no runtime to ask; follow until interrupted.
    let runtime = Arc::new(StaticRuntime::new(ContainerState::Running));
    let container_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let watcher = read_local(config, path, format, opts, &container_id, runtime)?;

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    tokio::select! {
        written = write_logs(watcher, opts, &mut stdout, &mut stderr) => {
            written.with_context(|| format!("failed to read {}", path.display()))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }
    Ok(())
}
