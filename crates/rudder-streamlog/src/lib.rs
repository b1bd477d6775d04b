//! # rudder-streamlog
//!
//! Ships captured log records to a remote aggregator.
//!
//! This crate provides:
//!
//! - [`FrameCodec`] - 4-byte little-endian length + UTF-8 payload framing
//! - [`StreamLogClient`] - Bounded cache queue, sender task, keepalive and
//!   single-flight reconnection
//! - [`DiscoveryClient`] / [`AddressPool`] - Weighted aggregator discovery
//! - [`StreamLogLogger`] - The `streamlog` log driver
//!
//! ## Example
//!
//! ```rust,no_run
//! use rudder_streamlog::{ClientConfig, StreamLogClient};
//!
//! # async fn example() -> rudder_streamlog::Result<()> {
//! let config = ClientConfig::default()
//!     .with_server("10.0.0.5:6362")
//!     .with_discovery_url("http://cluster.local:8888/v1/stream-servers");
//! let client = StreamLogClient::start(config)?;
//!
//! client.log("1714557600000000000 web 0123456789ab stdout hello".to_string()).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod codec;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod state;

/// Name the driver registers under.
pub const DRIVER_NAME: &str = "streamlog";

pub use client::{
    CLOSE_FLUSH_TIMEOUT, ClientConfig, DEFAULT_CACHE_SIZE, IDLE_PING_INTERVAL, PING, RECONNECT_INTERVAL,
    StreamLogClient, WRITE_TIMEOUT,
};
pub use codec::{DEFAULT_MAX_FRAME, FrameCodec};
pub use discovery::{
    AddressPool, DEFAULT_STREAM_PORT, DISCOVERY_REFRESH_INTERVAL, DiscoveryClient, DiscoveryResponse,
    Endpoint, stream_address,
};
pub use driver::{StreamLogLogger, register, validate_log_opts};
pub use error::{Result, StreamLogError};
pub use state::ConnectionState;
