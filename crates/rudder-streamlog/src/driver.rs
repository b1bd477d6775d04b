//! The `streamlog` log driver.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use rudder_logger::options::positive_option;
use rudder_logger::{DriverContext, DriverRegistry, LogSink, LoggerError, Message};
use tracing::debug;

use crate::DRIVER_NAME;
use crate::client::{ClientConfig, StreamLogClient};

const STREAM_SERVER_KEY: &str = "stream-server";
const CACHE_SIZE_KEY: &str = "cache-error-log-size";

/// Option keys accepted by the driver.
pub const OPTIONS: &[&str] = &[STREAM_SERVER_KEY, CACHE_SIZE_KEY];

/// Label naming the service a container belongs to.
pub const SERVICE_ID_LABEL: &str = "service_id";

/// Environment variable naming the service, used without the label.
pub const SERVICE_ID_ENV: &str = "SERVICE_ID";

/// Validates `streamlog` options.
///
/// # Errors
///
/// Rejects unknown keys, a `stream-server` that is not `host:port` and a
/// non-positive `cache-error-log-size`.
pub fn validate_log_opts(options: &HashMap<String, String>) -> Result<(), LoggerError> {
    let mut keys: Vec<&String> = options.keys().collect();
    keys.sort();
    if let Some(key) = keys.into_iter().find(|k| !OPTIONS.contains(&k.as_str())) {
        return Err(LoggerError::UnknownOption {
            driver: DRIVER_NAME.to_string(),
            key: key.clone(),
        });
    }
    client_config(options, &ClientConfig::default()).map(|_| ())
}

/// Applies `options` on top of `template`.
pub fn client_config(
    options: &HashMap<String, String>,
    template: &ClientConfig,
) -> Result<ClientConfig, LoggerError> {
    let mut config = template.clone();

    if let Some(server) = options.get(STREAM_SERVER_KEY) {
        let valid = server
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(LoggerError::invalid_option(
                STREAM_SERVER_KEY,
                format!("expected host:port, got {server:?}"),
            ));
        }
        config.server = Some(server.clone());
    }

    if let Some(size) = options.get(CACHE_SIZE_KEY) {
        let size = positive_option(CACHE_SIZE_KEY, size)?;
        config.cache_size = usize::try_from(size)
            .map_err(|_| LoggerError::invalid_option(CACHE_SIZE_KEY, "too large"))?;
    }

    Ok(config)
}

/// Sink shipping a container's records to the aggregator.
#[derive(Debug)]
pub struct StreamLogLogger {
    client: StreamLogClient,
    service_id: String,
    container_id: String,
}

impl StreamLogLogger {
    /// Starts a client for the container described by `ctx`.
    ///
    /// # Errors
    ///
    /// Fails on invalid options or when no aggregator address source is
    /// configured.
    pub fn new(ctx: &DriverContext, template: &ClientConfig) -> Result<Self, LoggerError> {
        let config = client_config(&ctx.config, template)?;
        let client = StreamLogClient::start(config)?;

        let service_id = ctx
            .container_labels
            .get(SERVICE_ID_LABEL)
            .map(String::as_str)
            .or_else(|| ctx.env_value(SERVICE_ID_ENV))
            .unwrap_or(ctx.container_name.as_str())
            .to_string();
        debug!(container_id = %ctx.short_id(), service_id = %service_id, "streamlog logger created");

        Ok(Self {
            client,
            service_id,
            container_id: ctx.short_id().to_string(),
        })
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &StreamLogClient {
        &self.client
    }

    /// Renders one record as a frame payload:
    /// `<stamp> <service id> <container id> <stream> <line>`.
    #[must_use]
    pub fn payload(&self, stamp: i64, msg: &Message) -> String {
        format!(
            "{stamp} {} {} {} {}",
            self.service_id,
            self.container_id,
            msg.source,
            msg.line_lossy()
        )
    }
}

impl LogSink for StreamLogLogger {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn log(&self, msg: Message) -> BoxFuture<'_, rudder_logger::Result<()>> {
        let payload = self.payload(self.client.next_stamp(), &msg);
        async move { Ok(self.client.log(payload).await?) }.boxed()
    }

    fn close(&self) -> BoxFuture<'_, rudder_logger::Result<()>> {
        async move {
            self.client.close().await;
            Ok(())
        }
        .boxed()
    }
}

/// Registers the `streamlog` driver.
///
/// `template` carries the node-wide settings (discovery url, timings);
/// per-container options are applied on top of it.
///
/// # Errors
///
/// Fails if the driver is already registered.
pub fn register(registry: &DriverRegistry, template: ClientConfig) -> Result<(), LoggerError> {
    registry.register(DRIVER_NAME, move |ctx| {
        let logger = StreamLogLogger::new(ctx, &template)?;
        Ok(Arc::new(logger) as Arc<dyn LogSink>)
    })?;
    registry.register_option_validator(DRIVER_NAME, validate_log_opts)
}
