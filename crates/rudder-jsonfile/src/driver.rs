//! The `json-file` log driver.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use rudder_logger::options::{bool_option, byte_size_option, positive_option};
use rudder_logger::{
    DriverContext, DriverRegistry, LogReader, LogSink, LogWatcher, LoggerError, Message, ReadConfig,
};
use tracing::debug;

use crate::DRIVER_NAME;
use crate::file::{RotatingLogFile, RotationConfig};

const MAX_SIZE_KEY: &str = "max-size";
const MAX_FILE_KEY: &str = "max-file";
const COMPRESS_KEY: &str = "compress";

/// Option keys accepted by the driver.
pub const OPTIONS: &[&str] = &[MAX_SIZE_KEY, MAX_FILE_KEY, COMPRESS_KEY, "labels", "env"];

/// Validates `json-file` options.
///
/// # Errors
///
/// Rejects unknown keys, unparsable values, `max-file` without `max-size`
/// and `compress` with fewer than two files.
pub fn validate_log_opts(options: &HashMap<String, String>) -> Result<(), LoggerError> {
    let mut keys: Vec<&String> = options.keys().collect();
    keys.sort();
    if let Some(key) = keys.into_iter().find(|k| !OPTIONS.contains(&k.as_str())) {
        return Err(LoggerError::UnknownOption {
            driver: DRIVER_NAME.to_string(),
            key: key.clone(),
        });
    }
    rotation_config(options).map(|_| ())
}

/// Builds the rotation settings described by `options`.
pub fn rotation_config(options: &HashMap<String, String>) -> Result<RotationConfig, LoggerError> {
    let max_size = options
        .get(MAX_SIZE_KEY)
        .map(|v| byte_size_option(MAX_SIZE_KEY, v))
        .transpose()?;
    if max_size == Some(0) {
        return Err(LoggerError::invalid_option(MAX_SIZE_KEY, "must be greater than zero"));
    }

    let max_files = match options.get(MAX_FILE_KEY) {
        Some(v) => {
            let n = positive_option(MAX_FILE_KEY, v)?;
            u32::try_from(n).map_err(|_| LoggerError::invalid_option(MAX_FILE_KEY, "too large"))?
        }
        None => 1,
    };
    if max_files > 1 && max_size.is_none() {
        return Err(LoggerError::invalid_option(
            MAX_FILE_KEY,
            "can only be set when max-size is set",
        ));
    }

    let compress = match options.get(COMPRESS_KEY) {
        Some(v) => bool_option(COMPRESS_KEY, v)?,
        None => false,
    };
    if compress && max_files < 2 {
        return Err(LoggerError::invalid_option(
            COMPRESS_KEY,
            "cannot be enabled when max-file is less than 2",
        ));
    }

    Ok(RotationConfig {
        max_size,
        max_files,
        compress,
    })
}

/// Sink writing a container's records to a local rotating file.
#[derive(Debug)]
pub struct JsonFileLogger {
    file: RotatingLogFile,
    extra: BTreeMap<String, String>,
}

impl JsonFileLogger {
    /// Opens the log file named by the context.
    ///
    /// # Errors
    ///
    /// Fails if the options are invalid, no log path was given, or the file
    /// cannot be opened.
    pub fn new(ctx: &DriverContext) -> Result<Self, LoggerError> {
        if ctx.log_path.as_os_str().is_empty() {
            return Err(LoggerError::driver(DRIVER_NAME, "no log path for container"));
        }
        let config = rotation_config(&ctx.config)?;
        let file = RotatingLogFile::open(&ctx.log_path, config)?;
        debug!(container_id = %ctx.short_id(), path = %ctx.log_path.display(), "json-file logger created");

        Ok(Self {
            file,
            extra: ctx.extra_attributes(),
        })
    }

    /// The underlying file.
    #[must_use]
    pub fn file(&self) -> &RotatingLogFile {
        &self.file
    }
}

impl LogSink for JsonFileLogger {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn log(&self, mut msg: Message) -> BoxFuture<'_, rudder_logger::Result<()>> {
        for (key, value) in &self.extra {
            msg.attrs
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        async move { Ok(self.file.write_message(&msg).await?) }.boxed()
    }

    fn close(&self) -> BoxFuture<'_, rudder_logger::Result<()>> {
        async move { Ok(self.file.close().await?) }.boxed()
    }

    fn reader(&self) -> Option<&dyn LogReader> {
        Some(self)
    }
}

impl LogReader for JsonFileLogger {
    fn read_logs(&self, config: ReadConfig) -> LogWatcher {
        self.file.read_logs(config)
    }
}

/// Registers the driver and its option validator.
///
/// # Errors
///
/// Fails if `json-file` is already registered.
pub fn register(registry: &DriverRegistry) -> Result<(), LoggerError> {
    registry.register(DRIVER_NAME, |ctx| {
        let sink: Arc<dyn LogSink> = Arc::new(JsonFileLogger::new(ctx)?);
        Ok(sink)
    })?;
    registry.register_option_validator(DRIVER_NAME, validate_log_opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rudder_logger::Source;
    use test_case::test_case;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test_case(&[] ; "no options")]
    #[test_case(&[("max-size", "10m")] ; "size only")]
    #[test_case(&[("max-size", "10m"), ("max-file", "3")] ; "size and files")]
    #[test_case(&[("max-size", "1k"), ("max-file", "2"), ("compress", "true")] ; "compressed")]
    #[test_case(&[("labels", "team,app"), ("env", "TENANT_ID")] ; "attributes")]
    fn accepts(pairs: &[(&str, &str)]) {
        assert!(validate_log_opts(&opts(pairs)).is_ok());
    }

    #[test_case(&[("max-size", "huge")] ; "bad size")]
    #[test_case(&[("max-size", "0")] ; "zero size")]
    #[test_case(&[("max-file", "3")] ; "files without size")]
    #[test_case(&[("max-size", "1m"), ("max-file", "0")] ; "zero files")]
    #[test_case(&[("max-size", "1m"), ("compress", "true")] ; "compress single file")]
    #[test_case(&[("max-size", "1m"), ("max-file", "2"), ("compress", "maybe")] ; "bad bool")]
    fn rejects_invalid(pairs: &[(&str, &str)]) {
        assert!(matches!(
            validate_log_opts(&opts(pairs)),
            Err(LoggerError::InvalidOption { .. })
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = validate_log_opts(&opts(&[("stream-server", "x:1")])).expect_err("unknown");
        assert!(matches!(err, LoggerError::UnknownOption { key, .. } if key == "stream-server"));
    }

    #[test]
    fn parses_rotation_config() {
        let config = rotation_config(&opts(&[("max-size", "2k"), ("max-file", "4"), ("compress", "1")]))
            .expect("valid");
        assert_eq!(config, RotationConfig::new(2048, 4).with_compress(true));
    }

    #[tokio::test]
    async fn registered_driver_writes_and_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = DriverRegistry::new();
        register(&registry).expect("register");
        assert!(register(&registry).is_err());

        let ctx = DriverContext::new("0123456789abcdef")
            .with_log_path(dir.path().join("c.log"))
            .with_env("TENANT_ID", "t-9")
            .with_option("env", "TENANT_ID");
        let sink = registry.create(DRIVER_NAME, &ctx).expect("create");

        sink.log(Message::new(Source::Stdout, Utc::now(), "hello"))
            .await
            .expect("log");

        let reader = sink.reader().expect("json-file can read");
        let got = reader.read_logs(ReadConfig::all()).collect().await.expect("read");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].line, b"hello");
        assert_eq!(got[0].attrs.get("TENANT_ID").map(String::as_str), Some("t-9"));

        sink.close().await.expect("close");
    }

    #[test]
    fn missing_log_path_is_rejected() {
        let err = JsonFileLogger::new(&DriverContext::new("abc")).expect_err("no path");
        assert!(matches!(err, LoggerError::Driver { .. }));
    }
}
