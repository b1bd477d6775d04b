//! Driver registry mapping driver names to constructors.
//!
//! The registry is an explicitly constructed object: the node agent builds
//! one at startup, each driver crate registers itself into it, and it is then
//! shared read-mostly for the life of the process. A name can be registered
//! once; a second registration is a startup configuration error.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{LoggerError, Result};
use crate::options::{self, LogMode};
use crate::ring::RingBufferSink;
use crate::traits::LogSink;

/// Builds a sink for one container.
pub type Constructor = Arc<dyn Fn(&DriverContext) -> Result<Arc<dyn LogSink>> + Send + Sync>;

/// Validates the driver-specific part of an option map.
pub type OptionValidator = Arc<dyn Fn(&HashMap<String, String>) -> Result<()> + Send + Sync>;

/// Everything a driver needs to know about the container it logs for.
#[derive(Debug, Clone, Default)]
pub struct DriverContext {
    /// Driver options (`log-opt` pairs).
    pub config: HashMap<String, String>,
    /// Full container id.
    pub container_id: String,
    /// Container name.
    pub container_name: String,
    /// Image the container runs.
    pub container_image: String,
    /// Container environment as `KEY=value` strings.
    pub container_env: Vec<String>,
    /// Container labels.
    pub container_labels: HashMap<String, String>,
    /// Where file-based drivers keep the log.
    pub log_path: PathBuf,
}

impl DriverContext {
    /// Creates a context for the given container.
    #[must_use]
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            ..Self::default()
        }
    }

    /// Sets the driver options.
    #[must_use]
    pub fn with_config(mut self, config: HashMap<String, String>) -> Self {
        self.config = config;
        self
    }

    /// Sets one driver option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.container_env.push(format!("{key}={value}"));
        self
    }

    /// Sets the log file path.
    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Looks up an environment variable of the container.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.container_env.iter().find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// First 12 characters of the container id.
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.container_id
            .get(..12)
            .unwrap_or(self.container_id.as_str())
    }

    /// Collects attributes named by the `labels` and `env` options.
    ///
    /// Both options are comma-separated key lists; keys the container does
    /// not carry are skipped.
    #[must_use]
    pub fn extra_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();

        if let Some(keys) = self.config.get("labels") {
            for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                if let Some(value) = self.container_labels.get(key) {
                    attrs.insert(key.to_string(), value.clone());
                }
            }
        }

        if let Some(keys) = self.config.get("env") {
            for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                if let Some(value) = self.env_value(key) {
                    attrs.insert(key.to_string(), value.to_string());
                }
            }
        }

        attrs
    }
}

struct DriverEntry {
    constructor: Constructor,
    validator: Option<OptionValidator>,
}

/// Name-keyed table of log drivers.
///
/// Constructors and validators share one table behind one lock.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Mutex<HashMap<String, DriverEntry>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

impl DriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver constructor.
    ///
    /// # Errors
    ///
    /// Returns [`LoggerError::DriverExists`] if the name is taken.
    pub fn register<F>(&self, name: &str, constructor: F) -> Result<()>
    where
        F: Fn(&DriverContext) -> Result<Arc<dyn LogSink>> + Send + Sync + 'static,
    {
        let mut drivers = self.drivers.lock();
        if drivers.contains_key(name) {
            return Err(LoggerError::DriverExists(name.to_string()));
        }
        drivers.insert(
            name.to_string(),
            DriverEntry {
                constructor: Arc::new(constructor),
                validator: None,
            },
        );
        drop(drivers);

        info!(driver = %name, "registered log driver");
        Ok(())
    }

    /// Registers the option validator of a registered driver.
    ///
    /// # Errors
    ///
    /// Returns [`LoggerError::DriverNotRegistered`] if the driver is
    /// unknown, or [`LoggerError::DriverExists`] if a validator is already
    /// set.
    pub fn register_option_validator<F>(&self, name: &str, validator: F) -> Result<()>
    where
        F: Fn(&HashMap<String, String>) -> Result<()> + Send + Sync + 'static,
    {
        let mut drivers = self.drivers.lock();
        let entry = drivers
            .get_mut(name)
            .ok_or_else(|| LoggerError::DriverNotRegistered(name.to_string()))?;
        if entry.validator.is_some() {
            return Err(LoggerError::DriverExists(format!("{name} (option validator)")));
        }
        entry.validator = Some(Arc::new(validator));
        Ok(())
    }

    /// Returns the constructor registered under `name`.
    pub fn get(&self, name: &str) -> Result<Constructor> {
        self.drivers
            .lock()
            .get(name)
            .map(|entry| Arc::clone(&entry.constructor))
            .ok_or_else(|| LoggerError::DriverNotRegistered(name.to_string()))
    }

    /// Returns true if a driver is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.drivers.lock().contains_key(name)
    }

    /// Registered driver names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Validates an option map for the named driver.
    ///
    /// `mode` and `max-buffer-size` are checked here; the remaining keys go
    /// to the driver's validator, and are all unknown if it has none.
    pub fn validate_options(&self, name: &str, options: &HashMap<String, String>) -> Result<()> {
        let validator = self
            .drivers
            .lock()
            .get(name)
            .map(|entry| entry.validator.clone())
            .ok_or_else(|| LoggerError::DriverNotRegistered(name.to_string()))?;

        options::validate_generic(options)?;

        let specific = options::driver_specific(options);
        match validator {
            Some(validate) => validate(&specific),
            None => match specific.keys().min() {
                Some(key) => Err(LoggerError::UnknownOption {
                    driver: name.to_string(),
                    key: key.clone(),
                }),
                None => Ok(()),
            },
        }
    }

    /// Validates options and builds a sink for one container.
    ///
    /// In non-blocking mode the sink is wrapped in a [`RingBufferSink`],
    /// which spawns its drain task on the current Tokio runtime.
    pub fn create(&self, name: &str, ctx: &DriverContext) -> Result<Arc<dyn LogSink>> {
        self.validate_options(name, &ctx.config)?;
        let (mode, buffer) = options::validate_generic(&ctx.config)?;
        let constructor = self.get(name)?;

        let sink = constructor(ctx)?;
        debug!(
            driver = %name,
            container_id = %ctx.short_id(),
            mode = %mode,
            "created log driver"
        );

        match (mode, buffer) {
            (LogMode::NonBlocking, Some(max_bytes)) => Ok(Arc::new(RingBufferSink::new(sink, max_bytes))),
            _ => Ok(sink),
        }
    }
}
