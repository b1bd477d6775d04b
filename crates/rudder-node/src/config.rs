//! Node agent configuration.
//!
//! A TOML file naming where container logs live, which driver captures
//! them, and how the shipping client reaches the aggregator:
//!
//! ```toml
//! log_root = "/var/lib/rudder/containers"
//! driver = "json-file"
//! discovery_url = "http://cluster.local/streamlog/list"
//!
//! [driver_options]
//! max-size = "10m"
//! max-file = "3"
//!
//! [streamlog]
//! idle_ping_secs = 3
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rudder_streamlog::ClientConfig;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Default directory holding per-container log files.
pub const DEFAULT_LOG_ROOT: &str = "/var/lib/rudder/containers";

/// Timings of the streaming shipping client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamLogSettings {
    /// Idle time after which a keepalive ping is sent.
    pub idle_ping_secs: u64,
    /// Delay between reconnect attempts.
    pub reconnect_interval_secs: u64,
    /// Period of the discovery refresh.
    pub discovery_refresh_secs: u64,
}

impl Default for StreamLogSettings {
    fn default() -> Self {
        Self {
            idle_ping_secs: 3,
            reconnect_interval_secs: 5,
            discovery_refresh_secs: 10,
        }
    }
}

/// Main agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// Directory under which each container gets its log directory.
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
    /// Driver used for captured containers.
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Options handed to the driver.
    #[serde(default)]
    pub driver_options: HashMap<String, String>,
    /// Cluster endpoint listing aggregator addresses.
    #[serde(default)]
    pub discovery_url: Option<String>,
    /// Shipping client timings.
    #[serde(default)]
    pub streamlog: StreamLogSettings,
}

fn default_log_root() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_ROOT)
}

fn default_driver() -> String {
    rudder_jsonfile::DRIVER_NAME.to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_root: default_log_root(),
            driver: default_driver(),
            driver_options: HashMap::new(),
            discovery_url: None,
            streamlog: StreamLogSettings::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, NodeError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| NodeError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.driver.trim().is_empty() {
            return Err(NodeError::Config("driver cannot be empty".to_string()));
        }

        if self.log_root.as_os_str().is_empty() {
            return Err(NodeError::Config("log_root cannot be empty".to_string()));
        }

        if let Some(url) = &self.discovery_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(NodeError::Config(
                    "discovery_url must start with http:// or https://".to_string(),
                ));
            }
        }

        let timings = [
            ("streamlog.idle_ping_secs", self.streamlog.idle_ping_secs),
            (
                "streamlog.reconnect_interval_secs",
                self.streamlog.reconnect_interval_secs,
            ),
            (
                "streamlog.discovery_refresh_secs",
                self.streamlog.discovery_refresh_secs,
            ),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, secs)| *secs == 0) {
            return Err(NodeError::Config(format!("{name} must be greater than 0")));
        }

        Ok(())
    }

    /// Directory holding the logs of one container.
    #[must_use]
    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.log_root.join(container_id)
    }

    /// Path of the json-file log of one container.
    #[must_use]
    pub fn log_path(&self, container_id: &str) -> PathBuf {
        self.container_dir(container_id)
            .join(format!("{container_id}-json.log"))
    }

    /// Client settings every streamlog sink starts from.
    #[must_use]
    pub fn client_template(&self) -> ClientConfig {
        let mut template = ClientConfig::default()
            .with_idle_ping(Duration::from_secs(self.streamlog.idle_ping_secs))
            .with_reconnect_interval(Duration::from_secs(
                self.streamlog.reconnect_interval_secs,
            ))
            .with_discovery_refresh(Duration::from_secs(self.streamlog.discovery_refresh_secs));
        if let Some(url) = &self.discovery_url {
            template = template.with_discovery_url(url.clone());
        }
        template
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = AgentConfig::from_toml("").expect("should parse empty config");
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.driver, "json-file");
        assert_eq!(config.streamlog.idle_ping_secs, 3);
        assert_eq!(config.streamlog.reconnect_interval_secs, 5);
        assert_eq!(config.streamlog.discovery_refresh_secs, 10);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            log_root = "/data/logs"
            driver = "streamlog"
            discovery_url = "https://cluster.example.com/streamlog/list"

            [driver_options]
            stream-server = "10.0.0.5:6362"
            mode = "non-blocking"

            [streamlog]
            idle_ping_secs = 1
            reconnect_interval_secs = 2
            discovery_refresh_secs = 30
        "#;

        let config = AgentConfig::from_toml(toml).expect("should parse full config");
        assert_eq!(config.log_root, PathBuf::from("/data/logs"));
        assert_eq!(config.driver, "streamlog");
        assert_eq!(
            config.driver_options.get("stream-server").map(String::as_str),
            Some("10.0.0.5:6362")
        );
        assert_eq!(config.streamlog.discovery_refresh_secs, 30);

        let template = config.client_template();
        assert_eq!(
            template.discovery_url.as_deref(),
            Some("https://cluster.example.com/streamlog/list")
        );
        assert_eq!(template.idle_ping, Duration::from_secs(1));
        assert_eq!(template.reconnect_interval, Duration::from_secs(2));
        assert_eq!(template.discovery_refresh, Duration::from_secs(30));
    }

    #[test_case("driver = \"\"", "driver cannot be empty" ; "empty driver")]
    #[test_case("log_root = \"\"", "log_root cannot be empty" ; "empty log root")]
    #[test_case("discovery_url = \"cluster.local/list\"", "discovery_url" ; "discovery without scheme")]
    #[test_case("[streamlog]\nidle_ping_secs = 0", "idle_ping_secs" ; "zero ping")]
    #[test_case("[streamlog]\nreconnect_interval_secs = 0", "reconnect_interval_secs" ; "zero reconnect")]
    #[test_case("[streamlog]\ndiscovery_refresh_secs = 0", "discovery_refresh_secs" ; "zero refresh")]
    fn test_invalid_config(toml: &str, expected: &str) {
        let err = AgentConfig::from_toml(toml).expect_err("should reject config");
        assert!(
            err.to_string().contains(expected),
            "{err} does not mention {expected}"
        );
    }

    #[test]
    fn test_invalid_toml() {
        let result = AgentConfig::from_toml("driver = ");
        assert!(matches!(result, Err(NodeError::Config(msg)) if msg.starts_with("invalid TOML")));
    }

    #[test]
    fn test_load_from_file() {
        let file = create_temp_config("driver = \"json-file\"\n[driver_options]\nmax-size = \"1m\"\n");
        let config = AgentConfig::from_file(file.path()).expect("should load");
        assert_eq!(
            config.driver_options.get("max-size").map(String::as_str),
            Some("1m")
        );
    }

    #[test]
    fn test_load_missing_file() {
        let result = AgentConfig::from_file("/nonexistent/rudder.toml");
        assert!(matches!(result, Err(NodeError::Config(msg)) if msg.contains("/nonexistent/rudder.toml")));
    }

    #[test]
    fn test_log_paths() {
        let config = AgentConfig {
            log_root: PathBuf::from("/logs"),
            ..AgentConfig::default()
        };
        assert_eq!(config.container_dir("abc"), PathBuf::from("/logs/abc"));
        assert_eq!(config.log_path("abc"), PathBuf::from("/logs/abc/abc-json.log"));
    }

    #[test]
    fn test_template_without_discovery() {
        let template = AgentConfig::default().client_template();
        assert!(template.discovery_url.is_none());
        assert!(template.server.is_none());
    }
}
