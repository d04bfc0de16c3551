//! Client configuration, loaded from TOML.
//!
//! Only `endpoint` is required; everything else has a default:
//!
//! ```toml
//! endpoint = "wss://broker.example.org:443/mqtt"
//! discovery_topic = "ami/world"
//!
//! [command]
//! timeout_ms = 10000
//! quoting = "always"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::command::{QuotingPolicy, DEFAULT_CONVERTER};
use crate::error::ConfigError;
use crate::transport::QoS;

const CONFIG_DIR: &str = "ami-mqtt";
const CONFIG_FILE: &str = "client.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Broker URL, e.g. `wss://host:443/mqtt` or `tcp://host:1883`
    pub endpoint: String,

    /// Topic servers announce themselves on when no server name is given at sign-in
    #[serde(default)]
    pub discovery_topic: Option<String>,

    /// Topic an empty message is published to after subscribing to discovery
    #[serde(default)]
    pub discovery_trigger_topic: Option<String>,

    /// JSON field of a discovery announcement holding the server name
    #[serde(default = "default_discovery_field")]
    pub discovery_field: String,

    #[serde(default)]
    pub command: CommandDefaults,

    #[serde(default)]
    pub transport: TransportSettings,
}

/// Defaults applied to `execute` calls that leave an option unset.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CommandDefaults {
    pub timeout_ms: u64,
    pub qos: QoS,
    pub retained: bool,
    pub converter: String,
    pub quoting: QuotingPolicy,
}

impl Default for CommandDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            qos: QoS::AtMostOnce,
            retained: false,
            converter: DEFAULT_CONVERTER.to_string(),
            quoting: QuotingPolicy::Always,
        }
    }
}

impl CommandDefaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for the rumqttc binding.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    pub keep_alive_secs: u64,
    /// Pause between a dropped connection and the next reconnect attempt
    pub reconnect_delay_ms: u64,
    /// Capacity of the request queue towards the event loop
    pub request_capacity: usize,
    pub max_packet_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: 30,
            reconnect_delay_ms: 2_000,
            request_capacity: 100,
            max_packet_size: 1024 * 1024,
        }
    }
}

fn default_discovery_field() -> String {
    "serverName".to_string()
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            discovery_topic: None,
            discovery_trigger_topic: None,
            discovery_field: default_discovery_field(),
            command: CommandDefaults::default(),
            transport: TransportSettings::default(),
        }
    }

    pub fn with_discovery(mut self, topic: impl Into<String>, trigger: Option<String>) -> Self {
        self.discovery_topic = Some(topic.into());
        self.discovery_trigger_topic = trigger;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading client config from {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let config = Self::from_toml_str(&content)?;
        info!("Loaded client config for endpoint {}", config.endpoint);
        Ok(config)
    }

    /// `<config_dir>/ami-mqtt/client.toml`, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push(CONFIG_DIR);
            path.push(CONFIG_FILE);
            path
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = ClientConfig::from_toml_str(r#"endpoint = "tcp://localhost:1883""#)
            .expect("parses");

        assert_eq!(config, ClientConfig::new("tcp://localhost:1883"));
        assert_eq!(config.command.timeout(), Duration::from_millis(10_000));
        assert_eq!(config.command.converter, "AMIXmlToJson.xsl");
        assert_eq!(config.command.quoting, QuotingPolicy::Always);
        assert_eq!(config.discovery_field, "serverName");
    }

    #[test]
    fn full_config_overrides_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            endpoint = "wss://broker:443/mqtt"
            discovery_topic = "ami/world"
            discovery_trigger_topic = "ami/hello"
            discovery_field = "name"

            [command]
            timeout_ms = 500
            qos = 1
            quoting = "json"
            converter = ""

            [transport]
            reconnect_delay_ms = 100
            "#,
        )
        .expect("parses");

        assert_eq!(config.discovery_topic.as_deref(), Some("ami/world"));
        assert_eq!(config.discovery_trigger_topic.as_deref(), Some("ami/hello"));
        assert_eq!(config.discovery_field, "name");
        assert_eq!(config.command.timeout_ms, 500);
        assert_eq!(config.command.qos, QoS::AtLeastOnce);
        assert_eq!(config.command.quoting, QuotingPolicy::Json);
        assert_eq!(config.command.converter, "");
        assert_eq!(config.transport.reconnect_delay_ms, 100);
        assert_eq!(config.transport.keep_alive_secs, 30);
    }

    #[test]
    fn invalid_qos_is_rejected() {
        let result = ClientConfig::from_toml_str(
            r#"
            endpoint = "tcp://localhost"
            [command]
            qos = 3
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        assert!(ClientConfig::from_toml_str("discovery_topic = \"x\"").is_err());
    }

    #[tokio::test]
    async fn missing_file_reports_path() {
        let result = ClientConfig::load("/nonexistent/ami/client.toml").await;
        match result {
            Err(ConfigError::Read { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/ami/client.toml"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
