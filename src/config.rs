//! Configuration system for the coordination client
//!
//! Loaded from a TOML file. Credentials are never stored in the file: the
//! `mqtt` section names the environment variables that hold them and they are
//! resolved at connect time.

use crate::protocol::topics::TopicBuilder;
use crate::transport::{Credentials, Endpoint, QosLevel};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main coordinator configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    pub node: NodeSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub outbound: OutboundSection,
    #[serde(default)]
    pub agents: AgentsSection,
}

/// Process identity within the cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// Cluster whose coordination topic this process joins
    pub cluster_id: String,
    /// Node identifier used to tell local agents from remote ones
    pub node_id: String,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Prefix for the coordination topics
    #[serde(default = "default_topic_base")]
    pub topic_base: String,
    /// QoS level for commands and responses (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How long `start()` waits for the broker to acknowledge the connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_topic_base() -> String {
    "/hydros/commands".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Outbound queue behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundSection {
    /// Publish attempts per message before it is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay before a failed message is re-enqueued
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound on how long the consumer waits before re-checking the stop flag
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for OutboundSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl OutboundSection {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Agent codes hosted by this process
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentsSection {
    #[serde(default)]
    pub codes: Vec<String>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid identifier format: {0}")]
    InvalidIdentifier(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("node.cluster_id", &self.node.cluster_id)?;
        validate_identifier("node.node_id", &self.node.node_id)?;

        if QosLevel::from_level(self.mqtt.qos).is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        if self.outbound.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "outbound.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.outbound.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "outbound.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Endpoint::parse(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        Ok(())
    }

    /// Coordination topic for this node's cluster
    pub fn coordination_topic(&self) -> String {
        TopicBuilder::coordination_topic(&self.mqtt.topic_base, &self.node.cluster_id)
    }

    /// Metrics topic for this node's cluster
    pub fn metrics_topic(&self) -> String {
        TopicBuilder::metrics_topic(&self.mqtt.topic_base, &self.node.cluster_id)
    }

    pub fn qos(&self) -> QosLevel {
        QosLevel::from_level(self.mqtt.qos).unwrap_or(QosLevel::AtLeastOnce)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt.connect_timeout_secs)
    }

    /// Broker endpoint; `validate` has already checked the URL
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let mut endpoint = Endpoint::parse(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        endpoint.keep_alive = Duration::from_secs(self.mqtt.keep_alive_secs);
        endpoint.connect_timeout = self.connect_timeout();
        Ok(endpoint)
    }

    /// Resolve MQTT credentials from the configured environment variables
    pub fn credentials(&self) -> Option<Credentials> {
        let username = Self::get_env_var_optional(self.mqtt.username_env.as_ref())?;
        let password =
            Self::get_env_var_optional(self.mqtt.password_env.as_ref()).unwrap_or_default();
        Some(Credentials { username, password })
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[node]
cluster_id = "cluster-a"
node_id = "node-1"

[mqtt]
broker_url = "mqtt://localhost:1883"

[outbound]
max_attempts = 3
retry_backoff_ms = 1
poll_interval_ms = 10

[agents]
codes = ["TWINS_SIMULATION_AGENT"]
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Identifiers end up inside topic names and must match [a-zA-Z0-9._-]+
fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if value.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidIdentifier(format!(
            "{field} '{value}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[node]
cluster_id = "cluster-a"
node_id = "node-1"

[mqtt]
broker_url = "tcp://192.168.1.24:1883"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
topic_base = "/hydros/commands"
qos = 2
keep_alive_secs = 30

[outbound]
max_attempts = 5
retry_backoff_ms = 250

[agents]
codes = ["TWINS_SIMULATION_AGENT", "ONTOLOGY_SIMULATION_AGENT"]
"#;

        let config = CoordinatorConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.node.cluster_id, "cluster-a");
        assert_eq!(config.mqtt.qos, 2);
        assert_eq!(config.qos(), QosLevel::ExactlyOnce);
        assert_eq!(config.outbound.max_attempts, 5);
        assert_eq!(config.outbound.poll_interval_ms, 1000);
        assert_eq!(config.agents.codes.len(), 2);
        assert_eq!(
            config.coordination_topic(),
            "/hydros/commands/coordination/cluster-a"
        );
        assert_eq!(
            config.metrics_topic(),
            "/hydros/commands/coordination/cluster-a/metrics"
        );
    }

    #[test]
    fn test_minimal_config_defaults() {
        let toml_content = r#"
[node]
cluster_id = "c"
node_id = "n"

[mqtt]
broker_url = "mqtt://localhost"
"#;

        let config = CoordinatorConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.mqtt.topic_base, "/hydros/commands");
        assert_eq!(config.mqtt.qos, 1);
        assert_eq!(config.mqtt.connect_timeout_secs, 10);
        assert_eq!(config.outbound, OutboundSection::default());
        assert!(config.agents.codes.is_empty());
    }

    #[test]
    fn test_invalid_node_id() {
        let result = validate_identifier("node.node_id", "node/1");
        assert!(matches!(result, Err(ConfigError::InvalidIdentifier(_))));

        assert!(validate_identifier("node.node_id", "node-1_a.b").is_ok());
        assert!(validate_identifier("node.node_id", "").is_err());
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut config = CoordinatorConfig::test_config();
        config.outbound.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let mut config = CoordinatorConfig::test_config();
        config.mqtt.qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_broker_url_rejected() {
        let mut config = CoordinatorConfig::test_config();
        config.mqtt.broker_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_absent_without_env() {
        let mut config = CoordinatorConfig::test_config();
        config.mqtt.username_env = Some("SIMCOORD_TEST_UNSET_USERNAME_VAR".to_string());
        assert!(config.credentials().is_none());
    }
}
