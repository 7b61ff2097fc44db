//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes of loading a file: accepted values,
//! defaults, and the error kind for each invalid input.

use simcoord::config::{ConfigError, CoordinatorConfig};
use simcoord::transport::QosLevel;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[node]
cluster_id = "cluster-a"
node_id = "node-1"

[mqtt]
broker_url = "mqtts://broker.example.com"
username_env = "MQTT_USER"
password_env = "MQTT_PASS"
qos = 0
keep_alive_secs = 30
connect_timeout_secs = 5

[outbound]
max_attempts = 4
retry_backoff_ms = 200
poll_interval_ms = 100

[agents]
codes = ["TWINS_SIMULATION_AGENT"]
"#,
    );

    let config = CoordinatorConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.node.node_id, "node-1");
    assert_eq!(config.qos(), QosLevel::AtMostOnce);
    assert_eq!(config.outbound.max_attempts, 4);
    assert_eq!(config.outbound.retry_backoff(), Duration::from_millis(200));
    assert_eq!(config.agents.codes, vec!["TWINS_SIMULATION_AGENT"]);

    let endpoint = config.endpoint().unwrap();
    assert_eq!(endpoint.host, "broker.example.com");
    assert_eq!(endpoint.port, 8883);
    assert!(endpoint.tls);
    assert_eq!(endpoint.keep_alive, Duration::from_secs(30));
    assert_eq!(endpoint.connect_timeout, Duration::from_secs(5));
}

#[test]
fn test_topic_base_is_canonicalized() {
    let temp_file = write_config(
        r#"
[node]
cluster_id = "cluster-a"
node_id = "node-1"

[mqtt]
broker_url = "mqtt://localhost:1883"
topic_base = "hydros//commands/"
"#,
    );

    let config = CoordinatorConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(
        config.coordination_topic(),
        "/hydros/commands/coordination/cluster-a"
    );
}

#[test]
fn test_missing_file_is_read_error() {
    let result = CoordinatorConfig::load_from_file(Path::new("/nonexistent/simcoord.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[node\ncluster_id = ");
    let result = CoordinatorConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_required_section_is_parse_error() {
    let temp_file = write_config(
        r#"
[node]
cluster_id = "cluster-a"
node_id = "node-1"
"#,
    );
    let result = CoordinatorConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_identifier_with_topic_separator_rejected() {
    let temp_file = write_config(
        r#"
[node]
cluster_id = "cluster/a"
node_id = "node-1"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );
    let result = CoordinatorConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidIdentifier(_))));
}

#[test]
fn test_unsupported_broker_scheme_rejected() {
    let temp_file = write_config(
        r#"
[node]
cluster_id = "cluster-a"
node_id = "node-1"

[mqtt]
broker_url = "http://localhost:1883"
"#,
    );
    let result = CoordinatorConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_credentials_resolved_from_environment() {
    let temp_file = write_config(
        r#"
[node]
cluster_id = "cluster-a"
node_id = "node-1"

[mqtt]
broker_url = "mqtt://localhost:1883"
username_env = "SIMCOORD_TEST_CONFIG_USER"
password_env = "SIMCOORD_TEST_CONFIG_PASS"
"#,
    );
    let config = CoordinatorConfig::load_from_file(temp_file.path()).unwrap();

    std::env::set_var("SIMCOORD_TEST_CONFIG_USER", "sim");
    std::env::set_var("SIMCOORD_TEST_CONFIG_PASS", "secret");
    let credentials = config.credentials().unwrap();
    assert_eq!(credentials.username, "sim");
    assert_eq!(credentials.password, "secret");
    assert!(!format!("{credentials:?}").contains("secret"));
}

#[test]
fn test_round_trip_through_toml() {
    let temp_file = write_config(
        r#"
[node]
cluster_id = "cluster-a"
node_id = "node-1"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );
    let config = CoordinatorConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = CoordinatorConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}
