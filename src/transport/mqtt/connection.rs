//! Pure connection state management for the MQTT transport
//!
//! Connection states, reconnect backoff and option construction. Nothing in
//! here performs I/O.

use crate::transport::{Credentials, Endpoint, QosLevel};
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::fmt;
use uuid::Uuid;

/// Connection state for the MQTT transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for the first ConnAck
    Connecting,
    /// Connected and ready for publish/subscribe
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Event loop recovering (attempt count)
    Reconnecting(u32),
    /// Gave up or shut down
    PermanentlyDisconnected(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::PermanentlyDisconnected(reason) => {
                write!(f, "permanently disconnected ({reason})")
            }
        }
    }
}

/// Reconnect backoff between event-loop failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Consecutive failures tolerated before giving up (None = forever)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Delay before 1-based `attempt`: 25, 50, 100, 250 ms then sustained
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

pub fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Unique per connection so two processes on one node never evict each other
pub fn generate_client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..12])
}

/// Build rumqttc options from the endpoint and optional credentials
pub fn configure_mqtt_options(
    client_id: &str,
    endpoint: &Endpoint,
    credentials: Option<&Credentials>,
) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);

    if endpoint.tls {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    options.set_keep_alive(endpoint.keep_alive);

    // Simulation payloads (time series, topology snapshots) exceed broker defaults
    options.set_max_packet_size(Some(1024 * 1024));

    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reconnect_backoff_pattern() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);

        let delays: Vec<u64> = (1..=6).map(|a| config.calculate_backoff_delay(a)).collect();
        assert_eq!(delays, vec![25, 50, 100, 250, 250, 250]);
        assert_eq!(config.calculate_backoff_delay(100), 250);
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: Vec::new(),
            sustained_delay: 500,
        };
        assert_eq!(config.calculate_backoff_delay(1), 500);
    }

    #[test]
    fn test_configure_options() {
        let endpoint = Endpoint::parse("mqtt://localhost:1883").unwrap();
        let credentials = Credentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let options = configure_mqtt_options("simcoord-test", &endpoint, Some(&credentials));
        assert_eq!(options.client_id(), "simcoord-test");
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = generate_client_id("simcoord-node-1");
        let b = generate_client_id("simcoord-node-1");
        assert!(a.starts_with("simcoord-node-1-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Reconnecting(2).to_string(),
            "reconnecting (attempt 2)"
        );
    }
}
