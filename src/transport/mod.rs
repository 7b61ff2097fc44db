//! Transport layer for the coordination topic
//!
//! [`Transport`] abstracts the broker connection so the coordination client can
//! run against MQTT in production and [`crate::testing::MockTransport`] in
//! tests. Implementations own exactly one background I/O thread; the inbound
//! callback runs on that thread.

use crate::error::TransportError;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub mod mqtt;

pub use mqtt::MqttTransport;

/// Invoked with `(topic, payload)` for every inbound frame
pub type InboundCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Transport trait for the coordination client
///
/// All methods take `&self`; implementations synchronize internally so one
/// transport can be shared between the inbound and outbound threads.
pub trait Transport: Send + Sync {
    /// Connect to the broker and start the I/O thread
    fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<(), TransportError>;

    /// Subscribe to a topic; kept across reconnects
    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError>;

    /// Hand one frame to the transport
    ///
    /// `attempt` is 1-based and only used for diagnostics.
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        attempt: u32,
    ) -> Result<(), TransportError>;

    /// Register the inbound callback; replaces any previous one
    fn on_message(&self, callback: InboundCallback);

    /// Stop the I/O thread and close the connection
    fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// MQTT quality of service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(QosLevel::AtMostOnce),
            1 => Some(QosLevel::AtLeastOnce),
            2 => Some(QosLevel::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// Broker address and session timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub keep_alive: Duration,
    /// How long `connect` waits for the broker to acknowledge
    pub connect_timeout: Duration,
}

impl Endpoint {
    /// Parse `mqtt://`, `tcp://`, `mqtts://` or `ssl://` broker URLs
    pub fn parse(broker_url: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidBrokerUrl(broker_url.to_string());
        let url = Url::parse(broker_url).map_err(|_| invalid())?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(invalid()),
        };
        let host = url.host_str().ok_or_else(invalid)?.to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            host,
            port,
            tls,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        })
    }
}

/// Username/password resolved from the environment
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_schemes() {
        let plain = Endpoint::parse("tcp://192.168.1.24:1883").unwrap();
        assert_eq!(plain.host, "192.168.1.24");
        assert_eq!(plain.port, 1883);
        assert!(!plain.tls);

        let tls = Endpoint::parse("mqtts://broker.example.com").unwrap();
        assert_eq!(tls.port, 8883);
        assert!(tls.tls);

        assert!(Endpoint::parse("ssl://broker:9000").unwrap().tls);
        assert_eq!(Endpoint::parse("mqtt://localhost").unwrap().port, 1883);
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(matches!(
            Endpoint::parse("invalid-url"),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
        assert!(Endpoint::parse("http://localhost:1883").is_err());
    }

    #[test]
    fn test_qos_levels() {
        for level in 0..=2 {
            assert_eq!(QosLevel::from_level(level).map(QosLevel::level), Some(level));
        }
        assert_eq!(QosLevel::from_level(3), None);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        assert!(!format!("{credentials:?}").contains("secret"));
    }
}
