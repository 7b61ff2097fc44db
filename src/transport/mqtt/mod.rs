//! MQTT transport for the coordination topic
//!
//! Split the same way as the rest of the transport code: pure pieces that can
//! be tested without a broker, and one module that does the I/O.
//!
//! - [`connection`] - connection states, reconnect backoff, rumqttc options
//! - [`message_handler`] - routing of rumqttc events
//! - [`health_monitor`] - state transitions, reconnect decisions, health metrics
//! - [`client`] - the event-loop thread and the [`Transport`](crate::transport::Transport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use simcoord::transport::{Endpoint, MqttTransport, QosLevel, Transport};
//!
//! let transport = MqttTransport::new("simcoord-node-1");
//! let endpoint = Endpoint::parse("mqtt://localhost:1883")?;
//! transport.connect(&endpoint, None)?;
//! transport.subscribe("/hydros/commands/coordination/cluster-a", QosLevel::AtLeastOnce)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{ConnectionState, ReconnectConfig};
pub use health_monitor::{
    ConnectionEvent, ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
pub use message_handler::{EventRoute, MessageHandler};
