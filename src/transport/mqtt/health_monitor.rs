//! Pure health and reconnection logic for the MQTT transport
//!
//! The event-loop thread feeds [`ConnectionEvent`]s through
//! [`HealthMonitor::determine_next_state`] and asks
//! [`HealthMonitor::should_attempt_reconnection`] how long to back off after a
//! failure. Nothing in here sleeps or touches the network.

use super::connection::{ConnectionState, ReconnectConfig};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether the event loop keeps polling after `failures` consecutive errors
    pub fn should_attempt_reconnection(
        failures: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if failures >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = failures + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: Duration::from_millis(config.calculate_backoff_delay(attempt)),
        }
    }

    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::ShutdownRequested => {
                ConnectionState::PermanentlyDisconnected("shutdown requested".to_string())
            }
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// The event loop is finished and will not recover on its own
    pub fn is_terminal(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::PermanentlyDisconnected(_))
    }

    pub fn calculate_health_metrics(
        state: &ConnectionState,
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();
        let connected = matches!(state, ConnectionState::Connected);
        let uptime = connect_time
            .filter(|_| connected)
            .map(|t| now.duration_since(t));

        let mut metrics = HealthMetrics {
            state: state.to_string(),
            connected,
            uptime_ms: uptime.map(|d| d.as_millis() as u64),
            ms_since_last_message: last_message_time.map(|t| now.duration_since(t).as_millis() as u64),
            reconnect_count,
            quality: ConnectionQuality::Down,
        };
        metrics.quality = Self::assess_connection_quality(&metrics);
        metrics
    }

    /// Coordination topics can be silent for a long time between tasks, so
    /// quality only looks at connectivity and reconnect churn
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.connected {
            return ConnectionQuality::Down;
        }
        match metrics.reconnect_count {
            0..=2 => ConnectionQuality::Stable,
            3..=10 => ConnectionQuality::Flapping,
            _ => ConnectionQuality::Unreliable,
        }
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt, "MQTT reconnected");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                if reason == "shutdown requested" {
                    info!("MQTT event loop stopped");
                } else {
                    error!(reason = %reason, "MQTT connection permanently failed");
                }
            }
            (from, to) if from != to => {
                info!(from = %from, to = %to, "MQTT connection state changed");
            }
            _ => {}
        }
    }
}

/// Decision after an event-loop failure
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Events observed by the event-loop thread
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    ShutdownRequested,
    PermanentFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Stable,
    Flapping,
    Unreliable,
    Down,
}

/// Snapshot of transport health
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthMetrics {
    pub state: String,
    pub connected: bool,
    pub uptime_ms: Option<u64>,
    pub ms_since_last_message: Option<u64>,
    pub reconnect_count: u32,
    pub quality: ConnectionQuality,
}
