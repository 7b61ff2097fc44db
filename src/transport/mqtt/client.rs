//! Impure I/O for the MQTT transport
//!
//! One named OS thread drives the rumqttc v5 [`Connection`] iterator. It
//! tracks connection state, re-subscribes after a reconnect, backs off between
//! failures and hands every accepted publish to the inbound callback.

use super::connection::{
    configure_mqtt_options, generate_client_id, to_mqtt_qos, ConnectionState, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::error::TransportError;
use crate::transport::{Credentials, Endpoint, InboundCallback, QosLevel, Transport};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use rumqttc::v5::{Client, Connection};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 64;
const EVENT_LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the transport handle and its event-loop thread
struct Shared {
    client: Mutex<Option<Client>>,
    state: RwLock<ConnectionState>,
    callback: RwLock<Option<InboundCallback>>,
    subscriptions: Mutex<Vec<(String, QosLevel)>>,
    connect_time: Mutex<Option<Instant>>,
    last_message_time: Mutex<Option<Instant>>,
    reconnect_count: AtomicU32,
}

impl Shared {
    fn apply_event(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let mut state = self.state.write();
        HealthMonitor::log_state_transition(&state, &next);
        *state = next;
    }

    fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock().clone();
        let client = self.client.lock();
        let Some(client) = client.as_ref() else {
            return;
        };
        for (topic, qos) in subscriptions {
            match client.try_subscribe(topic.as_str(), to_mqtt_qos(qos)) {
                Ok(()) => debug!(topic = %topic, "Re-subscribed"),
                Err(e) => error!(topic = %topic, error = %e, "Failed to re-subscribe"),
            }
        }
    }

    fn deliver(&self, topic: &str, payload: &[u8]) {
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => callback(topic, payload),
            None => warn!(topic = %topic, "Received MQTT message but no callback registered - message dropped"),
        }
    }
}

/// MQTT implementation of [`Transport`] on the synchronous rumqttc v5 client
pub struct MqttTransport {
    client_prefix: String,
    reconnect_config: ReconnectConfig,
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// `client_prefix` is extended with a random suffix per connection
    pub fn new(client_prefix: impl Into<String>) -> Self {
        Self {
            client_prefix: client_prefix.into(),
            reconnect_config: ReconnectConfig::default(),
            shared: Arc::new(Shared {
                client: Mutex::new(None),
                state: RwLock::new(ConnectionState::Disconnected("not connected".to_string())),
                callback: RwLock::new(None),
                subscriptions: Mutex::new(Vec::new()),
                connect_time: Mutex::new(None),
                last_message_time: Mutex::new(None),
                reconnect_count: AtomicU32::new(0),
            }),
            shutdown_tx: Mutex::new(None),
            event_loop: Mutex::new(None),
        }
    }

    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect_config = config;
        self
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        HealthMonitor::is_terminal(&self.connection_state())
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(
            &self.connection_state(),
            *self.shared.connect_time.lock(),
            *self.shared.last_message_time.lock(),
            self.shared.reconnect_count.load(Ordering::Relaxed),
        )
    }

    fn check_connection_state(&self) -> Result<(), TransportError> {
        let state = self.connection_state();
        if HealthMonitor::can_publish(&state) {
            Ok(())
        } else {
            Err(TransportError::NotConnected {
                state: state.to_string(),
            })
        }
    }

    /// Block until the event loop reports ConnAck, a failure, or the timeout
    fn wait_for_connection_confirmation(
        state_rx: &Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            match state_rx.recv_deadline(deadline) {
                Ok(ConnectionState::Connected) => return Ok(()),
                Ok(ConnectionState::Disconnected(reason)) => {
                    return Err(TransportError::ConnectionFailed(reason));
                }
                Ok(ConnectionState::PermanentlyDisconnected(reason)) => {
                    return Err(TransportError::ConnectionFailed(format!(
                        "Permanently disconnected: {reason}"
                    )));
                }
                Ok(ConnectionState::Connecting | ConnectionState::Reconnecting(_)) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TransportError::ConnectionFailed(
                        "ConnAck timeout - no connection confirmation received".to_string(),
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::ConnectionFailed(
                        "Event loop exited before connecting".to_string(),
                    ));
                }
            }
        }
    }

    /// Sleep for `delay` unless shutdown is signalled; false when interrupted
    fn interruptible_sleep(shutdown_rx: &Receiver<()>, delay: Duration) -> bool {
        !matches!(
            shutdown_rx.recv_timeout(delay),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    fn shutdown_requested(shutdown_rx: &Receiver<()>) -> bool {
        matches!(shutdown_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn run_event_loop(
        mut connection: Connection,
        shared: Arc<Shared>,
        state_tx: Sender<ConnectionState>,
        shutdown_rx: Receiver<()>,
        reconnect_config: ReconnectConfig,
    ) {
        let mut failures = 0u32;
        let mut ever_connected = false;

        for notification in connection.iter() {
            if Self::shutdown_requested(&shutdown_rx) {
                break;
            }

            match notification {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        failures = 0;
                        if ever_connected {
                            shared.reconnect_count.fetch_add(1, Ordering::Relaxed);
                            shared.resubscribe();
                        }
                        ever_connected = true;
                        *shared.connect_time.lock() = Some(Instant::now());
                        shared.apply_event(ConnectionEvent::ConnAckReceived);
                        let _ = state_tx.try_send(ConnectionState::Connected);
                    }
                    EventRoute::MessageReceived {
                        topic,
                        payload,
                        retain,
                    } => {
                        *shared.last_message_time.lock() = Some(Instant::now());
                        if MessageHandler::should_process_message(
                            &topic,
                            retain,
                            &shared.subscribed_topics(),
                        ) {
                            shared.deliver(&topic, &payload);
                        }
                    }
                    EventRoute::Disconnected => {
                        shared.apply_event(ConnectionEvent::DisconnectedByBroker);
                    }
                    EventRoute::SubscriptionConfirmed { packet_id } => {
                        debug!(packet_id, "Subscription confirmed");
                    }
                    EventRoute::InfrastructureEvent | EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    let reason = e.to_string();
                    shared.apply_event(ConnectionEvent::NetworkError(reason.clone()));
                    let _ = state_tx.try_send(ConnectionState::Disconnected(reason));

                    match HealthMonitor::should_attempt_reconnection(
                        failures,
                        &reconnect_config,
                        Self::shutdown_requested(&shutdown_rx),
                    ) {
                        ReconnectionDecision::Proceed { attempt, delay } => {
                            failures = attempt;
                            shared.apply_event(ConnectionEvent::ReconnectionStarted(attempt));
                            if !Self::interruptible_sleep(&shutdown_rx, delay) {
                                break;
                            }
                        }
                        ReconnectionDecision::AbortShutdownRequested => break,
                        ReconnectionDecision::AbortMaxAttemptsExceeded => {
                            shared.apply_event(ConnectionEvent::PermanentFailure(format!(
                                "gave up after {failures} reconnection attempts"
                            )));
                            return;
                        }
                    }
                }
            }
        }

        shared.apply_event(ConnectionEvent::ShutdownRequested);
    }

    /// Signal the event loop, close the client and join the thread
    fn stop_event_loop(&self) {
        self.shutdown_tx.lock().take();

        if let Some(client) = self.shared.client.lock().take() {
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "Disconnect request not delivered");
            }
        }

        let Some(handle) = self.event_loop.lock().take() else {
            return;
        };
        let deadline = Instant::now() + EVENT_LOOP_JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("MQTT event loop thread panicked");
            }
        } else {
            warn!("MQTT event loop did not stop in time, detaching thread");
        }
    }
}

impl Transport for MqttTransport {
    fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<(), TransportError> {
        if self.shared.client.lock().is_some() {
            return Err(TransportError::ConnectionFailed(
                "Event loop already started".to_string(),
            ));
        }

        let client_id = generate_client_id(&self.client_prefix);
        let options = configure_mqtt_options(&client_id, endpoint, credentials);
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);

        let (state_tx, state_rx) = bounded(16);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        *self.shared.client.lock() = Some(client);
        *self.shared.state.write() = ConnectionState::Connecting;
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        info!(
            client_id = %client_id,
            host = %endpoint.host,
            port = endpoint.port,
            tls = endpoint.tls,
            "Starting MQTT event loop"
        );

        let shared = self.shared.clone();
        let reconnect_config = self.reconnect_config.clone();
        let handle = thread::Builder::new()
            .name("mqtt-event-loop".to_string())
            .spawn(move || {
                Self::run_event_loop(connection, shared, state_tx, shutdown_rx, reconnect_config)
            })
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        *self.event_loop.lock() = Some(handle);

        if let Err(e) = Self::wait_for_connection_confirmation(&state_rx, endpoint.connect_timeout)
        {
            self.stop_event_loop();
            return Err(e);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError> {
        self.check_connection_state().map_err(|e| TransportError::SubscriptionFailed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        {
            let client = self.shared.client.lock();
            let client = client.as_ref().ok_or_else(|| TransportError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: "client not connected".to_string(),
            })?;
            client
                .try_subscribe(topic, to_mqtt_qos(qos))
                .map_err(|e| TransportError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let mut subscriptions = self.shared.subscriptions.lock();
        if !subscriptions.iter().any(|(existing, _)| existing == topic) {
            subscriptions.push((topic.to_string(), qos));
        }
        info!(topic = %topic, qos = qos.level(), "Subscribed");
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        attempt: u32,
    ) -> Result<(), TransportError> {
        self.check_connection_state()?;

        let client = self.shared.client.lock();
        let client = client.as_ref().ok_or_else(|| TransportError::NotConnected {
            state: "no client".to_string(),
        })?;
        client
            .try_publish(topic, to_mqtt_qos(qos), false, payload.to_vec())
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        debug!(topic = %topic, bytes = payload.len(), attempt, "Published");
        Ok(())
    }

    fn on_message(&self, callback: InboundCallback) {
        *self.shared.callback.write() = Some(callback);
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_event_loop();
        *self.shared.state.write() =
            ConnectionState::Disconnected("client disconnected".to_string());
        *self.shared.connect_time.lock() = None;
        info!("MQTT transport disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.connection_state())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // Dropping the sender wakes the event loop out of any backoff sleep
        self.shutdown_tx.lock().take();
        self.shared.client.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_for_connection_confirmation_success() {
        let (state_tx, state_rx) = bounded(4);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttTransport::wait_for_connection_confirmation(&state_rx, Duration::from_secs(1));
        assert!(result.is_ok());
    }

    #[test]
    fn test_wait_for_connection_confirmation_timeout() {
        let (_state_tx, state_rx) = bounded::<ConnectionState>(4);
        let err = MqttTransport::wait_for_connection_confirmation(
            &state_rx,
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ConnAck"));
    }

    #[test]
    fn test_wait_for_connection_confirmation_disconnected() {
        let (state_tx, state_rx) = bounded(4);
        state_tx
            .send(ConnectionState::Disconnected("refused".to_string()))
            .unwrap();
        let err = MqttTransport::wait_for_connection_confirmation(
            &state_rx,
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_interruptible_sleep() {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        assert!(MqttTransport::interruptible_sleep(
            &shutdown_rx,
            Duration::from_millis(5)
        ));
        assert!(!MqttTransport::shutdown_requested(&shutdown_rx));

        drop(shutdown_tx);
        let started = Instant::now();
        assert!(!MqttTransport::interruptible_sleep(
            &shutdown_rx,
            Duration::from_secs(5)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(MqttTransport::shutdown_requested(&shutdown_rx));
    }

    #[test]
    fn test_publish_refused_before_connect() {
        let transport = MqttTransport::new("simcoord-test");
        let err = transport
            .publish("/t", b"{}", QosLevel::AtLeastOnce, 1)
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected { .. }));
        assert!(!transport.is_connected());
        assert!(transport.subscribe("/t", QosLevel::AtLeastOnce).is_err());
    }

    #[test]
    fn test_disconnect_without_connect() {
        let transport = MqttTransport::new("simcoord-test");
        assert!(transport.disconnect().is_ok());
        assert!(!transport.is_permanently_disconnected());
    }

    #[test]
    fn test_initial_health_metrics() {
        let transport = MqttTransport::new("simcoord-test");
        let metrics = transport.health_metrics();
        assert!(!metrics.connected);
        assert_eq!(metrics.reconnect_count, 0);
        assert_eq!(metrics.uptime_ms, None);
    }

    #[test]
    fn test_connect_refused_fails_fast() {
        let transport = MqttTransport::new("simcoord-test");
        let mut endpoint = Endpoint::parse("mqtt://127.0.0.1:1").unwrap();
        endpoint.connect_timeout = Duration::from_secs(3);

        assert!(transport.connect(&endpoint, None).is_err());
        assert!(!transport.is_connected());
    }
}
