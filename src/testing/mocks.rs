//! Mock implementations for testing
//!
//! [`MockTransport`] stands in for the broker connection and
//! [`RecordingCallback`] for business logic, so the whole coordination path can
//! be exercised in-process.

use crate::agent::AgentRecord;
use crate::dispatch::{CoordinationCallback, HandlerResult};
use crate::error::TransportError;
use crate::protocol::{
    CommandEnvelope, CommandKind, CommandResponse, Context, TaskInitRequest, TerminateRequest,
    TickRequest, TimeSeriesCalcRequest, TimeSeriesUpdateRequest,
};
use crate::transport::{Credentials, Endpoint, InboundCallback, QosLevel, Transport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// One frame handed to [`MockTransport::publish`] successfully
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub attempt: u32,
}

impl PublishedMessage {
    pub fn envelope(&self) -> Option<CommandEnvelope> {
        CommandEnvelope::from_slice(&self.payload).ok()
    }
}

/// Mock transport for testing
///
/// Publishes are recorded, not sent. Failures can be scripted, and inbound
/// frames are injected on a separate thread the way a broker event loop would
/// deliver them.
#[derive(Default)]
pub struct MockTransport {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    callback: Mutex<Option<InboundCallback>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    publish_attempts: AtomicU32,
    failures_remaining: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Already connected, for tests that publish without `connect`
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        transport
    }

    /// `connect` will fail
    pub fn with_connect_failure() -> Self {
        let transport = Self::default();
        transport.fail_connect.store(true, Ordering::SeqCst);
        transport
    }

    /// The next `count` publish calls fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// Published frames on `topic` decoded as envelopes
    pub fn published_envelopes(&self, topic: &str) -> Vec<CommandEnvelope> {
        self.published
            .lock()
            .iter()
            .filter(|message| message.topic == topic)
            .filter_map(PublishedMessage::envelope)
            .collect()
    }

    /// Every publish call, successful or not
    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Deliver one frame to the registered callback on a separate thread
    ///
    /// Returns once the callback has finished. False when no callback is
    /// registered.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(callback) = self.callback.lock().clone() else {
            return false;
        };
        let topic = topic.to_string();
        let payload = payload.to_vec();

        thread::Builder::new()
            .name("mock-io".to_string())
            .spawn(move || callback(&topic, &payload))
            .map(|handle| handle.join().is_ok())
            .unwrap_or(false)
    }

    pub fn inject_envelope(&self, topic: &str, envelope: &CommandEnvelope) -> bool {
        match envelope.to_vec() {
            Ok(payload) => self.inject(topic, &payload),
            Err(_) => false,
        }
    }

    /// Poll until at least `count` frames were published
    pub fn wait_for_publishes(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.published.lock().len() >= count)
    }

    /// Poll until at least `count` publish calls were made
    pub fn wait_for_publish_attempts(&self, count: u32, timeout: Duration) -> bool {
        wait_until(timeout, || self.publish_attempts() >= count)
    }

    fn take_scripted_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        endpoint: &Endpoint,
        _credentials: Option<&Credentials>,
    ) -> Result<(), TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "mock refused {}:{}",
                endpoint.host, endpoint.port
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self, topic: &str, _qos: QosLevel) -> Result<(), TransportError> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        attempt: u32,
    ) -> Result<(), TransportError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected() {
            return Err(TransportError::NotConnected {
                state: "Disconnected".to_string(),
            });
        }
        if self.take_scripted_failure() {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "scripted failure".to_string(),
            });
        }

        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            attempt,
        });
        Ok(())
    }

    fn on_message(&self, callback: InboundCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connected", &self.is_connected())
            .field("published", &self.published.lock().len())
            .field("publish_attempts", &self.publish_attempts())
            .finish()
    }
}

/// One hook invocation seen by [`RecordingCallback`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub hook: &'static str,
    pub command_id: String,
    pub context_id: String,
    /// Agent instance ids handed to the hook
    pub agents: Vec<String>,
}

/// Callback that records every hook call and answers for each agent it is given
///
/// Hooks named with [`fail_on`](Self::fail_on) return an error and hooks named
/// with [`panic_on`](Self::panic_on) panic.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    calls: Mutex<Vec<RecordedCall>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, hook: &str) {
        self.failing.lock().insert(hook.to_string());
    }

    pub fn panic_on(&self, hook: &str) {
        self.panicking.lock().insert(hook.to_string());
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of invocations of `hook`
    pub fn calls(&self, hook: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.hook == hook).count()
    }

    fn respond(
        &self,
        hook: &'static str,
        kind: CommandKind,
        command_id: &str,
        context: &Context,
        agents: &[AgentRecord],
    ) -> HandlerResult {
        self.calls.lock().push(RecordedCall {
            hook,
            command_id: command_id.to_string(),
            context_id: context.id().to_string(),
            agents: agents.iter().map(|a| a.agent_instance_id.clone()).collect(),
        });

        if self.panicking.lock().contains(hook) {
            panic!("scripted panic in {hook}");
        }
        if self.failing.lock().contains(hook) {
            return Err(format!("scripted failure in {hook}").into());
        }

        Ok(agents
            .iter()
            .map(|agent| CommandResponse::new(kind.clone(), command_id, context, agent))
            .collect())
    }

    fn record_notification(&self, hook: &'static str, envelope: &CommandEnvelope) {
        self.calls.lock().push(RecordedCall {
            hook,
            command_id: envelope.command_id.clone(),
            context_id: envelope.context_id().to_string(),
            agents: envelope.source_agent_id().map(str::to_string).into_iter().collect(),
        });
    }
}

impl CoordinationCallback for RecordingCallback {
    fn component(&self) -> &str {
        "recording"
    }

    fn on_task_init(&self, request: &TaskInitRequest, agents: &[AgentRecord]) -> HandlerResult {
        self.respond(
            "on_task_init",
            CommandKind::TaskInitResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }

    fn on_tick(&self, request: &TickRequest, agents: &[AgentRecord]) -> HandlerResult {
        self.respond(
            "on_tick",
            CommandKind::TickResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }

    fn on_terminate(&self, request: &TerminateRequest, agents: &[AgentRecord]) -> HandlerResult {
        self.respond(
            "on_terminate",
            CommandKind::TerminateResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }

    fn on_time_series_update(
        &self,
        request: &TimeSeriesUpdateRequest,
        agents: &[AgentRecord],
    ) -> HandlerResult {
        self.respond(
            "on_time_series_update",
            CommandKind::TimeSeriesUpdateResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }

    fn on_time_series_calc(
        &self,
        request: &TimeSeriesCalcRequest,
        agents: &[AgentRecord],
    ) -> HandlerResult {
        self.respond(
            "on_time_series_calc",
            CommandKind::TimeSeriesCalcResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }

    fn on_sibling_created(&self, envelope: &CommandEnvelope) {
        self.record_notification("on_sibling_created", envelope);
    }

    fn on_sibling_status(&self, envelope: &CommandEnvelope) {
        self.record_notification("on_sibling_status", envelope);
    }
}
