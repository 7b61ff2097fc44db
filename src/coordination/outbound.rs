//! Outbound retry queue
//!
//! Responses are pushed onto an unbounded crossbeam channel by the inbound
//! thread and drained by one consumer thread. The consumer re-checks the
//! outbound filter at send time, publishes, and on failure re-enqueues the
//! message at the tail after a fixed backoff until `max_attempts` is reached.

use crate::error::TransportError;
use crate::filter::{should_process, Direction};
use crate::observability::CoordinationMetrics;
use crate::outbound_span;
use crate::protocol::CommandEnvelope;
use crate::state::StateManager;
use crate::transport::{QosLevel, Transport};
use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Local agents to retire once every message of a batch has been disposed of
///
/// Terminate responses still have to pass the outbound filter, so the agents
/// that produced them stay in the local set until the last one is published
/// or dropped.
#[derive(Debug)]
pub struct Retirement {
    agent_ids: Vec<String>,
    pending: AtomicUsize,
}

impl Retirement {
    pub fn new(agent_ids: Vec<String>, messages: usize) -> Arc<Self> {
        Arc::new(Self {
            agent_ids,
            pending: AtomicUsize::new(messages),
        })
    }

    /// Mark one message of the batch as disposed of; the last one retires the agents
    pub(crate) fn release(&self, state: &StateManager) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        for agent_id in &self.agent_ids {
            state.remove_local_agent(agent_id);
        }
        debug!(agents = self.agent_ids.len(), "Retired local agents");
    }
}

/// One queued outbound message; never persisted
#[derive(Debug)]
pub struct OutboundEnvelope {
    pub command_id: String,
    pub command_type: String,
    pub target_topic: String,
    pub payload: CommandEnvelope,
    /// Failed publish attempts so far
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub retirement: Option<Arc<Retirement>>,
}

impl OutboundEnvelope {
    pub fn new(payload: CommandEnvelope, target_topic: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            command_id: payload.command_id.clone(),
            command_type: payload.command_type.clone(),
            target_topic: target_topic.into(),
            payload,
            attempt_count: 0,
            max_attempts,
            retirement: None,
        }
    }

    pub fn with_retirement(mut self, retirement: Option<Arc<Retirement>>) -> Self {
        self.retirement = retirement;
        self
    }
}

/// Why the consumer finished with a message
#[derive(Debug, PartialEq, Eq)]
enum Disposal {
    Published,
    Filtered,
    Dropped,
    Requeued,
    Stopped,
}

/// Consumer side of the outbound queue, run on its own thread
pub(crate) struct OutboundWorker {
    pub transport: Arc<dyn Transport>,
    pub state: Arc<StateManager>,
    pub metrics: Arc<CoordinationMetrics>,
    pub queue_tx: Sender<OutboundEnvelope>,
    pub queue_rx: Receiver<OutboundEnvelope>,
    pub stop_rx: Receiver<()>,
    pub qos: QosLevel,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
}

impl OutboundWorker {
    pub fn run(self) {
        info!("Outbound queue consumer started");

        loop {
            if stop_requested(&self.stop_rx) {
                break;
            }

            select! {
                recv(self.stop_rx) -> _ => break,
                recv(self.queue_rx) -> message => match message {
                    Ok(envelope) => {
                        if self.process(envelope) == Disposal::Stopped {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                default(self.poll_interval) => {}
            }
        }

        info!("Outbound queue consumer stopped");
    }

    fn process(&self, envelope: OutboundEnvelope) -> Disposal {
        let span = outbound_span!(
            command_id = %envelope.command_id,
            command_type = %envelope.command_type,
            attempt = envelope.attempt_count + 1
        );
        let _guard = span.enter();

        // Locality may have changed since enqueue
        if !should_process(
            self.state.as_ref(),
            &envelope.payload.kind(),
            envelope.payload.context_id(),
            envelope.payload.source_agent_id(),
            Direction::OutboundResponseOrReport,
        ) {
            self.metrics.outbound_filtered();
            self.finish(&envelope);
            return Disposal::Filtered;
        }

        let bytes = match envelope.payload.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    command_id = %envelope.command_id,
                    reason = %e,
                    "Dropping outbound message that cannot be serialized"
                );
                self.metrics.message_dropped();
                self.finish(&envelope);
                return Disposal::Dropped;
            }
        };

        match self.transport.publish(
            &envelope.target_topic,
            &bytes,
            self.qos,
            envelope.attempt_count + 1,
        ) {
            Ok(()) => {
                debug!(topic = %envelope.target_topic, "Outbound message published");
                self.metrics.message_published();
                self.finish(&envelope);
                Disposal::Published
            }
            Err(e) => self.handle_failure(envelope, e),
        }
    }

    fn handle_failure(&self, mut envelope: OutboundEnvelope, reason: TransportError) -> Disposal {
        envelope.attempt_count += 1;

        if envelope.attempt_count >= envelope.max_attempts {
            error!(
                command_id = %envelope.command_id,
                command_type = %envelope.command_type,
                attempts = envelope.attempt_count,
                reason = %reason,
                "Dropping outbound message after final publish failure"
            );
            self.metrics.message_dropped();
            self.finish(&envelope);
            return Disposal::Dropped;
        }

        warn!(
            command_id = %envelope.command_id,
            attempt = envelope.attempt_count,
            max_attempts = envelope.max_attempts,
            reason = %reason,
            "Publish failed, retrying after backoff"
        );
        self.metrics.publish_retried();

        // Held by neither the queue nor the worker once stopped here
        if !interruptible_wait(&self.stop_rx, self.retry_backoff) {
            self.finish(&envelope);
            return Disposal::Stopped;
        }
        if let Err(e) = self.queue_tx.send(envelope) {
            self.finish(&e.0);
            return Disposal::Stopped;
        }
        Disposal::Requeued
    }

    fn finish(&self, envelope: &OutboundEnvelope) {
        if let Some(retirement) = &envelope.retirement {
            retirement.release(&self.state);
        }
    }
}

/// The stop channel carries no messages; it disconnects when the client stops
fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    matches!(stop_rx.try_recv(), Err(TryRecvError::Disconnected))
}

/// Wait for `delay` unless stop is signalled; false when interrupted
fn interruptible_wait(stop_rx: &Receiver<()>, delay: Duration) -> bool {
    !matches!(
        stop_rx.recv_timeout(delay),
        Err(RecvTimeoutError::Disconnected)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandKind, Context};
    use crate::testing::mocks::MockTransport;
    use crossbeam_channel::{bounded, unbounded};
    use serde_json::json;

    fn response_from(agent_id: &str, command_id: &str) -> OutboundEnvelope {
        let payload =
            CommandEnvelope::new(command_id, &CommandKind::TickResponse, Context::new("C1"))
                .with_field("source_agent_instance", json!({"agent_id": agent_id}));
        OutboundEnvelope::new(payload, "/t", 3)
    }

    fn worker(transport: Arc<MockTransport>) -> (OutboundWorker, Sender<()>) {
        let (queue_tx, queue_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let state = Arc::new(StateManager::new("cluster-a", "node-1"));
        state.add_local_agent("A1");
        let worker = OutboundWorker {
            transport,
            state,
            metrics: Arc::new(CoordinationMetrics::new()),
            queue_tx,
            queue_rx,
            stop_rx,
            qos: QosLevel::AtLeastOnce,
            retry_backoff: Duration::from_millis(1),
            poll_interval: Duration::from_millis(10),
        };
        (worker, stop_tx)
    }

    #[test]
    fn test_local_response_published() {
        let transport = Arc::new(MockTransport::connected());
        let (worker, _stop) = worker(transport.clone());

        assert_eq!(worker.process(response_from("A1", "r1")), Disposal::Published);
        assert_eq!(transport.published().len(), 1);
    }

    #[test]
    fn test_remote_response_filtered_at_send_time() {
        let transport = Arc::new(MockTransport::connected());
        let (worker, _stop) = worker(transport.clone());

        assert_eq!(worker.process(response_from("B7", "r1")), Disposal::Filtered);
        assert_eq!(transport.publish_attempts(), 0);
    }

    #[test]
    fn test_failure_requeues_until_exhausted() {
        let transport = Arc::new(MockTransport::connected());
        transport.fail_next_publishes(3);
        let (worker, _stop) = worker(transport.clone());

        assert_eq!(worker.process(response_from("A1", "r1")), Disposal::Requeued);
        let requeued = worker.queue_rx.try_recv().unwrap();
        assert_eq!(requeued.attempt_count, 1);

        assert_eq!(worker.process(requeued), Disposal::Requeued);
        let requeued = worker.queue_rx.try_recv().unwrap();
        assert_eq!(worker.process(requeued), Disposal::Dropped);
        assert!(worker.queue_rx.is_empty());
        assert_eq!(worker.metrics.snapshot().outbound.dropped, 1);
    }

    #[test]
    fn test_retirement_after_last_message() {
        let transport = Arc::new(MockTransport::connected());
        let (worker, _stop) = worker(transport.clone());
        let retirement = Retirement::new(vec!["A1".to_string()], 2);

        let first = response_from("A1", "r1").with_retirement(Some(retirement.clone()));
        let second = response_from("A1", "r2").with_retirement(Some(retirement));

        worker.process(first);
        assert!(worker.state.is_local_agent("A1"));
        assert_eq!(worker.process(second), Disposal::Published);
        assert!(!worker.state.is_local_agent("A1"));
    }

    #[test]
    fn test_stop_interrupts_backoff() {
        let transport = Arc::new(MockTransport::connected());
        transport.fail_next_publishes(1);
        let (mut worker, stop_tx) = worker(transport);
        worker.retry_backoff = Duration::from_secs(30);

        drop(stop_tx);
        assert_eq!(worker.process(response_from("A1", "r1")), Disposal::Stopped);
    }

    #[test]
    fn test_stop_during_backoff_releases_retirement() {
        let transport = Arc::new(MockTransport::connected());
        transport.fail_next_publishes(1);
        let (mut worker, stop_tx) = worker(transport);
        worker.retry_backoff = Duration::from_secs(30);
        let retirement = Retirement::new(vec!["A1".to_string()], 1);

        drop(stop_tx);
        let envelope = response_from("A1", "r1").with_retirement(Some(retirement));
        assert_eq!(worker.process(envelope), Disposal::Stopped);
        assert!(!worker.state.is_local_agent("A1"));
        assert!(worker.queue_rx.is_empty());
    }
}
