//! Coordination client: inbound routing, outbound queue and lifecycle
//!
//! Two threads per client: the transport's I/O thread runs
//! [`ClientCore::handle_inbound`] for every frame, and one consumer thread
//! drains the outbound queue. The state manager is the only state shared
//! between them besides the queue itself.

use super::outbound::{OutboundEnvelope, OutboundWorker, Retirement};
use crate::agent::{AgentFactory, AgentRecord, CodeRegistryFactory, NodeIdentity};
use crate::config::CoordinatorConfig;
use crate::dispatch::{CoordinationCallback, DispatchOutcome, Dispatcher, InboundCommand};
use crate::error::{
    panic_message, CoordinationError, CoordinationResult, HandlerError, StateError,
};
use crate::filter::{should_process, Direction};
use crate::observability::{CoordinationMetrics, MetricsSnapshot};
use crate::protocol::{
    CommandEnvelope, CommandResponse, MetricsSample, TaskInitRequest, TerminateRequest,
};
use crate::state::StateManager;
use crate::transport::{InboundCallback, QosLevel, Transport};
use crate::{inbound_span, lifecycle_span};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything the inbound thread needs, shared with the client handle
struct ClientCore {
    state: Arc<StateManager>,
    dispatcher: Dispatcher,
    factory: Arc<dyn AgentFactory>,
    metrics: Arc<CoordinationMetrics>,
    queue_tx: Sender<OutboundEnvelope>,
    coordination_topic: String,
    max_attempts: u32,
}

impl ClientCore {
    fn handle_inbound(&self, topic: &str, payload: &[u8]) {
        self.metrics.frame_received();

        let envelope = match CommandEnvelope::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.decode_failed();
                error!(topic = %topic, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let span = inbound_span!(
            command_id = %envelope.command_id,
            command_type = %envelope.command_type,
            context_id = %envelope.context_id()
        );
        let _guard = span.enter();

        let kind = envelope.kind();
        if !should_process(
            self.state.as_ref(),
            &kind,
            envelope.context_id(),
            envelope.source_agent_id(),
            Direction::inbound(&kind),
        ) {
            self.metrics.inbound_filtered();
            return;
        }

        let command = match InboundCommand::decode(envelope) {
            Ok(command) => command,
            Err(e) => {
                self.metrics.decode_failed();
                error!(error = %e, "Dropping frame with unexpected payload shape");
                return;
            }
        };

        let started = Instant::now();
        match &command {
            InboundCommand::TaskInit(request) => self.handle_task_init(&command, request),
            InboundCommand::Terminate(request) => self.handle_terminate(&command, request),
            _ => {
                let agents = self.local_agents(command.context_id());
                let outcome = self.dispatcher.invoke(&command, &agents);
                if let Some(responses) = self.responses_of(outcome) {
                    self.enqueue_responses(responses, None);
                }
            }
        }
        self.metrics.command_dispatched(started.elapsed());
    }

    fn handle_task_init(&self, command: &InboundCommand, request: &TaskInitRequest) {
        let context_id = request.context.id();
        let node = NodeIdentity {
            cluster_id: self.state.get_cluster_id(),
            node_id: self.state.get_node_id(),
        };

        let created = catch_unwind(AssertUnwindSafe(|| {
            self.factory.create_agents(request, &node)
        }));
        let outcome = match created {
            Ok(Ok(records)) => Ok(records),
            Ok(Err(source)) => Err(HandlerError::Factory {
                context_id: context_id.to_string(),
                source,
            }),
            Err(payload) => Err(HandlerError::FactoryPanicked {
                context_id: context_id.to_string(),
                message: panic_message(payload.as_ref()),
            }),
        };
        let records = match outcome {
            Ok(records) => records,
            Err(failure) => {
                self.metrics.handler_failed();
                error!(error = %failure, "Handler error");
                return;
            }
        };

        let local: Vec<AgentRecord> = records.iter().filter(|r| r.is_local).cloned().collect();
        if local.is_empty() {
            debug!(context_id = %context_id, "No agents of this task are hosted here");
            return;
        }

        if let Err(e) = self.state.init_task(&request.context, &records) {
            self.record_state_error(&e);
            return;
        }
        for record in &local {
            self.state.add_local_agent(&record.agent_instance_id);
        }

        let outcome = self.dispatcher.invoke(command, &local);
        let Some(responses) = self.responses_of(outcome) else {
            for record in &local {
                self.state.remove_local_agent(&record.agent_instance_id);
            }
            if let Err(e) = self.state.discard_task(context_id) {
                self.record_state_error(&e);
            }
            return;
        };

        if let Err(e) = self.state.mark_active(context_id) {
            self.record_state_error(&e);
            return;
        }
        info!(
            context_id = %context_id,
            agents = local.len(),
            "Task initialized"
        );
        self.enqueue_responses(responses, None);
    }

    fn handle_terminate(&self, command: &InboundCommand, request: &TerminateRequest) {
        let context_id = request.context.id();
        if let Err(e) = self.state.mark_terminating(context_id) {
            self.record_state_error(&e);
            return;
        }

        let local = self.local_agents(context_id);
        let outcome = self.dispatcher.invoke(command, &local);

        if let Err(e) = self.state.terminate_task(context_id) {
            self.record_state_error(&e);
        }

        let agent_ids: Vec<String> = local.into_iter().map(|r| r.agent_instance_id).collect();
        match self.responses_of(outcome) {
            Some(responses) if !responses.is_empty() => {
                let retirement = Retirement::new(agent_ids, responses.len());
                self.enqueue_responses(responses, Some(retirement));
            }
            _ => {
                for agent_id in &agent_ids {
                    self.state.remove_local_agent(agent_id);
                }
            }
        }
        info!(
            context_id = %context_id,
            reason = request.reason.as_deref().unwrap_or("-"),
            "Task terminated"
        );
    }

    /// Responses of a hook that returned; `None` when it failed
    fn responses_of(&self, outcome: DispatchOutcome) -> Option<Vec<CommandResponse>> {
        match outcome {
            DispatchOutcome::Responded(responses) => Some(responses),
            DispatchOutcome::Ignored => Some(Vec::new()),
            DispatchOutcome::Failed(_) => {
                self.metrics.handler_failed();
                None
            }
        }
    }

    fn local_agents(&self, context_id: &str) -> Vec<AgentRecord> {
        self.state
            .agents_for_context(context_id)
            .into_iter()
            .filter(|record| record.is_local)
            .collect()
    }

    fn enqueue_responses(
        &self,
        responses: Vec<CommandResponse>,
        retirement: Option<Arc<Retirement>>,
    ) {
        for response in responses {
            self.push(CommandEnvelope::from(response), retirement.clone());
        }
    }

    fn push(&self, envelope: CommandEnvelope, retirement: Option<Arc<Retirement>>) {
        let outbound = OutboundEnvelope::new(envelope, &self.coordination_topic, self.max_attempts)
            .with_retirement(retirement);
        let command_id = outbound.command_id.clone();

        // Unbounded; only fails once every receiver is gone
        if let Err(e) = self.queue_tx.send(outbound) {
            warn!(command_id = %command_id, "Outbound queue closed, message discarded");
            if let Some(retirement) = &e.0.retirement {
                retirement.release(&self.state);
            }
            return;
        }
        self.metrics.response_enqueued();
    }

    fn record_state_error(&self, e: &StateError) {
        self.metrics.state_error();
        error!(error = %e, "State manager rejected operation");
    }
}

/// Handles owned by a running client
struct Running {
    stop_tx: Sender<()>,
    worker: JoinHandle<()>,
}

/// One coordination client per process and cluster topic
///
/// Built with [`CoordinationClient::builder`]. Nothing is connected until
/// [`start`](Self::start) is called.
pub struct CoordinationClient {
    core: Arc<ClientCore>,
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    queue_rx: Receiver<OutboundEnvelope>,
    running: Mutex<Option<Running>>,
}

impl CoordinationClient {
    pub fn builder(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        callback: Arc<dyn CoordinationCallback>,
    ) -> CoordinationClientBuilder {
        CoordinationClientBuilder {
            config,
            transport,
            callback,
            factory: None,
            state: None,
        }
    }

    /// Connect, subscribe to the coordination topic and start the consumer thread
    pub fn start(&self) -> CoordinationResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("Coordination client already started");
            return Ok(());
        }

        let span = lifecycle_span!(event = "start", component = self.core.dispatcher.component());
        let _guard = span.enter();

        let core = Arc::clone(&self.core);
        let callback: InboundCallback = Arc::new(move |topic: &str, payload: &[u8]| {
            let handled = catch_unwind(AssertUnwindSafe(|| core.handle_inbound(topic, payload)));
            if let Err(panic) = handled {
                error!(
                    topic = %topic,
                    message = %panic_message(panic.as_ref()),
                    "Inbound processing panicked, frame dropped"
                );
            }
        });
        self.transport.on_message(callback);

        let endpoint = self.config.endpoint()?;
        let credentials = self.config.credentials();
        self.transport.connect(&endpoint, credentials.as_ref())?;
        info!(host = %endpoint.host, port = endpoint.port, "Transport connected");

        if let Err(e) = self
            .transport
            .subscribe(&self.core.coordination_topic, self.config.qos())
        {
            self.disconnect_quietly();
            return Err(e.into());
        }

        let (stop_tx, stop_rx) = bounded(1);
        let worker = OutboundWorker {
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.core.state),
            metrics: Arc::clone(&self.core.metrics),
            queue_tx: self.core.queue_tx.clone(),
            queue_rx: self.queue_rx.clone(),
            stop_rx,
            qos: self.config.qos(),
            retry_backoff: self.config.outbound.retry_backoff(),
            poll_interval: self.config.outbound.poll_interval(),
        };
        let worker = match thread::Builder::new()
            .name("coord-outbound".to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                self.disconnect_quietly();
                return Err(CoordinationError::ThreadSpawn {
                    name: "coord-outbound",
                    source,
                });
            }
        };

        *running = Some(Running { stop_tx, worker });
        info!(
            topic = %self.core.coordination_topic,
            node_id = %self.core.state.get_node_id(),
            "Coordination client started"
        );
        Ok(())
    }

    /// Hard stop: pending outbound messages are discarded, not flushed
    pub fn stop(&self) -> CoordinationResult<()> {
        let Some(Running { stop_tx, worker }) = self.running.lock().take() else {
            return Ok(());
        };

        let span = lifecycle_span!(event = "stop", component = self.core.dispatcher.component());
        let _guard = span.enter();

        drop(stop_tx);
        if worker.join().is_err() {
            error!("Outbound consumer thread panicked");
        }

        let result = self.transport.disconnect();

        let mut discarded = 0usize;
        while let Ok(envelope) = self.queue_rx.try_recv() {
            if let Some(retirement) = &envelope.retirement {
                retirement.release(&self.core.state);
            }
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "Discarded pending outbound messages on stop");
        }

        info!("Coordination client stopped");
        result.map_err(Into::into)
    }

    /// Non-blocking push onto the outbound queue
    ///
    /// The outbound rule is applied when the consumer sends the message, not
    /// here.
    pub fn enqueue(&self, message: impl Into<CommandEnvelope>) {
        self.core.push(message.into(), None);
    }

    /// Publish metric samples on the metrics topic, one frame per sample
    ///
    /// Best effort at QoS 0 with no retry. Returns how many samples were handed
    /// to the transport.
    pub fn send_metrics(&self, samples: &[MetricsSample]) -> usize {
        let topic = self.config.metrics_topic();
        let mut sent = 0;

        for sample in samples {
            let payload = match serde_json::to_vec(sample) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(metrics_code = %sample.metrics_code, error = %e, "Metric sample not serializable");
                    continue;
                }
            };
            match self
                .transport
                .publish(&topic, &payload, QosLevel::AtMostOnce, 1)
            {
                Ok(()) => sent += 1,
                Err(e) => debug!(metrics_code = %sample.metrics_code, error = %e, "Metric sample not sent"),
            }
        }

        self.core.metrics.metric_samples_published(sent);
        debug!(sent, total = samples.len(), topic = %topic, "Sent metric samples");
        sent
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.core.state
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn coordination_topic(&self) -> &str {
        &self.core.coordination_topic
    }

    /// Outbound messages waiting for the consumer
    pub fn pending_outbound(&self) -> usize {
        self.queue_rx.len()
    }

    fn disconnect_quietly(&self) {
        if let Err(e) = self.transport.disconnect() {
            warn!(error = %e, "Disconnect after failed start also failed");
        }
    }
}

impl Drop for CoordinationClient {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Error stopping coordination client on drop");
        }
    }
}

impl std::fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("topic", &self.core.coordination_topic)
            .field("component", &self.core.dispatcher.component())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Builder for [`CoordinationClient`]
pub struct CoordinationClientBuilder {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    callback: Arc<dyn CoordinationCallback>,
    factory: Option<Arc<dyn AgentFactory>>,
    state: Option<Arc<StateManager>>,
}

impl CoordinationClientBuilder {
    /// Replace the default factory built from `[agents] codes`
    pub fn agent_factory(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Share an existing state manager; its node and cluster ids are overwritten
    pub fn state_manager(mut self, state: Arc<StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn build(self) -> CoordinationResult<CoordinationClient> {
        self.config.validate()?;

        let state = match self.state {
            Some(state) => {
                state.set_cluster_id(self.config.node.cluster_id.clone());
                state.set_node_id(self.config.node.node_id.clone());
                state
            }
            None => Arc::new(StateManager::new(
                self.config.node.cluster_id.clone(),
                self.config.node.node_id.clone(),
            )),
        };
        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(CodeRegistryFactory::new(self.config.agents.codes.clone()))
        });

        let (queue_tx, queue_rx) = unbounded();
        let core = ClientCore {
            state,
            dispatcher: Dispatcher::new(self.callback),
            factory,
            metrics: Arc::new(CoordinationMetrics::new()),
            queue_tx,
            coordination_topic: self.config.coordination_topic(),
            max_attempts: self.config.outbound.max_attempts,
        };

        Ok(CoordinationClient {
            core: Arc::new(core),
            config: self.config,
            transport: self.transport,
            queue_rx,
            running: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentDefinition, CommandKind, Context};
    use crate::testing::mocks::{MockTransport, RecordingCallback};
    use serde_json::json;
    use std::time::Duration;

    fn client(transport: Arc<MockTransport>, callback: Arc<RecordingCallback>) -> CoordinationClient {
        CoordinationClient::builder(CoordinatorConfig::test_config(), transport, callback)
            .build()
            .unwrap()
    }

    fn init_frame(context_id: &str) -> Vec<u8> {
        let definition = AgentDefinition {
            agent_code: "TWINS_SIMULATION_AGENT".to_string(),
            agent_type: None,
            agent_name: None,
            agent_configuration_url: None,
        };
        CommandEnvelope::new("init-1", &CommandKind::TaskInitRequest, Context::new(context_id))
            .with_field("agent_list", json!([definition]))
            .to_vec()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = CoordinatorConfig::test_config();
        config.outbound.max_attempts = 0;
        let result = CoordinationClient::builder(
            config,
            Arc::new(MockTransport::new()),
            Arc::new(RecordingCallback::new()),
        )
        .build();
        assert!(matches!(result, Err(CoordinationError::Config(_))));
    }

    #[test]
    fn test_start_subscribes_and_stop_disconnects() {
        let transport = Arc::new(MockTransport::new());
        let client = client(transport.clone(), Arc::new(RecordingCallback::new()));

        client.start().unwrap();
        assert!(client.is_running());
        assert_eq!(
            transport.subscriptions(),
            vec!["/hydros/commands/coordination/cluster-a".to_string()]
        );

        client.stop().unwrap();
        assert!(!client.is_running());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_init_without_hosted_agents_is_ignored() {
        let transport = Arc::new(MockTransport::new());
        let callback = Arc::new(RecordingCallback::new());
        let config = CoordinatorConfig::test_config();
        let client = CoordinationClient::builder(config, transport.clone(), callback.clone())
            .agent_factory(Arc::new(CodeRegistryFactory::default()))
            .build()
            .unwrap();

        client.core.handle_inbound("/t", &init_frame("C1"));
        assert_eq!(client.state().task_state("C1"), None);
        assert_eq!(callback.calls("on_task_init"), 0);
    }

    #[test]
    fn test_failed_init_rolls_back() {
        let transport = Arc::new(MockTransport::new());
        let callback = Arc::new(RecordingCallback::new());
        callback.fail_on("on_task_init");
        let client = client(transport, callback.clone());

        client.core.handle_inbound("/t", &init_frame("C1"));
        assert_eq!(callback.calls("on_task_init"), 1);
        assert_eq!(client.state().task_state("C1"), None);
        assert_eq!(client.state().local_agent_count(), 0);
        assert_eq!(client.metrics().inbound.handler_failures, 1);
    }

    struct ExplodingFactory;

    impl AgentFactory for ExplodingFactory {
        fn create_agents(
            &self,
            _request: &TaskInitRequest,
            _node: &NodeIdentity,
        ) -> Result<Vec<AgentRecord>, crate::error::BoxError> {
            panic!("factory bug")
        }
    }

    #[test]
    fn test_factory_panic_is_contained() {
        let callback = Arc::new(RecordingCallback::new());
        let client = CoordinationClient::builder(
            CoordinatorConfig::test_config(),
            Arc::new(MockTransport::new()),
            callback.clone(),
        )
        .agent_factory(Arc::new(ExplodingFactory))
        .build()
        .unwrap();

        client.core.handle_inbound("/t", &init_frame("C1"));

        assert_eq!(callback.calls("on_task_init"), 0);
        assert_eq!(client.state().task_state("C1"), None);
        assert_eq!(client.metrics().inbound.handler_failures, 1);
    }

    #[test]
    fn test_duplicate_init_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let callback = Arc::new(RecordingCallback::new());
        let client = client(transport, callback.clone());

        client.core.handle_inbound("/t", &init_frame("C1"));
        client.core.handle_inbound("/t", &init_frame("C1"));

        assert_eq!(callback.calls("on_task_init"), 1);
        assert_eq!(client.state().local_agent_count(), 1);
        assert_eq!(client.metrics().inbound.state_errors, 1);
    }

    #[test]
    fn test_garbage_frame_counts_decode_failure() {
        let client = client(Arc::new(MockTransport::new()), Arc::new(RecordingCallback::new()));
        client.core.handle_inbound("/t", b"not json");
        assert_eq!(client.metrics().inbound.decode_failures, 1);
    }

    #[test]
    fn test_stop_discards_pending_messages() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_publishes(u32::MAX);
        let mut config = CoordinatorConfig::test_config();
        config.outbound.retry_backoff_ms = 60_000;
        let client = CoordinationClient::builder(
            config,
            transport.clone(),
            Arc::new(RecordingCallback::new()),
        )
        .build()
        .unwrap();
        client.state().add_local_agent("A1");

        for id in ["r1", "r2"] {
            client.enqueue(
                CommandEnvelope::new(id, &CommandKind::TickResponse, Context::new("C1"))
                    .with_field("source_agent_instance", json!({"agent_id": "A1"})),
            );
        }
        client.start().unwrap();

        // First message fails and the consumer parks in its backoff wait
        assert!(transport.wait_for_publish_attempts(1, Duration::from_secs(5)));
        client.stop().unwrap();

        assert_eq!(client.pending_outbound(), 0);
        assert_eq!(transport.publish_attempts(), 1);
        assert!(transport.published().is_empty());
    }

    #[test]
    fn test_send_metrics_one_frame_per_sample() {
        let transport = Arc::new(MockTransport::connected());
        let client = client(transport.clone(), Arc::new(RecordingCallback::new()));
        let sample = MetricsSample {
            source_id: "TWINS_SIMULATION_AGENT".to_string(),
            job_instance_id: "C1".to_string(),
            object_id: 42,
            object_name: "gate-1".to_string(),
            step_index: 3,
            source_timestamp_ms: 1_700_000_000_000,
            metrics_code: "water_level".to_string(),
            value: 12.5,
        };

        assert_eq!(client.send_metrics(&[sample.clone(), sample]), 2);
        let published = transport.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "/hydros/commands/coordination/cluster-a/metrics");
        assert_eq!(published[0].qos, QosLevel::AtMostOnce);
        assert_eq!(client.metrics().outbound.metric_samples, 2);
    }
}
