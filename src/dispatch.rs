//! Command dispatch to the business callback
//!
//! Inbound frames are decoded into [`InboundCommand`], a closed sum over the
//! command kinds this process reacts to, and routed to one hook of
//! [`CoordinationCallback`] by an exhaustive match. Failures and panics raised
//! by the callback are captured at this boundary and returned as
//! [`HandlerError`]; they never reach the transport thread.

use crate::agent::AgentRecord;
use crate::error::{panic_message, BoxError, DecodeError, HandlerError};
use crate::protocol::{
    CommandEnvelope, CommandKind, CommandResponse, TaskInitRequest, TerminateRequest,
    TickRequest, TimeSeriesCalcRequest, TimeSeriesUpdateRequest,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// What a hook hands back: zero or more responses to enqueue
pub type HandlerResult = Result<Vec<CommandResponse>, BoxError>;

/// Business logic seam, one method per lifecycle hook
///
/// Hooks run on the transport I/O thread and must return quickly. Each request
/// hook receives the local agent records registered for the request's context.
pub trait CoordinationCallback: Send + Sync {
    /// Name used in logs
    fn component(&self) -> &str;

    fn on_task_init(&self, request: &TaskInitRequest, agents: &[AgentRecord]) -> HandlerResult;

    fn on_tick(&self, request: &TickRequest, agents: &[AgentRecord]) -> HandlerResult;

    fn on_terminate(&self, request: &TerminateRequest, agents: &[AgentRecord]) -> HandlerResult;

    fn on_time_series_update(
        &self,
        request: &TimeSeriesUpdateRequest,
        _agents: &[AgentRecord],
    ) -> HandlerResult {
        debug!(
            component = self.component(),
            command_id = %request.command_id,
            "Time series update ignored"
        );
        Ok(Vec::new())
    }

    fn on_time_series_calc(
        &self,
        request: &TimeSeriesCalcRequest,
        _agents: &[AgentRecord],
    ) -> HandlerResult {
        debug!(
            component = self.component(),
            command_id = %request.command_id,
            "Time series calculation ignored"
        );
        Ok(Vec::new())
    }

    /// A remote sibling agent reported its creation for an active context
    fn on_sibling_created(&self, envelope: &CommandEnvelope) {
        info!(
            component = self.component(),
            context_id = %envelope.context_id(),
            sibling = envelope.source_agent_id().unwrap_or("-"),
            "Sibling agent created"
        );
    }

    /// A remote sibling agent reported a status change
    fn on_sibling_status(&self, envelope: &CommandEnvelope) {
        debug!(
            component = self.component(),
            context_id = %envelope.context_id(),
            sibling = envelope.source_agent_id().unwrap_or("-"),
            "Sibling agent status"
        );
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone)]
pub enum InboundCommand {
    TaskInit(TaskInitRequest),
    Tick(TickRequest),
    Terminate(TerminateRequest),
    TimeSeriesUpdate(TimeSeriesUpdateRequest),
    TimeSeriesCalc(TimeSeriesCalcRequest),
    SiblingCreated(CommandEnvelope),
    SiblingStatus(CommandEnvelope),
    /// Known kind this process has no hook for (peer responses)
    Unhandled(CommandEnvelope),
    Unknown(CommandEnvelope),
}

impl InboundCommand {
    pub fn decode(envelope: CommandEnvelope) -> Result<Self, DecodeError> {
        let command = match envelope.kind() {
            CommandKind::TaskInitRequest => InboundCommand::TaskInit(envelope.decode_as()?),
            CommandKind::TickRequest => InboundCommand::Tick(envelope.decode_as()?),
            CommandKind::TerminateRequest => InboundCommand::Terminate(envelope.decode_as()?),
            CommandKind::TimeSeriesUpdateRequest => {
                InboundCommand::TimeSeriesUpdate(envelope.decode_as()?)
            }
            CommandKind::TimeSeriesCalcRequest => {
                InboundCommand::TimeSeriesCalc(envelope.decode_as()?)
            }
            CommandKind::TaskInitResponse => InboundCommand::SiblingCreated(envelope),
            CommandKind::AgentStatusReport => InboundCommand::SiblingStatus(envelope),
            CommandKind::TickResponse
            | CommandKind::TerminateResponse
            | CommandKind::TimeSeriesUpdateResponse
            | CommandKind::TimeSeriesCalcResponse => InboundCommand::Unhandled(envelope),
            CommandKind::Unknown(_) => InboundCommand::Unknown(envelope),
        };
        Ok(command)
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            InboundCommand::TaskInit(_) => CommandKind::TaskInitRequest,
            InboundCommand::Tick(_) => CommandKind::TickRequest,
            InboundCommand::Terminate(_) => CommandKind::TerminateRequest,
            InboundCommand::TimeSeriesUpdate(_) => CommandKind::TimeSeriesUpdateRequest,
            InboundCommand::TimeSeriesCalc(_) => CommandKind::TimeSeriesCalcRequest,
            InboundCommand::SiblingCreated(envelope)
            | InboundCommand::SiblingStatus(envelope)
            | InboundCommand::Unhandled(envelope)
            | InboundCommand::Unknown(envelope) => envelope.kind(),
        }
    }

    pub fn command_id(&self) -> &str {
        match self {
            InboundCommand::TaskInit(r) => &r.command_id,
            InboundCommand::Tick(r) => &r.command_id,
            InboundCommand::Terminate(r) => &r.command_id,
            InboundCommand::TimeSeriesUpdate(r) => &r.command_id,
            InboundCommand::TimeSeriesCalc(r) => &r.command_id,
            InboundCommand::SiblingCreated(e)
            | InboundCommand::SiblingStatus(e)
            | InboundCommand::Unhandled(e)
            | InboundCommand::Unknown(e) => &e.command_id,
        }
    }

    pub fn context_id(&self) -> &str {
        match self {
            InboundCommand::TaskInit(r) => r.context.id(),
            InboundCommand::Tick(r) => r.context.id(),
            InboundCommand::Terminate(r) => r.context.id(),
            InboundCommand::TimeSeriesUpdate(r) => r.context.id(),
            InboundCommand::TimeSeriesCalc(r) => r.context.id(),
            InboundCommand::SiblingCreated(e)
            | InboundCommand::SiblingStatus(e)
            | InboundCommand::Unhandled(e)
            | InboundCommand::Unknown(e) => e.context_id(),
        }
    }
}

/// Result of routing one command to the callback
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Hook returned; the responses may be empty
    Responded(Vec<CommandResponse>),
    /// Hook failed or panicked; already logged
    Failed(HandlerError),
    /// No hook for this command
    Ignored,
}

/// Routes decoded commands to the registered callback
///
/// The callback is fixed at construction and cannot change once the client
/// has started.
#[derive(Clone)]
pub struct Dispatcher {
    callback: Arc<dyn CoordinationCallback>,
}

impl Dispatcher {
    pub fn new(callback: Arc<dyn CoordinationCallback>) -> Self {
        Self { callback }
    }

    pub fn component(&self) -> &str {
        self.callback.component()
    }

    /// Decode and invoke in one step
    pub fn dispatch(
        &self,
        envelope: CommandEnvelope,
        agents: &[AgentRecord],
    ) -> Result<DispatchOutcome, DecodeError> {
        let command = InboundCommand::decode(envelope)?;
        Ok(self.invoke(&command, agents))
    }

    /// Run the matching hook, converting errors and panics into [`HandlerError`]
    pub fn invoke(&self, command: &InboundCommand, agents: &[AgentRecord]) -> DispatchOutcome {
        let callback = self.callback.as_ref();
        let result = catch_unwind(AssertUnwindSafe(|| match command {
            InboundCommand::TaskInit(request) => Some(callback.on_task_init(request, agents)),
            InboundCommand::Tick(request) => Some(callback.on_tick(request, agents)),
            InboundCommand::Terminate(request) => Some(callback.on_terminate(request, agents)),
            InboundCommand::TimeSeriesUpdate(request) => {
                Some(callback.on_time_series_update(request, agents))
            }
            InboundCommand::TimeSeriesCalc(request) => {
                Some(callback.on_time_series_calc(request, agents))
            }
            InboundCommand::SiblingCreated(envelope) => {
                callback.on_sibling_created(envelope);
                None
            }
            InboundCommand::SiblingStatus(envelope) => {
                callback.on_sibling_status(envelope);
                None
            }
            InboundCommand::Unhandled(envelope) => {
                debug!(
                    command_type = %envelope.command_type,
                    command_id = %envelope.command_id,
                    "No handler for command"
                );
                None
            }
            InboundCommand::Unknown(envelope) => {
                info!(
                    command_type = %envelope.command_type,
                    command_id = %envelope.command_id,
                    "Dropping unknown command type"
                );
                None
            }
        }));

        let failure = match result {
            Ok(Some(Ok(responses))) => return DispatchOutcome::Responded(responses),
            Ok(None) => return DispatchOutcome::Ignored,
            Ok(Some(Err(source))) => HandlerError::Failed {
                command_type: command.kind().to_string(),
                command_id: command.command_id().to_string(),
                context_id: command.context_id().to_string(),
                source,
            },
            Err(payload) => HandlerError::Panicked {
                command_type: command.kind().to_string(),
                command_id: command.command_id().to_string(),
                context_id: command.context_id().to_string(),
                message: panic_message(payload.as_ref()),
            },
        };

        error!(component = self.component(), error = %failure, "Handler error");
        DispatchOutcome::Failed(failure)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("component", &self.component())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Context;
    use serde_json::json;

    struct Scripted;

    impl CoordinationCallback for Scripted {
        fn component(&self) -> &str {
            "scripted"
        }

        fn on_task_init(&self, _: &TaskInitRequest, _: &[AgentRecord]) -> HandlerResult {
            Ok(Vec::new())
        }

        fn on_tick(&self, request: &TickRequest, agents: &[AgentRecord]) -> HandlerResult {
            match request.tick_id {
                0 => Err("tick zero is invalid".into()),
                1 => panic!("solver exploded"),
                _ => Ok(agents
                    .iter()
                    .map(|agent| {
                        CommandResponse::new(
                            CommandKind::TickResponse,
                            &request.command_id,
                            &request.context,
                            agent,
                        )
                    })
                    .collect()),
            }
        }

        fn on_terminate(&self, _: &TerminateRequest, _: &[AgentRecord]) -> HandlerResult {
            Ok(Vec::new())
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(Scripted))
    }

    fn tick(tick_id: u64) -> CommandEnvelope {
        CommandEnvelope::new("cmd-1", &CommandKind::TickRequest, Context::new("C1"))
            .with_field("tick_id", json!(tick_id))
            .with_field("delta_time", json!(1.0))
    }

    fn agents() -> Vec<AgentRecord> {
        vec![AgentRecord::new("A1", "X", "cluster-a", "node-1", "node-1")]
    }

    #[test]
    fn test_tick_routed_to_hook() {
        let outcome = dispatcher().dispatch(tick(5), &agents()).unwrap();
        match outcome {
            DispatchOutcome::Responded(responses) => {
                assert_eq!(responses.len(), 1);
                assert_eq!(responses[0].command_id, "cmd-1");
                assert_eq!(responses[0].source_agent_id(), "A1");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_handler_error_is_captured() {
        let outcome = dispatcher().dispatch(tick(0), &agents()).unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(HandlerError::Failed { ref command_id, .. }) if command_id == "cmd-1"
        ));
    }

    #[test]
    fn test_handler_panic_is_captured() {
        let outcome = dispatcher().dispatch(tick(1), &agents()).unwrap();
        match outcome {
            DispatchOutcome::Failed(HandlerError::Panicked { message, .. }) => {
                assert!(message.contains("solver exploded"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        let envelope =
            CommandEnvelope::new("cmd-2", &CommandKind::parse("device_fault_inject"), Context::new("C1"));
        let outcome = dispatcher().dispatch(envelope, &[]).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ignored));
    }

    #[test]
    fn test_schema_mismatch_is_decode_error() {
        let envelope = CommandEnvelope::new("cmd-3", &CommandKind::TickRequest, Context::new("C1"));
        assert!(matches!(
            dispatcher().dispatch(envelope, &[]),
            Err(DecodeError::Schema { .. })
        ));
    }

    #[test]
    fn test_default_hooks_return_no_responses() {
        let envelope = CommandEnvelope::new(
            "cmd-4",
            &CommandKind::TimeSeriesUpdateRequest,
            Context::new("C1"),
        );
        let outcome = dispatcher().dispatch(envelope, &[]).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Responded(r) if r.is_empty()));
    }

    #[test]
    fn test_sibling_frames_decode_without_schema() {
        let envelope = CommandEnvelope::new("r1", &CommandKind::TaskInitResponse, Context::new("C1"));
        let command = InboundCommand::decode(envelope).unwrap();
        assert!(matches!(command, InboundCommand::SiblingCreated(_)));
        assert_eq!(command.context_id(), "C1");
        assert!(matches!(
            dispatcher().invoke(&command, &[]),
            DispatchOutcome::Ignored
        ));
    }
}
