//! Relevance filter for coordination frames
//!
//! Several processes share one coordination topic, so most frames a process
//! sees are not for it. The filter is a pure decision over the command kind,
//! the direction of travel and two registry lookups. It holds no state and
//! re-queries the registry on every call.

use crate::protocol::{CommandKind, MessageClass};
use crate::state::StateManager;
use tracing::debug;

/// Read-only registry queries the filter depends on
pub trait RegistryView {
    fn is_context_active(&self, context_id: &str) -> bool;
    fn is_local_agent(&self, agent_id: &str) -> bool;
}

impl RegistryView for StateManager {
    fn is_context_active(&self, context_id: &str) -> bool {
        StateManager::is_context_active(self, context_id)
    }

    fn is_local_agent(&self, agent_id: &str) -> bool {
        StateManager::is_local_agent(self, agent_id)
    }
}

/// Direction of travel of a frame relative to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Coordinator -> agent
    InboundRequest,
    /// Sibling agent -> coordinator, observed on the shared topic
    InboundResponseOrReport,
    /// Local agent -> coordinator, leaving this process
    OutboundResponseOrReport,
}

impl Direction {
    /// Direction of a frame received from the topic
    pub fn inbound(kind: &CommandKind) -> Self {
        match kind.class() {
            MessageClass::Response | MessageClass::Report => Direction::InboundResponseOrReport,
            MessageClass::Request | MessageClass::Unknown => Direction::InboundRequest,
        }
    }
}

/// Why a frame was not processed; expected control flow, not an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRejection {
    /// Inbound frame for a context this process does not run
    InactiveContext,
    /// Outbound frame from an agent that is not (or no longer) local
    NonLocalSource,
    /// Inbound response or report echoing one of our own agents
    OwnEcho,
    /// Inbound response or report that is not a sibling notification
    NotSiblingNotification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(FilterRejection),
}

impl Verdict {
    pub fn is_accept(self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Decide whether a frame is relevant to this process
pub fn evaluate<R: RegistryView + ?Sized>(
    registry: &R,
    kind: &CommandKind,
    context_id: &str,
    source_agent_id: Option<&str>,
    direction: Direction,
) -> Verdict {
    // A task must be able to start before it exists in the registry
    if *kind == CommandKind::TaskInitRequest {
        return Verdict::Accept;
    }

    match direction {
        Direction::InboundRequest => {
            if registry.is_context_active(context_id) {
                Verdict::Accept
            } else {
                Verdict::Reject(FilterRejection::InactiveContext)
            }
        }
        Direction::OutboundResponseOrReport => match source_agent_id {
            Some(agent_id) if registry.is_local_agent(agent_id) => Verdict::Accept,
            _ => Verdict::Reject(FilterRejection::NonLocalSource),
        },
        Direction::InboundResponseOrReport => {
            if !matches!(
                kind,
                CommandKind::TaskInitResponse | CommandKind::AgentStatusReport
            ) {
                return Verdict::Reject(FilterRejection::NotSiblingNotification);
            }
            if !registry.is_context_active(context_id) {
                return Verdict::Reject(FilterRejection::InactiveContext);
            }
            match source_agent_id {
                Some(agent_id) if !registry.is_local_agent(agent_id) => Verdict::Accept,
                _ => Verdict::Reject(FilterRejection::OwnEcho),
            }
        }
    }
}

/// Boolean form of [`evaluate`]; rejections are logged at debug
pub fn should_process<R: RegistryView + ?Sized>(
    registry: &R,
    kind: &CommandKind,
    context_id: &str,
    source_agent_id: Option<&str>,
    direction: Direction,
) -> bool {
    match evaluate(registry, kind, context_id, source_agent_id, direction) {
        Verdict::Accept => true,
        Verdict::Reject(reason) => {
            debug!(
                command_type = %kind,
                context_id = %context_id,
                source_agent_id = source_agent_id.unwrap_or("-"),
                ?direction,
                ?reason,
                "Filtered frame"
            );
            false
        }
    }
}
