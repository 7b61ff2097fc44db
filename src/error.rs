//! Error taxonomy for the coordination core
//!
//! Per-message failures (decode, handler, transport) are logged and isolated by
//! the background threads. State manager contract violations are returned to the
//! caller because they indicate a caller bug, not a transient failure.

use crate::state::TaskState;
use thiserror::Error;

/// Boxed error returned by business callbacks and collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// State manager contract violations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Context already registered: {context_id}")]
    DuplicateContext { context_id: String },

    #[error("Unknown context: {context_id}")]
    UnknownContext { context_id: String },

    #[error("Invalid transition for context {context_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        context_id: String,
        from: TaskState,
        to: TaskState,
    },
}

/// Malformed or unexpected payload shape
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid JSON envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("Payload for {command_type} does not match its schema: {source}")]
    Schema {
        command_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A business callback failed while handling a command
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler for {command_type} (command {command_id}, context {context_id}) failed: {source}")]
    Failed {
        command_type: String,
        command_id: String,
        context_id: String,
        #[source]
        source: BoxError,
    },

    #[error("Handler for {command_type} (command {command_id}, context {context_id}) panicked: {message}")]
    Panicked {
        command_type: String,
        command_id: String,
        context_id: String,
        message: String,
    },

    #[error("Agent factory failed for context {context_id}: {source}")]
    Factory {
        context_id: String,
        #[source]
        source: BoxError,
    },

    #[error("Agent factory panicked for context {context_id}: {message}")]
    FactoryPanicked { context_id: String, message: String },
}

/// Connect / subscribe / publish failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Not connected - current state: {state}")]
    NotConnected { state: String },

    #[error("Publishing to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Subscription to {topic} failed: {reason}")]
    SubscriptionFailed { topic: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by the coordination client lifecycle and send paths
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Text of a payload caught by `catch_unwind`
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_messages_name_the_context() {
        let err = StateError::DuplicateContext {
            context_id: "C1".to_string(),
        };
        assert_eq!(err.to_string(), "Context already registered: C1");

        let err = StateError::InvalidTransition {
            context_id: "C1".to_string(),
            from: TaskState::Active,
            to: TaskState::Initializing,
        };
        assert!(err.to_string().contains("Active"));
        assert!(err.to_string().contains("Initializing"));
    }

    #[test]
    fn test_handler_error_carries_command_identity() {
        let err = HandlerError::Failed {
            command_type: "tick_cmd_request".to_string(),
            command_id: "cmd-7".to_string(),
            context_id: "C1".to_string(),
            source: "solver diverged".into(),
        };
        let text = err.to_string();
        assert!(text.contains("cmd-7"));
        assert!(text.contains("C1"));
        assert!(text.contains("solver diverged"));
    }

    #[test]
    fn test_transport_error_converts_into_coordination_error() {
        let err: CoordinationError = TransportError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, CoordinationError::Transport(_)));
        assert!(err.to_string().contains("refused"));
    }
}
