//! Generic command envelope
//!
//! Every frame on the coordination topic is a flat JSON record carrying at least
//! `command_id`, `command_type` and `context`. Everything else is kept verbatim
//! in [`CommandEnvelope::fields`] and handed to the typed decoders untouched.

use crate::error::DecodeError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifies one simulation task instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(rename = "biz_scene_instance_id", alias = "scene_instance_id")]
    pub scene_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Tenant, scenario and waterway descriptors are opaque to the core
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Context {
    pub fn new(scene_instance_id: impl Into<String>) -> Self {
        Self {
            scene_instance_id: scene_instance_id.into(),
            task_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.scene_instance_id
    }
}

/// Broad role of a command on the topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Coordinator -> agent
    Request,
    /// Agent -> coordinator, answering a request
    Response,
    /// Agent -> coordinator, unsolicited
    Report,
    Unknown,
}

/// Closed set of command discriminators spoken on the coordination topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandKind {
    TaskInitRequest,
    TaskInitResponse,
    TickRequest,
    TickResponse,
    TerminateRequest,
    TerminateResponse,
    TimeSeriesUpdateRequest,
    TimeSeriesUpdateResponse,
    TimeSeriesCalcRequest,
    TimeSeriesCalcResponse,
    AgentStatusReport,
    Unknown(String),
}

impl CommandKind {
    pub fn parse(command_type: &str) -> Self {
        match command_type {
            "task_init_request" => CommandKind::TaskInitRequest,
            "task_init_response" => CommandKind::TaskInitResponse,
            "tick_cmd_request" => CommandKind::TickRequest,
            "tick_cmd_response" => CommandKind::TickResponse,
            "SIMCMD_TASK_TERMINATED_REQUEST" => CommandKind::TerminateRequest,
            "SIMCMD_TASK_TERMINATED_RESPONSE" => CommandKind::TerminateResponse,
            "SIMCMD_TIME_SERIES_DATA_UPDATE_REQUEST" => CommandKind::TimeSeriesUpdateRequest,
            "SIMCMD_TIME_SERIES_DATA_UPDATE_RESPONSE" => CommandKind::TimeSeriesUpdateResponse,
            "SIMCMD_TIME_SERIES_CALCULATION_REQUEST" => CommandKind::TimeSeriesCalcRequest,
            "SIMCMD_TIME_SERIES_CALCULATION_RESPONSE" => CommandKind::TimeSeriesCalcResponse,
            "agent_instance_status_report" => CommandKind::AgentStatusReport,
            other => CommandKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::TaskInitRequest => "task_init_request",
            CommandKind::TaskInitResponse => "task_init_response",
            CommandKind::TickRequest => "tick_cmd_request",
            CommandKind::TickResponse => "tick_cmd_response",
            CommandKind::TerminateRequest => "SIMCMD_TASK_TERMINATED_REQUEST",
            CommandKind::TerminateResponse => "SIMCMD_TASK_TERMINATED_RESPONSE",
            CommandKind::TimeSeriesUpdateRequest => "SIMCMD_TIME_SERIES_DATA_UPDATE_REQUEST",
            CommandKind::TimeSeriesUpdateResponse => "SIMCMD_TIME_SERIES_DATA_UPDATE_RESPONSE",
            CommandKind::TimeSeriesCalcRequest => "SIMCMD_TIME_SERIES_CALCULATION_REQUEST",
            CommandKind::TimeSeriesCalcResponse => "SIMCMD_TIME_SERIES_CALCULATION_RESPONSE",
            CommandKind::AgentStatusReport => "agent_instance_status_report",
            CommandKind::Unknown(other) => other,
        }
    }

    pub fn class(&self) -> MessageClass {
        match self {
            CommandKind::TaskInitRequest
            | CommandKind::TickRequest
            | CommandKind::TerminateRequest
            | CommandKind::TimeSeriesUpdateRequest
            | CommandKind::TimeSeriesCalcRequest => MessageClass::Request,
            CommandKind::TaskInitResponse
            | CommandKind::TickResponse
            | CommandKind::TerminateResponse
            | CommandKind::TimeSeriesUpdateResponse
            | CommandKind::TimeSeriesCalcResponse => MessageClass::Response,
            CommandKind::AgentStatusReport => MessageClass::Report,
            CommandKind::Unknown(_) => MessageClass::Unknown,
        }
    }

    /// Response discriminator answering this request, if any
    pub fn response_kind(&self) -> Option<CommandKind> {
        match self {
            CommandKind::TaskInitRequest => Some(CommandKind::TaskInitResponse),
            CommandKind::TickRequest => Some(CommandKind::TickResponse),
            CommandKind::TerminateRequest => Some(CommandKind::TerminateResponse),
            CommandKind::TimeSeriesUpdateRequest => Some(CommandKind::TimeSeriesUpdateResponse),
            CommandKind::TimeSeriesCalcRequest => Some(CommandKind::TimeSeriesCalcResponse),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried by responses; the core never inspects it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Init,
    Processing,
    Succeed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Init => "INIT",
            CommandStatus::Processing => "PROCESSING",
            CommandStatus::Succeed => "SUCCEED",
            CommandStatus::Failed => "FAILED",
        }
    }
}

/// Generic outer record of every coordination frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub command_type: String,
    pub context: Context,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn new(command_id: impl Into<String>, kind: &CommandKind, context: Context) -> Self {
        Self {
            command_id: command_id.into(),
            command_type: kind.as_str().to_string(),
            context,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Parse the generic envelope from a raw frame
    pub fn from_slice(payload: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(payload).map_err(DecodeError::Envelope)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn kind(&self) -> CommandKind {
        CommandKind::parse(&self.command_type)
    }

    pub fn context_id(&self) -> &str {
        self.context.id()
    }

    /// `source_agent_instance.agent_id` of responses and reports
    pub fn source_agent_id(&self) -> Option<&str> {
        self.fields
            .get("source_agent_instance")?
            .get("agent_id")?
            .as_str()
    }

    /// Decode the whole record into a typed command shape
    pub fn decode_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let schema_error = |source| DecodeError::Schema {
            command_type: self.command_type.clone(),
            source,
        };
        let value = serde_json::to_value(self).map_err(schema_error)?;
        serde_json::from_value(value).map_err(schema_error)
    }
}
