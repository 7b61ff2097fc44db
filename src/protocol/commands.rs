//! Typed request and response shapes
//!
//! Requests are decoded from a [`CommandEnvelope`] by the dispatcher. Responses
//! are built by business callbacks with [`CommandResponse`] and flattened back
//! into an envelope for the outbound queue.

use super::envelope::{CommandEnvelope, CommandKind, CommandStatus, Context};
use crate::agent::AgentRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Agent definition requested by a task init
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub agent_code: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub agent_configuration_url: Option<String>,
}

/// Wire form of an agent instance inside responses and reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstanceRef {
    pub agent_id: String,
    pub agent_code: String,
    pub hydros_cluster_id: String,
    pub hydros_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biz_scene_instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInitRequest {
    pub command_id: String,
    pub context: Context,
    #[serde(default)]
    pub agent_list: Vec<AgentDefinition>,
    #[serde(default)]
    pub biz_scene_configuration_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRequest {
    pub command_id: String,
    pub context: Context,
    pub tick_id: u64,
    pub delta_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminateRequest {
    pub command_id: String,
    pub context: Context,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesUpdateRequest {
    pub command_id: String,
    pub context: Context,
    #[serde(default)]
    pub time_series_data_changed_event: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesCalcRequest {
    pub command_id: String,
    pub context: Context,
    #[serde(default)]
    pub target_agent_instance: Option<AgentInstanceRef>,
    #[serde(default)]
    pub hydro_event: Value,
}

/// Response or report produced by a business callback
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub command_id: String,
    pub kind: CommandKind,
    pub context: Context,
    pub status: CommandStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub source: AgentInstanceRef,
    /// Response-specific payload, passed through verbatim
    pub fields: Map<String, Value>,
}

impl CommandResponse {
    /// Successful response of `kind` correlated to a request by its command id
    pub fn new(
        kind: CommandKind,
        command_id: impl Into<String>,
        context: &Context,
        source: &AgentRecord,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            kind,
            context: context.clone(),
            status: CommandStatus::Succeed,
            error_code: None,
            error_message: None,
            source: source.to_instance_ref(context),
            fields: Map::new(),
        }
    }

    pub fn failed(mut self, error_code: impl Into<String>, message: impl Into<String>) -> Self {
        self.status = CommandStatus::Failed;
        self.error_code = Some(error_code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn source_agent_id(&self) -> &str {
        &self.source.agent_id
    }

    /// Flatten into the generic envelope carried by the outbound queue
    pub fn into_envelope(self) -> CommandEnvelope {
        let mut fields = self.fields;
        fields.insert(
            "command_status".into(),
            Value::String(self.status.as_str().to_string()),
        );
        if let Some(code) = self.error_code {
            fields.insert("error_code".into(), Value::String(code));
        }
        if let Some(message) = self.error_message {
            fields.insert("error_message".into(), Value::String(message));
        }
        // String-only struct, serialization cannot fail
        if let Ok(source) = serde_json::to_value(&self.source) {
            fields.insert("source_agent_instance".into(), source);
        }

        CommandEnvelope {
            command_id: self.command_id,
            command_type: self.kind.as_str().to_string(),
            context: self.context,
            fields,
        }
    }
}

impl From<CommandResponse> for CommandEnvelope {
    fn from(response: CommandResponse) -> Self {
        response.into_envelope()
    }
}

/// One metric sample published on the metrics topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Emitting component, usually the agent code
    pub source_id: String,
    /// Task the sample belongs to (scene instance id)
    pub job_instance_id: String,
    pub object_id: i64,
    pub object_name: String,
    pub step_index: u64,
    pub source_timestamp_ms: i64,
    pub metrics_code: String,
    pub value: f64,
}
