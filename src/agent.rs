//! Agent instance records and the factory seam that produces them
//!
//! The coordination core never constructs agents itself. At task init it asks
//! an [`AgentFactory`] for the records of the instances that will take part in
//! the task and registers exactly those.

use crate::error::BoxError;
use crate::protocol::{AgentInstanceRef, Context, TaskInitRequest};
use chrono::Local;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// One agent instance taking part in a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub agent_instance_id: String,
    pub agent_code: String,
    pub cluster_id: String,
    pub node_id: String,
    /// Fixed when the record is created, never re-evaluated
    pub is_local: bool,
}

impl AgentRecord {
    pub fn new(
        agent_instance_id: impl Into<String>,
        agent_code: impl Into<String>,
        cluster_id: impl Into<String>,
        node_id: impl Into<String>,
        local_node_id: &str,
    ) -> Self {
        let node_id = node_id.into();
        let is_local = node_id == local_node_id;
        Self {
            agent_instance_id: agent_instance_id.into(),
            agent_code: agent_code.into(),
            cluster_id: cluster_id.into(),
            node_id,
            is_local,
        }
    }

    pub fn to_instance_ref(&self, context: &Context) -> AgentInstanceRef {
        AgentInstanceRef {
            agent_id: self.agent_instance_id.clone(),
            agent_code: self.agent_code.clone(),
            hydros_cluster_id: self.cluster_id.clone(),
            hydros_node_id: self.node_id.clone(),
            biz_scene_instance_id: Some(context.id().to_string()),
        }
    }
}

/// Identity of the process creating agents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub cluster_id: String,
    pub node_id: String,
}

/// Supplies the agent records for a task being initialized
pub trait AgentFactory: Send + Sync {
    fn create_agents(
        &self,
        request: &TaskInitRequest,
        node: &NodeIdentity,
    ) -> Result<Vec<AgentRecord>, BoxError>;
}

/// Creates one local instance for every requested agent whose code is hosted here
#[derive(Debug, Clone, Default)]
pub struct CodeRegistryFactory {
    codes: HashSet<String>,
}

impl CodeRegistryFactory {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn hosts(&self, agent_code: &str) -> bool {
        self.codes.contains(agent_code)
    }
}

impl AgentFactory for CodeRegistryFactory {
    fn create_agents(
        &self,
        request: &TaskInitRequest,
        node: &NodeIdentity,
    ) -> Result<Vec<AgentRecord>, BoxError> {
        let records: Vec<AgentRecord> = request
            .agent_list
            .iter()
            .filter(|definition| self.hosts(&definition.agent_code))
            .map(|definition| {
                AgentRecord::new(
                    generate_agent_instance_id(&definition.agent_code),
                    definition.agent_code.clone(),
                    node.cluster_id.clone(),
                    node.node_id.clone(),
                    &node.node_id,
                )
            })
            .collect();

        debug!(
            context_id = %request.context.id(),
            requested = request.agent_list.len(),
            created = records.len(),
            "Created agent records for task"
        );
        Ok(records)
    }
}

/// `AGT{yyyyMMddHHmm}{6 uppercase alnum}_{agent_code}`
pub fn generate_agent_instance_id(agent_code: &str) -> String {
    let timestamp = Local::now().format("%Y%m%d%H%M");
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect::<String>()
        .to_uppercase();
    format!("AGT{timestamp}{suffix}_{agent_code}")
}
