use super::TaskState;
use crate::agent::AgentRecord;
use crate::error::{panic_message, StateError};
use crate::protocol::Context;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Observer of the transient TERMINATED state of a task
pub type TerminationHook = Arc<dyn Fn(&TaskSnapshot) + Send + Sync>;

/// Point-in-time copy of one registry entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub context: Context,
    pub state: TaskState,
    /// Sorted agent instance ids
    pub agent_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

struct TaskEntry {
    context: Context,
    state: TaskState,
    agent_ids: HashSet<String>,
    created_at: DateTime<Utc>,
}

impl TaskEntry {
    fn snapshot(&self) -> TaskSnapshot {
        let mut agent_ids: Vec<String> = self.agent_ids.iter().cloned().collect();
        agent_ids.sort();
        TaskSnapshot {
            context: self.context.clone(),
            state: self.state,
            agent_ids,
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct Registry {
    contexts: HashMap<String, TaskEntry>,
    agents: HashMap<String, AgentRecord>,
    local_agents: HashSet<String>,
    node_id: String,
    cluster_id: String,
}

impl Registry {
    fn transition(&mut self, context_id: &str, next: TaskState) -> Result<(), StateError> {
        let entry = self
            .contexts
            .get_mut(context_id)
            .ok_or_else(|| StateError::UnknownContext {
                context_id: context_id.to_string(),
            })?;

        if !entry.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                context_id: context_id.to_string(),
                from: entry.state,
                to: next,
            });
        }

        entry.state = next;
        Ok(())
    }

    fn remove_entry(&mut self, context_id: &str) -> Option<(TaskEntry, Vec<AgentRecord>)> {
        let entry = self.contexts.remove(context_id)?;
        let records = entry
            .agent_ids
            .iter()
            .filter_map(|agent_id| self.agents.remove(agent_id))
            .collect();
        Some((entry, records))
    }
}

/// Lock-protected registry of active tasks, agent records and local agents
///
/// All operations are serialized under one mutex and none of them blocks while
/// holding it. Callbacks (the termination hook) run after the lock is released.
pub struct StateManager {
    inner: Mutex<Registry>,
    termination_hook: RwLock<Option<TerminationHook>>,
}

impl StateManager {
    pub fn new(cluster_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Registry {
                cluster_id: cluster_id.into(),
                node_id: node_id.into(),
                ..Registry::default()
            }),
            termination_hook: RwLock::new(None),
        }
    }

    /// Register a new context in INITIALIZING with its agent records
    pub fn init_task(&self, context: &Context, agents: &[AgentRecord]) -> Result<(), StateError> {
        let context_id = context.id().to_string();
        let mut registry = self.inner.lock();

        if registry.contexts.contains_key(&context_id) {
            return Err(StateError::DuplicateContext { context_id });
        }

        let agent_ids = agents
            .iter()
            .map(|record| record.agent_instance_id.clone())
            .collect();
        for record in agents {
            registry
                .agents
                .insert(record.agent_instance_id.clone(), record.clone());
        }
        registry.contexts.insert(
            context_id.clone(),
            TaskEntry {
                context: context.clone(),
                state: TaskState::Initializing,
                agent_ids,
                created_at: Utc::now(),
            },
        );
        drop(registry);

        info!(context_id = %context_id, agents = agents.len(), "Task initializing");
        Ok(())
    }

    pub fn mark_active(&self, context_id: &str) -> Result<(), StateError> {
        self.inner.lock().transition(context_id, TaskState::Active)?;
        debug!(context_id = %context_id, "Task active");
        Ok(())
    }

    pub fn mark_terminating(&self, context_id: &str) -> Result<(), StateError> {
        self.inner
            .lock()
            .transition(context_id, TaskState::Terminating)?;
        debug!(context_id = %context_id, "Task terminating");
        Ok(())
    }

    /// Remove a TERMINATING context and its agent records
    ///
    /// The returned snapshot carries the transient TERMINATED state, which is
    /// never stored. Local agent ids stay in the local set; retiring them is
    /// up to the caller.
    pub fn terminate_task(&self, context_id: &str) -> Result<TaskSnapshot, StateError> {
        let snapshot = {
            let mut registry = self.inner.lock();
            registry.transition(context_id, TaskState::Terminated)?;
            let (entry, _records) =
                registry
                    .remove_entry(context_id)
                    .ok_or_else(|| StateError::UnknownContext {
                        context_id: context_id.to_string(),
                    })?;
            entry.snapshot()
        };

        info!(
            context_id = %context_id,
            agents = snapshot.agent_ids.len(),
            "Task terminated"
        );

        let hook = self.termination_hook.read().clone();
        if let Some(hook) = hook {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(&snapshot))) {
                error!(
                    context_id = %context_id,
                    message = %panic_message(payload.as_ref()),
                    "Termination hook panicked"
                );
            }
        }
        Ok(snapshot)
    }

    /// Roll back a context whose initialization failed
    ///
    /// Only legal while the context is still INITIALIZING. Returns the agent
    /// records that were registered for it.
    pub fn discard_task(&self, context_id: &str) -> Result<Vec<AgentRecord>, StateError> {
        let mut registry = self.inner.lock();
        let state = registry
            .contexts
            .get(context_id)
            .map(|entry| entry.state)
            .ok_or_else(|| StateError::UnknownContext {
                context_id: context_id.to_string(),
            })?;

        if state != TaskState::Initializing {
            return Err(StateError::InvalidTransition {
                context_id: context_id.to_string(),
                from: state,
                to: TaskState::Terminated,
            });
        }

        let records = registry
            .remove_entry(context_id)
            .map(|(_, records)| records)
            .unwrap_or_default();
        drop(registry);

        info!(context_id = %context_id, "Discarded task after failed initialization");
        Ok(records)
    }

    pub fn add_local_agent(&self, agent_id: &str) {
        self.inner.lock().local_agents.insert(agent_id.to_string());
    }

    pub fn remove_local_agent(&self, agent_id: &str) {
        self.inner.lock().local_agents.remove(agent_id);
    }

    pub fn is_context_active(&self, context_id: &str) -> bool {
        self.inner
            .lock()
            .contexts
            .get(context_id)
            .is_some_and(|entry| entry.state.is_active())
    }

    pub fn is_local_agent(&self, agent_id: &str) -> bool {
        self.inner.lock().local_agents.contains(agent_id)
    }

    pub fn local_agent_count(&self) -> usize {
        self.inner.lock().local_agents.len()
    }

    pub fn set_node_id(&self, node_id: impl Into<String>) {
        self.inner.lock().node_id = node_id.into();
    }

    pub fn get_node_id(&self) -> String {
        self.inner.lock().node_id.clone()
    }

    pub fn set_cluster_id(&self, cluster_id: impl Into<String>) {
        self.inner.lock().cluster_id = cluster_id.into();
    }

    pub fn get_cluster_id(&self) -> String {
        self.inner.lock().cluster_id.clone()
    }

    pub fn task_state(&self, context_id: &str) -> Option<TaskState> {
        self.inner
            .lock()
            .contexts
            .get(context_id)
            .map(|entry| entry.state)
    }

    pub fn task_snapshot(&self, context_id: &str) -> Option<TaskSnapshot> {
        self.inner
            .lock()
            .contexts
            .get(context_id)
            .map(TaskEntry::snapshot)
    }

    /// Ids of contexts in INITIALIZING or ACTIVE, sorted
    pub fn active_contexts(&self) -> Vec<String> {
        let registry = self.inner.lock();
        let mut ids: Vec<String> = registry
            .contexts
            .iter()
            .filter(|(_, entry)| entry.state.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn agents_for_context(&self, context_id: &str) -> Vec<AgentRecord> {
        let registry = self.inner.lock();
        let Some(entry) = registry.contexts.get(context_id) else {
            return Vec::new();
        };
        let mut records: Vec<AgentRecord> = entry
            .agent_ids
            .iter()
            .filter_map(|agent_id| registry.agents.get(agent_id).cloned())
            .collect();
        records.sort_by(|a, b| a.agent_instance_id.cmp(&b.agent_instance_id));
        records
    }

    pub fn agent_record(&self, agent_id: &str) -> Option<AgentRecord> {
        self.inner.lock().agents.get(agent_id).cloned()
    }

    pub fn set_termination_hook(&self, hook: TerminationHook) {
        *self.termination_hook.write() = Some(hook);
    }

    /// Drop every context, record and local agent; identity is kept
    pub fn clear(&self) {
        let mut registry = self.inner.lock();
        registry.contexts.clear();
        registry.agents.clear();
        registry.local_agents.clear();
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.lock();
        f.debug_struct("StateManager")
            .field("cluster_id", &registry.cluster_id)
            .field("node_id", &registry.node_id)
            .field("contexts", &registry.contexts.len())
            .field("local_agents", &registry.local_agents.len())
            .finish()
    }
}
