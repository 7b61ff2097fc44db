//! Task lifecycle state
//!
//! [`StateManager`] is the single owner of the active-context registry and the
//! local agent set. Every read and write goes through its lock.

mod manager;

pub use manager::{StateManager, TaskSnapshot, TerminationHook};

use serde::Serialize;
use std::fmt;

/// Lifecycle of one task context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Initializing,
    Active,
    Terminating,
    /// Only ever observed in the snapshot returned by `terminate_task`
    Terminated,
}

impl TaskState {
    /// Forward-only: INITIALIZING -> ACTIVE -> TERMINATING -> TERMINATED
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Initializing, TaskState::Active)
                | (TaskState::Active, TaskState::Terminating)
                | (TaskState::Terminating, TaskState::Terminated)
        )
    }

    /// Active contexts are the ones inbound requests are accepted for
    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Initializing | TaskState::Active)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Initializing => "INITIALIZING",
            TaskState::Active => "ACTIVE",
            TaskState::Terminating => "TERMINATING",
            TaskState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}
