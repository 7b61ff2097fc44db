//! Simulation agent coordination core
//!
//! Coordinates distributed simulation agents that share one MQTT coordination
//! topic per cluster. A [`CoordinationClient`] receives command frames,
//! decides which ones concern this process, tracks the lifecycle of every task
//! it takes part in, and publishes the responses of its local agents through a
//! retrying outbound queue.
//!
//! # Overview
//!
//! - [`filter`] - relevance decision per frame (context activity, agent locality)
//! - [`state`] - lock-protected registry of tasks, agent records and local agents
//! - [`dispatch`] - typed decode and routing to the [`CoordinationCallback`] hooks
//! - [`transport`] - broker connection behind the [`transport::Transport`] trait
//! - [`coordination`] - inbound routing, outbound queue, start/stop
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use simcoord::agent::AgentRecord;
//! use simcoord::dispatch::{CoordinationCallback, HandlerResult};
//! use simcoord::protocol::{CommandKind, CommandResponse, TaskInitRequest, TerminateRequest, TickRequest};
//! use simcoord::transport::MqttTransport;
//! use simcoord::{CoordinationClient, CoordinatorConfig};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! struct Solver;
//!
//! impl CoordinationCallback for Solver {
//!     fn component(&self) -> &str {
//!         "solver"
//!     }
//!
//!     fn on_task_init(&self, request: &TaskInitRequest, agents: &[AgentRecord]) -> HandlerResult {
//!         Ok(agents
//!             .iter()
//!             .map(|a| CommandResponse::new(CommandKind::TaskInitResponse, &request.command_id, &request.context, a))
//!             .collect())
//!     }
//!
//!     fn on_tick(&self, request: &TickRequest, agents: &[AgentRecord]) -> HandlerResult {
//!         Ok(agents
//!             .iter()
//!             .map(|a| CommandResponse::new(CommandKind::TickResponse, &request.command_id, &request.context, a))
//!             .collect())
//!     }
//!
//!     fn on_terminate(&self, _request: &TerminateRequest, _agents: &[AgentRecord]) -> HandlerResult {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! let config = CoordinatorConfig::load_from_file(Path::new("simcoord.toml"))?;
//! let transport = Arc::new(MqttTransport::new(config.node.node_id.clone()));
//! let client = CoordinationClient::builder(config, transport, Arc::new(Solver)).build()?;
//! client.start()?;
//! // ... until shutdown
//! client.stop()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod agent;
pub mod config;
pub mod coordination;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod observability;
pub mod protocol;
pub mod state;
pub mod testing;
pub mod transport;

pub use agent::{AgentFactory, AgentRecord, CodeRegistryFactory};
pub use config::{ConfigError, CoordinatorConfig};
pub use coordination::{CoordinationClient, CoordinationClientBuilder};
pub use dispatch::{CoordinationCallback, HandlerResult};
pub use error::{CoordinationError, CoordinationResult};
pub use filter::{should_process, Direction, FilterRejection};
pub use state::{StateManager, TaskState};
