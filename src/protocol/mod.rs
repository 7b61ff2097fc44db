//! Wire protocol for the coordination topic
//!
//! The core only needs three things from a frame: its `command_id`, its
//! `command_type` discriminator and its context. [`envelope`] models that
//! generic record; [`commands`] holds the typed request/response shapes the
//! dispatcher decodes into.

pub mod commands;
pub mod envelope;
pub mod topics;

pub use commands::*;
pub use envelope::*;
pub use topics::{canonicalize_topic, TopicBuilder};
