//! Orchestration core
//!
//! [`CoordinationClient`] composes the transport, filter, state manager and
//! dispatcher. Inbound frames are handled on the transport's I/O thread;
//! responses travel through the outbound queue in [`outbound`] and are sent by
//! its single consumer thread.

pub mod client;
pub mod outbound;

pub use client::{CoordinationClient, CoordinationClientBuilder};
pub use outbound::OutboundEnvelope;
