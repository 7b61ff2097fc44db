//! Observability for the coordination client
//!
//! Structured logging setup with span macros for the inbound, outbound and
//! lifecycle paths, and per-client counters.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{CoordinationMetrics, InboundMetrics, MetricsSnapshot, OutboundMetrics};

pub use logging::{inbound_span, lifecycle_span, mqtt_span, outbound_span};
