//! Testing utilities and mock implementations
//!
//! Mocks for running a coordination client without an MQTT broker or real
//! business logic.

pub mod mocks;

pub use mocks::*;
