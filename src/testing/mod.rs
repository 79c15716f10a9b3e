//! Testing utilities and mock implementations
//!
//! Lets the session be driven end to end without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
