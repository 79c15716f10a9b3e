//! Observability for the forwarder
//!
//! Structured logging with tracing; span macros group the events of one
//! forwarding cycle or reply subscription.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{forward_span, subscription_span};
