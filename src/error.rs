//! Top-level error type for the forwarder
//!
//! Each layer keeps its own error enum; [`ForwarderError`] wraps them for the
//! session handle and the binary.

use crate::config::ConfigError;
use crate::protocol::EncodeError;
use crate::transport::{TlsConfigError, TransportError};
use thiserror::Error;

/// Main error type for forwarder operations
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl ForwarderError {
    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Errors raised while validating configuration, before any I/O
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ForwarderError::Config(_)
                | ForwarderError::Tls(_)
                | ForwarderError::Transport(
                    TransportError::InvalidBrokerUrl(_)
                        | TransportError::InvalidClientId(_)
                        | TransportError::TlsRequired(_)
                )
        )
    }
}

/// Result type for forwarder operations
pub type ForwarderResult<T> = Result<T, ForwarderError>;
