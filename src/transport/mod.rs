//! Broker transport layer
//!
//! The session actor talks to the broker through [`BrokerTransport`]. Calls
//! return once the request is accepted by the client. Everything the broker
//! answers later arrives as a [`TransportEvent`] on the channel handed to
//! [`BrokerTransport::connect`]: connection acknowledgements, lost
//! connections, inbound messages, and the acknowledgement of each publish or
//! subscribe request, keyed by the [`RequestId`] the call returned.

use rumqttc::QoS;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;
pub mod tls;

pub use mqtt::MqttTransport;
pub use tls::{build_trust_context, TlsConfigError, TlsVersion, TrustConfig, TrustContext};

/// Asynchronous notifications emitted by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection
    Connected,
    /// Broker refused the connection or the transport could not reach it
    ConnectFailed(String),
    /// An established connection dropped
    ConnectionLost { reason: String, reconnecting: bool },
    /// Inbound publish on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
    /// Broker finished the publish handshake for a request
    ///
    /// PUBACK at QoS 1 and PUBCOMP at QoS 2. A QoS 0 publish has no broker
    /// answer and is acknowledged once the packet is written to the socket.
    PublishAcknowledged(RequestId),
    /// SUBACK for a request; `granted` is false when the broker refused it
    SubscribeAcknowledged { request: RequestId, granted: bool },
}

/// Correlates a publish or subscribe call with its later acknowledgement
///
/// Unique per transport for the life of the process.
pub type RequestId = u64;

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport operation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Publishing to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Subscribing to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("Unsubscribing from {topic} failed: {reason}")]
    UnsubscribeFailed { topic: String, reason: String },
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid client id: {0:?}")]
    InvalidClientId(String),
    #[error("Broker URL {0} requires a TLS trust context")]
    TlsRequired(String),
}

/// Connection to a message broker
///
/// Implementations must be restartable: `connect` may be called again after
/// `disconnect` or `abort` to open a fresh connection.
#[async_trait::async_trait]
pub trait BrokerTransport: Send {
    /// Start connecting; the outcome is reported on `events`
    async fn connect(&mut self, events: TransportEventSender) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<RequestId, TransportError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<RequestId, TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Graceful protocol-level disconnect
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Tear down the connection without talking to the broker
    fn abort(&mut self);
}
