//! MQTT 3.1.1 transport built on rumqttc
//!
//! The module separates pure functions from I/O operations:
//!
//! - [`connection`] - broker address parsing, connection state and client options
//! - [`message_handler`] - routing of raw rumqttc events
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`request_tracker`] - packet id correlation for broker acknowledgements
//! - [`client`] - the event loop supervisor and [`BrokerTransport`](crate::transport::BrokerTransport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use tag_forwarder::transport::mqtt::{BrokerAddress, MqttSettings, MqttTransport};
//! use tag_forwarder::transport::BrokerTransport;
//!
//! # tokio_test::block_on(async {
//! let address = BrokerAddress::parse("tcp://localhost:1883")?;
//! let mut transport = MqttTransport::new(MqttSettings::new(address, "reader-1"));
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
//! transport.connect(events_tx).await?;
//! let first_event = events_rx.recv().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod request_tracker;

pub use client::MqttTransport;
pub use connection::{
    configure_mqtt_options, BrokerAddress, ConnectionState, Credentials, MqttSettings,
    ReconnectConfig,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
pub use request_tracker::RequestTracker;
