//! Tag event forwarder
//!
//! Forwards tag reads (record sets or bare tag identifiers) to an MQTT broker
//! over short-lived sessions, optionally waiting for one reply per event.
//!
//! # Overview
//!
//! - [`protocol`] - tag records and their wire encodings
//! - [`transport`] - MQTT 3.1.1 transport over rumqttc and TLS provisioning
//! - [`session`] - the session actor: connect, publish, await reply, disconnect
//! - [`config`] - TOML configuration
//! - [`observability`] - structured logging
//!
//! # Quick Start
//!
//! ```rust
//! use tag_forwarder::protocol::{encode, Attributes, MessageEncoding, TagRecord};
//!
//! let records = vec![TagRecord::text("en", "pallet-42")];
//! let payload = encode(&records, &Attributes::new(), MessageEncoding::OnlyPayload, true).unwrap();
//! assert_eq!(payload, r#"["pallet-42"]"#);
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ForwarderConfig};
pub use error::{ForwarderError, ForwarderResult};
pub use protocol::{encode, encode_event, MessageEncoding, TagEvent, TagRecord};
pub use session::{ForwardRequest, ForwardingResult, ResultNotifier, Session, SessionConfig};
pub use transport::{build_trust_context, TrustConfig, TrustContext};
