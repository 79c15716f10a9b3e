//! Broker session
//!
//! A [`Session`] is the caller-facing handle of one session actor. Every method
//! enqueues a command and returns; connection, publish, subscription and
//! disconnect outcomes reach the caller through the [`ResultNotifier`] given
//! to [`Session::open`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tag_forwarder::protocol::TagEvent;
//! use tag_forwarder::session::{ForwardingResult, Session, SessionConfig};
//! use tag_forwarder::transport::mqtt::{BrokerAddress, MqttSettings};
//!
//! # tokio_test::block_on(async {
//! let address = BrokerAddress::parse("tcp://localhost:1883")?;
//! let mut config = SessionConfig::new(MqttSettings::new(address, "reader-1"));
//! config.default_topic = "tags/in".to_string();
//!
//! let (results_tx, mut results_rx) = tokio::sync::mpsc::unbounded_channel();
//! let session = Session::open(config, Arc::new(results_tx))?;
//! session.forward_event(&TagEvent::tag_id(vec![0x5b, 0x42]), None)?;
//!
//! while let Some(result) = results_rx.recv().await {
//!     if result.is_aggregate() {
//!         break;
//!     }
//! }
//! session.close().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod actor;
pub mod forward;
pub mod notifier;
pub mod subscription;

pub use actor::{LinkRole, LinkState};
pub use forward::ForwardRequest;
pub use notifier::{ForwardingListener, ForwardingResult, ListenerNotifier, ResultNotifier};
pub use subscription::SubscriptionPhase;

use crate::error::{ForwarderError, ForwarderResult};
use crate::protocol::{Attributes, MessageEncoding, TagEvent};
use crate::transport::mqtt::{configure_mqtt_options, MqttSettings, MqttTransport};
use crate::transport::BrokerTransport;
use actor::{Command, SessionActor};
use rumqttc::QoS;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Suffix appended to the client id of a dedicated reply connection
pub const REPLY_CLIENT_ID_SUFFIX: &str = "-reply";

/// Reply subscription settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplySettings {
    /// Request a reply for every forwarded event
    pub subscribe_for_reply: bool,
    pub response_topic: Option<String>,
    /// How long a subscription awaits its reply
    pub timeout: Duration,
    /// Carry replies on the publishing connection instead of a second one
    pub shared_connection: bool,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            subscribe_for_reply: false,
            response_topic: None,
            timeout: Duration::from_secs(10),
            shared_connection: true,
        }
    }
}

/// Runtime configuration of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mqtt: MqttSettings,
    pub default_topic: String,
    pub publish_qos: QoS,
    pub subscribe_qos: QoS,
    pub retain: bool,
    pub connect_timeout: Duration,
    /// How long a publish or subscribe waits for the broker's acknowledgement
    pub ack_timeout: Duration,
    pub automatic_disconnect_after_publish: bool,
    pub encoding: MessageEncoding,
    pub trim_header: bool,
    pub attributes: Attributes,
    pub reply: ReplySettings,
}

impl SessionConfig {
    pub fn new(mqtt: MqttSettings) -> Self {
        Self {
            mqtt,
            default_topic: String::new(),
            publish_qos: QoS::AtLeastOnce,
            subscribe_qos: QoS::AtLeastOnce,
            retain: false,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            automatic_disconnect_after_publish: true,
            encoding: MessageEncoding::default(),
            trim_header: false,
            attributes: Attributes::new(),
            reply: ReplySettings::default(),
        }
    }
}

/// Point-in-time view of the actor state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub subscriptions: BTreeMap<String, SubscriptionPhase>,
    pub live_timers: usize,
    pub in_flight: usize,
    /// Publishes and subscribes the broker has not acknowledged yet
    pub awaiting_acks: usize,
    pub primary: LinkState,
    pub reply: Option<LinkState>,
}

/// Handle to a running session
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    config: Arc<SessionConfig>,
}

impl Session {
    /// Start a session over MQTT transports built from `config`
    ///
    /// Fails before any I/O when the client options are invalid. Must be
    /// called within a tokio runtime.
    pub fn open(config: SessionConfig, notifier: Arc<dyn ResultNotifier>) -> ForwarderResult<Self> {
        configure_mqtt_options(&config.mqtt)?;

        let reply: Option<Box<dyn BrokerTransport>> = if config.reply.shared_connection {
            None
        } else {
            let reply_id = format!("{}{}", config.mqtt.client_id, REPLY_CLIENT_ID_SUFFIX);
            Some(Box::new(MqttTransport::new(
                config.mqtt.with_client_id(reply_id),
            )))
        };
        let primary = Box::new(MqttTransport::new(config.mqtt.clone()));

        Self::open_with_transports(config, notifier, primary, reply)
    }

    /// Start a session over caller-supplied transports
    ///
    /// With `reply` set, reply subscriptions run on that transport instead of
    /// the primary one.
    pub fn open_with_transports(
        config: SessionConfig,
        notifier: Arc<dyn ResultNotifier>,
        primary: Box<dyn BrokerTransport>,
        reply: Option<Box<dyn BrokerTransport>>,
    ) -> ForwarderResult<Self> {
        if config.connect_timeout.is_zero()
            || config.ack_timeout.is_zero()
            || config.reply.timeout.is_zero()
        {
            return Err(ForwarderError::InvalidInput {
                message: "timeouts must be greater than zero".to_string(),
            });
        }

        let config = Arc::new(config);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(config.clone(), notifier, primary, reply, commands_rx);
        let task = tokio::spawn(actor.run());

        Ok(Self {
            commands,
            task,
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn send(&self, command: Command) -> ForwarderResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ForwarderError::SessionClosed)
    }

    /// Enqueue a forwarding cycle
    ///
    /// A request whose event id is already in flight is ignored.
    pub fn forward(&self, request: ForwardRequest) -> ForwarderResult<()> {
        debug!(event_id = %request.event_id, topic = %request.topic, "Enqueueing forward");
        self.send(Command::Forward(request))
    }

    /// Encode a tag event with the session settings and forward it
    ///
    /// Publishes to `topic`, or to the configured default topic when `None`.
    /// Returns the event id of the enqueued cycle.
    pub fn forward_event(&self, event: &TagEvent, topic: Option<&str>) -> ForwarderResult<Uuid> {
        let topic = topic.unwrap_or(&self.config.default_topic);
        if topic.is_empty() {
            return Err(ForwarderError::InvalidInput {
                message: "no topic given and no default topic configured".to_string(),
            });
        }
        if event.is_empty() {
            return Err(ForwarderError::InvalidInput {
                message: "tag event carries no records".to_string(),
            });
        }

        let request = ForwardRequest::from_event(
            event,
            topic,
            &self.config.attributes,
            self.config.encoding,
            self.config.trim_header,
        )?
        .with_reply(self.config.reply.subscribe_for_reply);
        let event_id = request.event_id;

        self.forward(request)?;
        Ok(event_id)
    }

    /// Subscribe to a topic and await one reply on it
    pub fn subscribe(&self, topic: impl Into<String>) -> ForwarderResult<()> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ForwarderError::InvalidInput {
                message: "subscription topic must not be empty".to_string(),
            });
        }
        self.send(Command::Subscribe(topic))
    }

    /// Drop every reply subscription, then disconnect the links they used
    pub fn unsubscribe_all(&self) -> ForwarderResult<()> {
        self.send(Command::UnsubscribeAll)
    }

    pub async fn snapshot(&self) -> ForwarderResult<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Inspect(tx))?;
        rx.await.map_err(|_| ForwarderError::SessionClosed)
    }

    /// Unsubscribe, disconnect and stop the session task
    pub async fn close(self) -> ForwarderResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Close(tx))?;
        rx.await.map_err(|_| ForwarderError::SessionClosed)?;
        // The actor has already left its loop once the close is acknowledged
        let _ = self.task.await;
        Ok(())
    }
}
