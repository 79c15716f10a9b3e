//! Pure message routing logic for MQTT events
//!
//! This module turns raw rumqttc events into routing decisions without
//! touching any I/O.

use crate::transport::TransportEvent;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Determine if an inbound publish should reach the session (pure function)
    pub fn should_process_message(topic: &str, retain: bool) -> bool {
        // Retained messages predate this cycle and are never a reply to it
        if retain {
            debug!("Ignoring retained message on topic: {}", topic);
            return false;
        }
        true
    }

    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(format!("{code:?}")),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: suback
                        .return_codes
                        .iter()
                        .map(|code| match code {
                            SubscribeReasonCode::Success(qos) => Some(*qos),
                            SubscribeReasonCode::Failure => None,
                        })
                        .collect(),
                },
                Packet::PubAck(puback) => EventRoute::PublishCompleted {
                    packet_id: puback.pkid,
                },
                Packet::PubComp(pubcomp) => EventRoute::PublishCompleted {
                    packet_id: pubcomp.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent { packet_id: *pkid },
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                EventRoute::SubscribeSent { packet_id: *pkid }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(granted: &[Option<QoS>]) -> Result<(), String> {
        if granted.iter().any(Option::is_none) {
            Err(format!("Subscription refused by broker: {granted:?}"))
        } else {
            Ok(())
        }
    }

    /// Map a route onto the event the session sees, if any (pure function)
    pub fn transport_event(route: EventRoute) -> Option<TransportEvent> {
        match route {
            EventRoute::ConnectionAcknowledged => Some(TransportEvent::Connected),
            EventRoute::ConnectionRefused(code) => Some(TransportEvent::ConnectFailed(format!(
                "broker refused connection: {code}"
            ))),
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => MessageHandler::should_process_message(&topic, retain)
                .then_some(TransportEvent::Message { topic, payload }),
            _ => None,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Broker answered the connect with a refusal code
    ConnectionRefused(String),
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Our own disconnect packet went out
    DisconnectSent,
    /// Subscription confirmed with granted QoS per filter (None = refused)
    SubscriptionConfirmed {
        packet_id: u16,
        granted: Vec<Option<QoS>>,
    },
    /// PUBACK or PUBCOMP closed the handshake for a packet id
    PublishCompleted { packet_id: u16 },
    /// A publish packet was written; packet id 0 means QoS 0
    PublishSent { packet_id: u16 },
    /// A subscribe packet was written
    SubscribeSent { packet_id: u16 },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
