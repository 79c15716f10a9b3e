//! Forwarding cycle: connect, publish, await the broker, disconnect

use super::actor::{AwaitingPublish, LinkRole, LinkState, SessionActor};
use super::notifier::ForwardingResult;
use crate::forward_span;
use crate::protocol::{encode_event, Attributes, EncodeError, MessageEncoding, TagEvent};
use crate::transport::RequestId;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// One logical event to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    /// Single-flight key
    pub event_id: Uuid,
    pub topic: String,
    pub payload: String,
    pub encoding: MessageEncoding,
    pub attributes: Attributes,
    pub expect_reply: bool,
}

impl ForwardRequest {
    /// Request for an already encoded payload
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            topic: topic.into(),
            payload: payload.into(),
            encoding: MessageEncoding::default(),
            attributes: Attributes::new(),
            expect_reply: false,
        }
    }

    /// Encode a tag event into a request
    pub fn from_event(
        event: &TagEvent,
        topic: impl Into<String>,
        attributes: &Attributes,
        encoding: MessageEncoding,
        trim_header: bool,
    ) -> Result<Self, EncodeError> {
        let payload = encode_event(event, attributes, encoding, trim_header)?;
        let encoding = match event {
            TagEvent::TagId { .. } => MessageEncoding::OnlyUidRid,
            TagEvent::Records { .. } => encoding,
        };

        Ok(Self {
            encoding,
            attributes: attributes.clone(),
            ..Self::new(topic, payload)
        })
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_reply(mut self, expect_reply: bool) -> Self {
        self.expect_reply = expect_reply;
        self
    }
}

impl SessionActor {
    pub(crate) async fn handle_forward(&mut self, request: ForwardRequest) {
        if !self.in_flight.insert(request.event_id) {
            warn!(event_id = %request.event_id, "Forward already in flight, ignoring duplicate");
            return;
        }

        if request.expect_reply {
            match self.config.reply.response_topic.clone() {
                Some(topic) => self.handle_subscribe(topic).await,
                None => {
                    warn!(
                        event_id = %request.event_id,
                        "Reply requested but no response topic configured"
                    );
                    self.notify(ForwardingResult::SubscribeFailed(
                        "no response topic configured".to_string(),
                    ));
                }
            }
        }

        match self.primary.state {
            LinkState::Connected => self.publish_cycle(request).await,
            LinkState::Connecting | LinkState::Reconnecting => {
                debug!(event_id = %request.event_id, "Queueing forward until connected");
                self.primary.pending_forwards.push_back(request);
            }
            LinkState::Idle => {
                self.primary.pending_forwards.push_back(request);
                self.start_connect(LinkRole::Primary).await;
            }
        }
    }

    /// Publish one request on the connected primary link
    ///
    /// The cycle closes once the broker acknowledges the publish, or at once
    /// when the transport rejects it.
    pub(crate) async fn publish_cycle(&mut self, request: ForwardRequest) {
        let span = forward_span!(
            event_id = %request.event_id,
            topic = %request.topic,
            encoding = %request.encoding
        );
        self.run_publish(request).instrument(span).await
    }

    async fn run_publish(&mut self, request: ForwardRequest) {
        let ForwardRequest {
            event_id,
            topic,
            payload,
            expect_reply,
            ..
        } = request;

        let published = self
            .primary
            .transport
            .publish(
                &topic,
                payload.into_bytes(),
                self.config.publish_qos,
                self.config.retain,
            )
            .await;

        match published {
            Ok(request) => {
                debug!(request, "Publish awaiting acknowledgement");
                let timer = self.arm_ack_timer(LinkRole::Primary, request);
                self.primary.awaiting_publishes.insert(
                    request,
                    AwaitingPublish {
                        event_id,
                        expect_reply,
                        timer,
                    },
                );
            }
            Err(e) => self.close_cycle(event_id, expect_reply, Err(e.to_string())).await,
        }
    }

    pub(crate) async fn handle_publish_acknowledged(&mut self, role: LinkRole, request: RequestId) {
        let Some(pending) = self.link_mut(role).awaiting_publishes.remove(&request) else {
            debug!(link = ?role, request, "Acknowledgement for untracked publish ignored");
            return;
        };
        pending.timer.abort();
        self.finish_publish(pending.event_id, pending.expect_reply, Ok(()))
            .await
    }

    /// Close the cycle of a publish the broker answered or never answered
    pub(crate) async fn finish_publish(
        &mut self,
        event_id: Uuid,
        expect_reply: bool,
        published: Result<(), String>,
    ) {
        let span = forward_span!(event_id = %event_id);
        self.close_cycle(event_id, expect_reply, published)
            .instrument(span)
            .await
    }

    async fn close_cycle(
        &mut self,
        event_id: Uuid,
        expect_reply: bool,
        published: Result<(), String>,
    ) {
        self.in_flight.remove(&event_id);

        match &published {
            Ok(()) => {
                info!("Published tag event");
                self.notify(ForwardingResult::PublishOk);
            }
            Err(reason) => self.notify(ForwardingResult::PublishFailed(reason.clone())),
        }

        let reply_owns_disconnect = expect_reply
            && self.reply.is_none()
            && self
                .config
                .reply
                .response_topic
                .as_deref()
                .is_some_and(|reply_topic| {
                    self.subscriptions.is_awaiting(reply_topic)
                        || self.primary.is_subscribing(reply_topic)
                });

        let disconnected = if reply_owns_disconnect {
            debug!("Reply subscription owns the disconnect");
            None
        } else if self.config.automatic_disconnect_after_publish {
            self.release_link(LinkRole::Primary).await
        } else {
            None
        };

        let aggregate = match (published, disconnected) {
            (Err(reason), _) => ForwardingResult::ForwardingFailed(reason),
            (Ok(()), Some(Err(reason))) => ForwardingResult::ForwardingFailed(reason),
            (Ok(()), _) => ForwardingResult::ForwardingSucceeded,
        };
        self.notify(aggregate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TagRecord;

    #[test]
    fn test_request_defaults() {
        let request = ForwardRequest::new("tags/in", "[\"hello\"]");

        assert_eq!(request.topic, "tags/in");
        assert_eq!(request.encoding, MessageEncoding::OnlyPayload);
        assert!(!request.expect_reply);
        assert!(request.attributes.is_empty());
    }

    #[test]
    fn test_requests_get_distinct_event_ids() {
        let a = ForwardRequest::new("t", "p");
        let b = ForwardRequest::new("t", "p");
        assert_ne!(a.event_id, b.event_id);

        let fixed = Uuid::new_v4();
        assert_eq!(a.with_event_id(fixed).event_id, fixed);
    }

    #[test]
    fn test_from_event_encodes_records() {
        let event = TagEvent::Records {
            records: vec![TagRecord::new(vec![0x01u8], "U", b"hello".to_vec())],
        };

        let request = ForwardRequest::from_event(
            &event,
            "tags/in",
            &Attributes::new(),
            MessageEncoding::OnlyPayload,
            false,
        )
        .unwrap()
        .with_reply(true);

        assert_eq!(request.payload, "[\"hello\"]");
        assert!(request.expect_reply);
    }

    #[test]
    fn test_from_event_bare_tag_id_uses_uid_encoding() {
        let event = TagEvent::TagId {
            id: vec![0x5bu8, 0x42],
        };

        let request = ForwardRequest::from_event(
            &event,
            "tags/in",
            &Attributes::new(),
            MessageEncoding::FullRecord,
            false,
        )
        .unwrap();

        assert_eq!(request.encoding, MessageEncoding::OnlyUidRid);
        assert_eq!(request.payload, "{\"attr0\":\"5b42\"}");
    }
}
