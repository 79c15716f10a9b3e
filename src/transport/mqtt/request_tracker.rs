//! Correlation of session requests with rumqttc packet ids
//!
//! rumqttc assigns packet ids inside its event loop, after the client call
//! has returned. Requests are queued here in call order and bound to a packet
//! id when the matching outgoing packet is reported, so the broker's later
//! PUBACK, PUBCOMP or SUBACK can be traced back to the request that caused it.

use crate::transport::RequestId;
use rumqttc::QoS;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct RequestTracker {
    queued_publishes: VecDeque<(RequestId, QoS)>,
    queued_subscribes: VecDeque<RequestId>,
    publishes: HashMap<u16, RequestId>,
    subscribes: HashMap<u16, RequestId>,
}

impl RequestTracker {
    pub fn queue_publish(&mut self, request: RequestId, qos: QoS) {
        self.queued_publishes.push_back((request, qos));
    }

    pub fn queue_subscribe(&mut self, request: RequestId) {
        self.queued_subscribes.push_back(request);
    }

    /// Forget a request the client refused to accept
    pub fn cancel(&mut self, request: RequestId) {
        self.queued_publishes.retain(|(queued, _)| *queued != request);
        self.queued_subscribes.retain(|queued| *queued != request);
    }

    /// A publish packet went out
    ///
    /// Returns the request to acknowledge right away, which only happens at
    /// QoS 0. Resends of a packet id already bound are ignored.
    pub fn publish_sent(&mut self, packet_id: u16) -> Option<RequestId> {
        if packet_id != 0 && self.publishes.contains_key(&packet_id) {
            return None;
        }
        let (request, qos) = self.queued_publishes.pop_front()?;
        match qos {
            QoS::AtMostOnce => Some(request),
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                self.publishes.insert(packet_id, request);
                None
            }
        }
    }

    /// PUBACK or PUBCOMP arrived
    pub fn publish_completed(&mut self, packet_id: u16) -> Option<RequestId> {
        self.publishes.remove(&packet_id)
    }

    pub fn subscribe_sent(&mut self, packet_id: u16) {
        if self.subscribes.contains_key(&packet_id) {
            return;
        }
        if let Some(request) = self.queued_subscribes.pop_front() {
            self.subscribes.insert(packet_id, request);
        }
    }

    /// SUBACK arrived
    pub fn subscribe_answered(&mut self, packet_id: u16) -> Option<RequestId> {
        self.subscribes.remove(&packet_id)
    }

    pub fn outstanding(&self) -> usize {
        self.queued_publishes.len()
            + self.queued_subscribes.len()
            + self.publishes.len()
            + self.subscribes.len()
    }
}
