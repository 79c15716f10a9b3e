//! Mock implementations for testing
//!
//! [`MockTransport`] stands in for the MQTT transport. It records every call
//! and answers according to its [`MockBehavior`]. Tests keep a [`MockBroker`]
//! handle to the same state to inspect calls and to push broker-side events
//! (late acknowledgements, replies, dropped connections) into the session.
//!
//! Publishes and subscribes are acknowledged as soon as they are made unless
//! [`MockBehavior::hold_acks`] is set, in which case the test releases them
//! one at a time through the broker handle.

use crate::transport::{
    BrokerTransport, RequestId, TransportError, TransportEvent, TransportEventSender,
};
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::{Arc, Mutex, MutexGuard};

/// One call made on a mock transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        topic: String,
        qos: QoS,
    },
    Unsubscribe {
        topic: String,
    },
    Disconnect,
    Abort,
}

/// Scripted broker behaviour
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Connection acknowledgements sent per connect
    pub connack_count: usize,
    /// Send no acknowledgement; the test calls [`MockBroker::acknowledge`]
    pub hold_connack: bool,
    /// `connect` itself returns an error
    pub fail_connect: Option<String>,
    /// Broker refuses the connection asynchronously
    pub refuse_connect: Option<String>,
    pub fail_publish: Option<String>,
    pub fail_subscribe: Option<String>,
    pub fail_unsubscribe: Option<String>,
    pub fail_disconnect: Option<String>,
    /// Keep PUBACK and SUBACK back until the test releases them
    pub hold_acks: bool,
    /// Answer every subscribe with a failure SUBACK
    pub refuse_subscribe: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            connack_count: 1,
            hold_connack: false,
            fail_connect: None,
            refuse_connect: None,
            fail_publish: None,
            fail_subscribe: None,
            fail_unsubscribe: None,
            fail_disconnect: None,
            hold_acks: false,
            refuse_subscribe: false,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    behavior: MockBehavior,
    calls: Vec<TransportCall>,
    events: Option<TransportEventSender>,
    next_request: RequestId,
    held_publishes: Vec<RequestId>,
    held_subscribes: Vec<RequestId>,
}

impl MockState {
    fn emit(&self, event: TransportEvent) -> bool {
        match &self.events {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }
}

/// Mock transport for testing
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle sharing state with a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    // A panicking test thread must not hide the recorded calls
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let transport = Self::new();
        lock(&transport.state).behavior = behavior;
        transport
    }

    /// Broker that always acknowledges twice
    pub fn with_duplicate_connack() -> Self {
        Self::with_behavior(MockBehavior {
            connack_count: 2,
            ..Default::default()
        })
    }

    pub fn broker(&self) -> MockBroker {
        MockBroker {
            state: Arc::clone(&self.state),
        }
    }

    /// Boxed transport plus its test handle
    pub fn boxed(behavior: MockBehavior) -> (Box<dyn BrokerTransport>, MockBroker) {
        let transport = Self::with_behavior(behavior);
        let broker = transport.broker();
        (Box::new(transport), broker)
    }

    fn record(&self, call: TransportCall) -> MockBehavior {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state.behavior.clone()
    }

    /// Assign a request id and acknowledge it unless acks are held
    fn accept(&self, publish: bool) -> RequestId {
        let mut state = lock(&self.state);
        state.next_request += 1;
        let request = state.next_request;
        let refuse = state.behavior.refuse_subscribe;

        match (state.behavior.hold_acks, publish) {
            (true, true) => state.held_publishes.push(request),
            (true, false) => state.held_subscribes.push(request),
            (false, true) => {
                state.emit(TransportEvent::PublishAcknowledged(request));
            }
            (false, false) => {
                state.emit(TransportEvent::SubscribeAcknowledged {
                    request,
                    granted: !refuse,
                });
            }
        }
        request
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&mut self, events: TransportEventSender) -> Result<(), TransportError> {
        let behavior = self.record(TransportCall::Connect);
        if let Some(reason) = behavior.fail_connect {
            return Err(TransportError::ConnectFailed(reason));
        }

        if let Some(reason) = behavior.refuse_connect {
            let _ = events.send(TransportEvent::ConnectFailed(reason));
        } else if !behavior.hold_connack {
            for _ in 0..behavior.connack_count {
                let _ = events.send(TransportEvent::Connected);
            }
        }
        lock(&self.state).events = Some(events);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<RequestId, TransportError> {
        let behavior = self.record(TransportCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        match behavior.fail_publish {
            Some(reason) => Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason,
            }),
            None => Ok(self.accept(true)),
        }
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<RequestId, TransportError> {
        let behavior = self.record(TransportCall::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        match behavior.fail_subscribe {
            Some(reason) => Err(TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason,
            }),
            None => Ok(self.accept(false)),
        }
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let behavior = self.record(TransportCall::Unsubscribe {
            topic: topic.to_string(),
        });
        match behavior.fail_unsubscribe {
            Some(reason) => Err(TransportError::UnsubscribeFailed {
                topic: topic.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let behavior = self.record(TransportCall::Disconnect);
        lock(&self.state).events = None;
        match behavior.fail_disconnect {
            Some(reason) => Err(TransportError::DisconnectFailed(reason)),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        let mut state = lock(&self.state);
        state.calls.push(TransportCall::Abort);
        state.events = None;
    }
}

impl MockBroker {
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        lock(&self.state).behavior = behavior;
    }

    /// Topics and payloads of every publish, in order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Publish { topic, payload, .. } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&TransportCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|call| matches(call)).count()
    }

    pub fn connect_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Connect))
    }

    pub fn publish_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Publish { .. }))
    }

    pub fn subscribe_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Subscribe { .. }))
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Unsubscribe { .. }))
    }

    pub fn disconnect_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Disconnect))
    }

    /// Push an event to the session; false when no connection is open
    pub fn emit(&self, event: TransportEvent) -> bool {
        lock(&self.state).emit(event)
    }

    /// Publishes and subscribes still held back
    pub fn held_acks(&self) -> usize {
        let state = lock(&self.state);
        state.held_publishes.len() + state.held_subscribes.len()
    }

    /// Release the oldest held publish acknowledgement
    pub fn acknowledge_publish(&self) -> bool {
        let mut state = lock(&self.state);
        if state.held_publishes.is_empty() {
            return false;
        }
        let request = state.held_publishes.remove(0);
        state.emit(TransportEvent::PublishAcknowledged(request))
    }

    /// Answer the oldest held subscribe with a SUBACK
    pub fn acknowledge_subscribe(&self, granted: bool) -> bool {
        let mut state = lock(&self.state);
        if state.held_subscribes.is_empty() {
            return false;
        }
        let request = state.held_subscribes.remove(0);
        state.emit(TransportEvent::SubscribeAcknowledged { request, granted })
    }

    /// Send a (possibly late or duplicate) connection acknowledgement
    pub fn acknowledge(&self) -> bool {
        self.emit(TransportEvent::Connected)
    }

    /// Deliver an inbound message on `topic`
    pub fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
    }

    pub fn drop_connection(&self, reason: &str, reconnecting: bool) -> bool {
        self.emit(TransportEvent::ConnectionLost {
            reason: reason.to_string(),
            reconnecting,
        })
    }
}
