//! Session actor
//!
//! One task owns every connection handle, the single-flight set and the
//! subscription table. Commands from the [`Session`](super::Session) handle,
//! transport events and timer expiries are all received here and applied one
//! at a time, so every state transition has exactly one writer.
//!
//! A publish or subscribe is only resolved when the broker acknowledges it.
//! Until then the request sits on its link with an acknowledgement timer, and
//! the link is not released.

use super::forward::ForwardRequest;
use super::notifier::{ForwardingResult, ResultNotifier};
use super::subscription::SubscriptionTable;
use super::{SessionConfig, SessionSnapshot};
use crate::transport::{BrokerTransport, RequestId, TransportEvent, TransportEventReceiver};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Which connection an operation runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    /// Publishing connection, also used for replies in single-connection mode
    Primary,
    /// Dedicated reply connection
    Reply,
}

/// Lifecycle of one connection as seen by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

/// Requests from the session handle
pub(crate) enum Command {
    Forward(ForwardRequest),
    Subscribe(String),
    UnsubscribeAll,
    Inspect(oneshot::Sender<SessionSnapshot>),
    Close(oneshot::Sender<()>),
}

/// Timer expiries posted back to the actor
#[derive(Debug)]
pub(crate) enum TimerEvent {
    ConnectExpired { link: LinkRole, attempt: u64 },
    ReplyExpired { topic: String, generation: u64 },
    AckExpired { link: LinkRole, request: RequestId },
}

/// Publish handed to the transport, waiting for PUBACK or PUBCOMP
#[derive(Debug)]
pub(crate) struct AwaitingPublish {
    pub(crate) event_id: Uuid,
    pub(crate) expect_reply: bool,
    pub(crate) timer: JoinHandle<()>,
}

/// Subscribe handed to the transport, waiting for SUBACK
#[derive(Debug)]
pub(crate) struct AwaitingSubscribe {
    pub(crate) topic: String,
    pub(crate) timer: JoinHandle<()>,
}

pub(crate) struct Link {
    pub(crate) role: LinkRole,
    pub(crate) transport: Box<dyn BrokerTransport>,
    pub(crate) state: LinkState,
    /// Bumped on every connect so a stale connect timer has no effect
    pub(crate) attempt: u64,
    pub(crate) connect_timer: Option<JoinHandle<()>>,
    pub(crate) events_rx: Option<TransportEventReceiver>,
    pub(crate) pending_forwards: VecDeque<ForwardRequest>,
    pub(crate) pending_subscribes: VecDeque<String>,
    pub(crate) awaiting_publishes: HashMap<RequestId, AwaitingPublish>,
    pub(crate) awaiting_subscribes: HashMap<RequestId, AwaitingSubscribe>,
}

impl Link {
    pub(crate) fn new(role: LinkRole, transport: Box<dyn BrokerTransport>) -> Self {
        Self {
            role,
            transport,
            state: LinkState::Idle,
            attempt: 0,
            connect_timer: None,
            events_rx: None,
            pending_forwards: VecDeque::new(),
            pending_subscribes: VecDeque::new(),
            awaiting_publishes: HashMap::new(),
            awaiting_subscribes: HashMap::new(),
        }
    }

    /// Work waiting for the link to connect
    fn has_queued_work(&self) -> bool {
        !self.pending_forwards.is_empty() || !self.pending_subscribes.is_empty()
    }

    fn has_pending_work(&self) -> bool {
        self.has_queued_work() || self.awaiting_acks() > 0
    }

    pub(crate) fn awaiting_acks(&self) -> usize {
        self.awaiting_publishes.len() + self.awaiting_subscribes.len()
    }

    pub(crate) fn is_subscribing(&self, topic: &str) -> bool {
        self.awaiting_subscribes
            .values()
            .any(|pending| pending.topic == topic)
    }

    /// Take every request still waiting for the broker, oldest first
    fn take_awaiting(&mut self) -> (Vec<AwaitingSubscribe>, Vec<AwaitingPublish>) {
        let mut subscribes: Vec<(RequestId, AwaitingSubscribe)> =
            self.awaiting_subscribes.drain().collect();
        subscribes.sort_by_key(|(request, _)| *request);
        let mut publishes: Vec<(RequestId, AwaitingPublish)> =
            self.awaiting_publishes.drain().collect();
        publishes.sort_by_key(|(request, _)| *request);

        let subscribes: Vec<AwaitingSubscribe> = subscribes
            .into_iter()
            .map(|(_, pending)| {
                pending.timer.abort();
                pending
            })
            .collect();
        let publishes: Vec<AwaitingPublish> = publishes
            .into_iter()
            .map(|(_, pending)| {
                pending.timer.abort();
                pending
            })
            .collect();
        (subscribes, publishes)
    }

    fn cancel_connect_timer(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }

    /// Drop the connection without a protocol disconnect
    fn reset(&mut self) {
        self.cancel_connect_timer();
        self.transport.abort();
        self.events_rx = None;
        self.state = LinkState::Idle;
    }
}

enum Step {
    Command(Command),
    Transport(LinkRole, Option<TransportEvent>),
    Timer(TimerEvent),
    HandleDropped,
}

pub(crate) struct SessionActor {
    pub(crate) config: Arc<SessionConfig>,
    notifier: Arc<dyn ResultNotifier>,
    pub(crate) primary: Link,
    pub(crate) reply: Option<Link>,
    pub(crate) in_flight: HashSet<Uuid>,
    pub(crate) subscriptions: SubscriptionTable,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    pub(crate) timers_tx: mpsc::UnboundedSender<TimerEvent>,
    timers_rx: mpsc::UnboundedReceiver<TimerEvent>,
}

/// Next event from a link, pending forever while the link has no channel
async fn next_event(rx: Option<&mut TransportEventReceiver>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    pub(crate) fn new(
        config: Arc<SessionConfig>,
        notifier: Arc<dyn ResultNotifier>,
        primary: Box<dyn BrokerTransport>,
        reply: Option<Box<dyn BrokerTransport>>,
        commands_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        Self {
            config,
            notifier,
            primary: Link::new(LinkRole::Primary, primary),
            reply: reply.map(|transport| Link::new(LinkRole::Reply, transport)),
            in_flight: HashSet::new(),
            subscriptions: SubscriptionTable::default(),
            commands_rx,
            timers_tx,
            timers_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            client_id = %self.config.mqtt.client_id,
            broker = %self.config.mqtt.address,
            dedicated_reply_link = self.reply.is_some(),
            "Session started"
        );

        loop {
            let step = tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::HandleDropped,
                },
                event = next_event(self.primary.events_rx.as_mut()) => {
                    Step::Transport(LinkRole::Primary, event)
                }
                event = next_event(self.reply.as_mut().and_then(|link| link.events_rx.as_mut())) => {
                    Step::Transport(LinkRole::Reply, event)
                }
                Some(timer) = self.timers_rx.recv() => Step::Timer(timer),
            };

            match step {
                Step::Command(Command::Forward(request)) => self.handle_forward(request).await,
                Step::Command(Command::Subscribe(topic)) => self.handle_subscribe(topic).await,
                Step::Command(Command::UnsubscribeAll) => self.handle_unsubscribe_all().await,
                Step::Command(Command::Inspect(reply)) => {
                    let _ = reply.send(self.snapshot());
                }
                Step::Command(Command::Close(ack)) => {
                    self.shutdown().await;
                    let _ = ack.send(());
                    break;
                }
                Step::Transport(role, Some(event)) => self.handle_transport_event(role, event).await,
                Step::Transport(role, None) => self.handle_transport_closed(role),
                Step::Timer(TimerEvent::ConnectExpired { link, attempt }) => {
                    self.handle_connect_expired(link, attempt)
                }
                Step::Timer(TimerEvent::ReplyExpired { topic, generation }) => {
                    self.handle_reply_timeout(topic, generation).await
                }
                Step::Timer(TimerEvent::AckExpired { link, request }) => {
                    self.handle_ack_expired(link, request).await
                }
                Step::HandleDropped => {
                    debug!("Session handle dropped, shutting down");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!(client_id = %self.config.mqtt.client_id, "Session stopped");
    }

    pub(crate) fn notify(&self, result: ForwardingResult) {
        if result.is_failure() {
            warn!(outcome = %result, "Session outcome");
        } else {
            debug!(outcome = %result, "Session outcome");
        }
        self.notifier.notify(result);
    }

    pub(crate) fn link(&self, role: LinkRole) -> &Link {
        match (role, &self.reply) {
            (LinkRole::Reply, Some(reply)) => reply,
            _ => &self.primary,
        }
    }

    pub(crate) fn link_mut(&mut self, role: LinkRole) -> &mut Link {
        match (role, &mut self.reply) {
            (LinkRole::Reply, Some(reply)) => reply,
            _ => &mut self.primary,
        }
    }

    /// Link that carries reply subscriptions
    pub(crate) fn subscription_role(&self) -> LinkRole {
        if self.reply.is_some() {
            LinkRole::Reply
        } else {
            LinkRole::Primary
        }
    }

    /// Open a fresh connection on a link and arm its connect timeout
    pub(crate) async fn start_connect(&mut self, role: LinkRole) {
        let connect_timeout = self.config.connect_timeout;
        let timers = self.timers_tx.clone();

        let link = self.link_mut(role);
        link.attempt += 1;
        let attempt = link.attempt;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        link.events_rx = Some(events_rx);
        link.state = LinkState::Connecting;

        info!(link = ?role, attempt, "Connecting to broker");
        match link.transport.connect(events_tx).await {
            Ok(()) => {
                link.connect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(connect_timeout).await;
                    let _ = timers.send(TimerEvent::ConnectExpired { link: role, attempt });
                }));
            }
            Err(e) => self.fail_link(role, e.to_string()),
        }
    }

    /// Arm the timer bounding how long `request` may wait for the broker
    pub(crate) fn arm_ack_timer(&self, role: LinkRole, request: RequestId) -> JoinHandle<()> {
        let ack_timeout = self.config.ack_timeout;
        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ack_timeout).await;
            let _ = timers.send(TimerEvent::AckExpired {
                link: role,
                request,
            });
        })
    }

    async fn handle_ack_expired(&mut self, role: LinkRole, request: RequestId) {
        let reason = format!(
            "no acknowledgement from broker within {:?}",
            self.config.ack_timeout
        );
        let link = self.link_mut(role);
        let publish = link.awaiting_publishes.remove(&request);
        let subscribe = link.awaiting_subscribes.remove(&request);
        match (publish, subscribe) {
            (Some(pending), _) => {
                self.finish_publish(pending.event_id, pending.expect_reply, Err(reason))
                    .await
            }
            (None, Some(pending)) => self.subscribe_failed(role, &pending.topic, reason).await,
            (None, None) => debug!(link = ?role, request, "Stale acknowledgement timer ignored"),
        }
    }

    /// Fail every request on a dropped link that the broker never acknowledged
    fn fail_awaiting(&mut self, role: LinkRole, reason: &str) {
        let (subscribes, publishes) = self.link_mut(role).take_awaiting();
        for pending in subscribes {
            debug!(topic = %pending.topic, "Subscription lost with the connection");
            self.notify(ForwardingResult::SubscribeFailed(reason.to_string()));
        }
        for pending in publishes {
            self.in_flight.remove(&pending.event_id);
            self.notify(ForwardingResult::PublishFailed(reason.to_string()));
            self.notify(ForwardingResult::ForwardingFailed(reason.to_string()));
        }
    }

    /// Connection attempt failed: report it and fail everything queued on the link
    pub(crate) fn fail_link(&mut self, role: LinkRole, reason: String) {
        error!(link = ?role, "Broker connection failed: {}", reason);

        let link = self.link_mut(role);
        link.reset();
        let forwards: Vec<ForwardRequest> = link.pending_forwards.drain(..).collect();
        let subscribes: Vec<String> = link.pending_subscribes.drain(..).collect();

        self.notify(ForwardingResult::ConnectFailed(reason.clone()));
        for topic in subscribes {
            debug!(topic = %topic, "Dropping queued subscription");
            self.notify(ForwardingResult::SubscribeFailed(reason.clone()));
        }
        for request in forwards {
            self.in_flight.remove(&request.event_id);
            self.notify(ForwardingResult::ForwardingFailed(reason.clone()));
        }
    }

    async fn handle_transport_event(&mut self, role: LinkRole, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.handle_connected(role).await,
            TransportEvent::ConnectFailed(reason) => {
                if self.link(role).state == LinkState::Connecting {
                    self.fail_link(role, reason);
                } else {
                    debug!(link = ?role, "Ignoring connect failure for link not connecting: {}", reason);
                }
            }
            TransportEvent::ConnectionLost {
                reason,
                reconnecting,
            } => self.handle_connection_lost(role, reason, reconnecting),
            TransportEvent::Message { topic, payload } => {
                self.handle_reply_message(role, topic, payload).await
            }
            TransportEvent::PublishAcknowledged(request) => {
                self.handle_publish_acknowledged(role, request).await
            }
            TransportEvent::SubscribeAcknowledged { request, granted } => {
                self.handle_subscribe_acknowledged(role, request, granted)
                    .await
            }
        }
    }

    async fn handle_connected(&mut self, role: LinkRole) {
        let link = self.link_mut(role);
        let was_reconnecting = match link.state {
            LinkState::Connecting => false,
            LinkState::Reconnecting => true,
            LinkState::Connected => {
                warn!(link = ?role, "Duplicate connection acknowledgement ignored");
                return;
            }
            LinkState::Idle => {
                warn!(link = ?role, "Connection acknowledgement for idle link ignored");
                return;
            }
        };
        link.cancel_connect_timer();
        link.state = LinkState::Connected;

        info!(link = ?role, "Connected to broker");
        self.notify(ForwardingResult::ConnectOk);

        if was_reconnecting {
            debug!(link = ?role, "Connection restored by transport");
        }
        // Entries survive a lost connection, so any fresh one resubscribes
        if !self.subscriptions.topics_on(role).is_empty() {
            self.restore_subscriptions(role).await;
        }
        self.drain_link(role).await;
    }

    /// Run everything queued while the link was connecting, subscriptions first
    async fn drain_link(&mut self, role: LinkRole) {
        loop {
            let link = self.link_mut(role);
            if link.state != LinkState::Connected {
                break;
            }
            if let Some(topic) = link.pending_subscribes.pop_front() {
                self.subscribe_on_link(role, topic).await;
            } else if let Some(request) = link.pending_forwards.pop_front() {
                self.publish_cycle(request).await;
            } else {
                break;
            }
        }
    }

    fn handle_connection_lost(&mut self, role: LinkRole, reason: String, reconnecting: bool) {
        let link = self.link_mut(role);
        match (link.state, reconnecting) {
            (LinkState::Idle, _) => {
                debug!(link = ?role, "Connection loss on idle link ignored: {}", reason);
            }
            (LinkState::Connecting, true) => {
                debug!(link = ?role, "Transport retrying before first acknowledgement: {}", reason);
            }
            (_, true) => {
                warn!(link = ?role, "Connection lost, transport reconnecting: {}", reason);
                link.state = LinkState::Reconnecting;
                // The transport resends unacknowledged publishes but not subscribes
                let mut requeued: Vec<(RequestId, AwaitingSubscribe)> =
                    link.awaiting_subscribes.drain().collect();
                requeued.sort_by_key(|(request, _)| *request);
                for (_, pending) in requeued.into_iter().rev() {
                    pending.timer.abort();
                    if !link.pending_subscribes.contains(&pending.topic) {
                        link.pending_subscribes.push_front(pending.topic);
                    }
                }
            }
            (_, false) => {
                self.fail_awaiting(role, &reason);
                let link = self.link_mut(role);
                if link.has_queued_work() {
                    self.fail_link(role, reason);
                } else {
                    warn!(link = ?role, "Connection lost: {}", reason);
                    link.reset();
                }
            }
        }
    }

    fn handle_transport_closed(&mut self, role: LinkRole) {
        let link = self.link_mut(role);
        link.events_rx = None;
        match link.state {
            LinkState::Idle => {}
            LinkState::Connecting => {
                self.fail_link(role, "transport closed before connecting".to_string())
            }
            LinkState::Connected | LinkState::Reconnecting => {
                self.handle_connection_lost(role, "transport closed".to_string(), false)
            }
        }
    }

    fn handle_connect_expired(&mut self, role: LinkRole, attempt: u64) {
        let connect_timeout = self.config.connect_timeout;
        let link = self.link(role);
        if link.state != LinkState::Connecting || link.attempt != attempt {
            debug!(link = ?role, attempt, "Stale connect timer ignored");
            return;
        }
        self.fail_link(
            role,
            format!("no connection acknowledgement within {connect_timeout:?}"),
        );
    }

    /// Protocol disconnect of a link no longer needed by anything queued or awaiting
    ///
    /// Returns None when the link was not connected or is still in use.
    pub(crate) async fn release_link(&mut self, role: LinkRole) -> Option<Result<(), String>> {
        let awaiting = self.subscriptions.awaiting_on(role);
        let link = self.link_mut(role);
        if link.state != LinkState::Connected {
            return None;
        }
        if awaiting || link.has_pending_work() {
            debug!(
                link = ?role,
                awaiting,
                awaiting_acks = link.awaiting_acks(),
                "Link still in use, deferring disconnect"
            );
            return None;
        }

        let result = link.transport.disconnect().await.map_err(|e| e.to_string());
        if result.is_err() {
            link.transport.abort();
        }
        link.events_rx = None;
        link.state = LinkState::Idle;

        match &result {
            Ok(()) => {
                info!(link = ?role, "Disconnected from broker");
                self.notify(ForwardingResult::DisconnectOk);
            }
            Err(reason) => self.notify(ForwardingResult::DisconnectFailed(reason.clone())),
        }
        Some(result)
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            subscriptions: self.subscriptions.phases(),
            live_timers: self.subscriptions.live_timers(),
            in_flight: self.in_flight.len(),
            awaiting_acks: self.primary.awaiting_acks()
                + self.reply.as_ref().map_or(0, Link::awaiting_acks),
            primary: self.primary.state,
            reply: self.reply.as_ref().map(|link| link.state),
        }
    }

    /// Stop everything: unsubscribe, disconnect connected links, fail queued work
    async fn shutdown(&mut self) {
        info!("Closing session");

        for (topic, entry) in self.subscriptions.drain() {
            self.unsubscribe_topic(entry.link, &topic).await;
        }

        let roles: Vec<LinkRole> = std::iter::once(LinkRole::Primary)
            .chain(self.reply.as_ref().map(|link| link.role))
            .collect();

        for role in roles {
            self.fail_awaiting(role, "session closed");
            let link = self.link_mut(role);
            link.cancel_connect_timer();
            let forwards: Vec<ForwardRequest> = link.pending_forwards.drain(..).collect();
            link.pending_subscribes.clear();

            if link.state == LinkState::Connected {
                self.release_link(role).await;
            } else {
                self.link_mut(role).reset();
            }

            for request in forwards {
                self.in_flight.remove(&request.event_id);
                self.notify(ForwardingResult::ForwardingFailed(
                    "session closed".to_string(),
                ));
            }
        }
    }
}
