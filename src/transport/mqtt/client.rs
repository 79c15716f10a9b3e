//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc client and drives its event loop on a
//! supervisor task. Routing decisions come from the pure
//! [`MessageHandler`](super::message_handler::MessageHandler) and
//! [`HealthMonitor`](super::health_monitor::HealthMonitor) functions; this
//! file only performs the I/O they decide on.

use super::connection::{configure_mqtt_options, ConnectionState, MqttSettings};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use super::request_tracker::RequestTracker;
use crate::transport::{
    BrokerTransport, RequestId, TransportError, TransportEvent, TransportEventSender,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, QoS};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Request queue depth between the client handle and its event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Upper bound on waiting for the event loop to flush a disconnect
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

type SharedTracker = Arc<Mutex<RequestTracker>>;

fn lock_tracker(tracker: &SharedTracker) -> MutexGuard<'_, RequestTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// MQTT 3.1.1 transport backed by rumqttc
pub struct MqttTransport {
    settings: MqttSettings,
    client: Option<AsyncClient>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    requests: SharedTracker,
    next_request: RequestId,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            client: None,
            event_loop_handle: None,
            state_rx: None,
            shutdown_tx: None,
            requests: SharedTracker::default(),
            next_request: 0,
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    /// Get current connection state
    /// Returns None if no connection has been started yet
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state()
            .is_some_and(|state| HealthMonitor::can_publish(&state))
    }

    /// Publish and subscribe requests not yet acknowledged by the broker
    pub fn outstanding_requests(&self) -> usize {
        lock_tracker(&self.requests).outstanding()
    }

    fn allocate_request(&mut self) -> RequestId {
        self.next_request += 1;
        self.next_request
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Connected client handle, or NotConnected
    fn connected_client(&self) -> Result<&AsyncClient, TransportError> {
        let state = self
            .connection_state()
            .ok_or(TransportError::NotConnected)?;
        if !HealthMonitor::can_publish(&state) {
            return Err(TransportError::NotConnected);
        }
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }

    /// Drive the event loop until shutdown, disconnect or terminal error
    async fn supervise(
        mut event_loop: EventLoop,
        settings: MqttSettings,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
        events: TransportEventSender,
        requests: SharedTracker,
    ) {
        let client_id = settings.client_id.clone();
        info!(
            target: "mqtt_transport",
            client_id = %client_id,
            broker = %settings.address,
            automatic_reconnect = settings.automatic_reconnect,
            "Starting MQTT event loop"
        );
        if settings.automatic_reconnect {
            if let Some(budget_ms) = settings.reconnect.calculate_max_total_time() {
                debug!(target: "mqtt_transport", budget_ms, "Reconnection gives up after this long");
            }
        }

        let mut supervisor = Supervisor {
            settings,
            state_tx,
            events,
            requests,
            ever_connected: false,
            reconnect_attempts: 0,
        };

        loop {
            tokio::select! {
                // Check for shutdown signal first (higher priority)
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(target: "mqtt_transport", "Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            supervisor.process_event_route(route)
                        }
                        Err(e) => supervisor.handle_event_loop_error(e, shutdown_rx.clone()).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!(target: "mqtt_transport", client_id = %client_id, "MQTT event loop stopped");
    }

    fn stop_event_loop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
        self.client = None;
    }
}

/// Event loop bookkeeping owned by the supervisor task
struct Supervisor {
    settings: MqttSettings,
    state_tx: watch::Sender<ConnectionState>,
    events: TransportEventSender,
    requests: SharedTracker,
    ever_connected: bool,
    reconnect_attempts: u32,
}

impl Supervisor {
    fn transition(&self, event: ConnectionEvent) {
        let current = self.state_tx.borrow().clone();
        let next = HealthMonitor::determine_next_state(&current, event);
        let _ = self.state_tx.send(next);
    }

    fn emit(&self, event: TransportEvent) {
        // The session may already have dropped this link
        let _ = self.events.send(event);
    }

    /// Returns true to continue the loop, false to stop
    fn process_event_route(&mut self, route: EventRoute) -> bool {
        match &route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                self.ever_connected = true;
                self.reconnect_attempts = 0;
            }
            EventRoute::ConnectionRefused(code) => {
                self.transition(ConnectionEvent::PermanentFailure(format!(
                    "Connection refused: {code}"
                )));
            }
            EventRoute::MessageReceived { topic, payload, .. } => {
                debug!(
                    target: "mqtt_transport",
                    topic = %topic,
                    bytes = payload.len(),
                    "Received MQTT message"
                );
            }
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
            }
            EventRoute::DisconnectSent => {
                self.transition(ConnectionEvent::DisconnectRequested);
                return false;
            }
            EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                let granted_ok = match MessageHandler::validate_subscription_success(granted) {
                    Ok(()) => {
                        debug!(target: "mqtt_transport", packet_id, "Subscription confirmed: {:?}", granted);
                        true
                    }
                    Err(e) => {
                        warn!(target: "mqtt_transport", packet_id, "{}", e);
                        false
                    }
                };
                let request = lock_tracker(&self.requests).subscribe_answered(*packet_id);
                if let Some(request) = request {
                    self.emit(TransportEvent::SubscribeAcknowledged {
                        request,
                        granted: granted_ok,
                    });
                }
            }
            EventRoute::SubscribeSent { packet_id } => {
                lock_tracker(&self.requests).subscribe_sent(*packet_id);
            }
            EventRoute::PublishSent { packet_id } => {
                let request = lock_tracker(&self.requests).publish_sent(*packet_id);
                if let Some(request) = request {
                    self.emit(TransportEvent::PublishAcknowledged(request));
                }
            }
            EventRoute::PublishCompleted { packet_id } => {
                let request = lock_tracker(&self.requests).publish_completed(*packet_id);
                match request {
                    Some(request) => self.emit(TransportEvent::PublishAcknowledged(request)),
                    None => {
                        debug!(target: "mqtt_transport", packet_id, "Acknowledgement for untracked publish")
                    }
                }
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
            }
            EventRoute::OutgoingEvent => {}
        }

        let refused = matches!(route, EventRoute::ConnectionRefused(_));
        if let Some(event) = MessageHandler::transport_event(route) {
            self.emit(event);
        }
        !refused
    }

    /// Returns true to continue the loop (after a reconnect delay), false to stop
    async fn handle_event_loop_error(
        &mut self,
        error: ConnectionError,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        let reason = error.to_string();
        self.transition(ConnectionEvent::NetworkError(reason.clone()));

        if !self.ever_connected {
            error!(target: "mqtt_transport", broker = %self.settings.address, "MQTT connect failed: {}", reason);
            self.emit(TransportEvent::ConnectFailed(reason));
            return false;
        }

        if !self.settings.automatic_reconnect {
            self.emit(TransportEvent::ConnectionLost {
                reason,
                reconnecting: false,
            });
            return false;
        }

        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.settings.reconnect,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                self.emit(TransportEvent::ConnectionLost {
                    reason,
                    reconnecting: true,
                });

                let max_display = self
                    .settings
                    .reconnect
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    target: "mqtt_transport",
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                // rumqttc reconnects on the next poll
                interruptible_sleep(shutdown_rx, delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => false,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                self.transition(ConnectionEvent::PermanentFailure(reason.clone()));
                self.emit(TransportEvent::ConnectionLost {
                    reason,
                    reconnecting: false,
                });
                false
            }
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!(target: "mqtt_transport", "Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&mut self, events: TransportEventSender) -> Result<(), TransportError> {
        // A restart replaces whatever the previous connection left behind
        self.stop_event_loop();

        let mqtt_options = configure_mqtt_options(&self.settings)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = Self::setup_connection_channels();
        // Packet ids belong to one event loop
        self.requests = SharedTracker::default();
        let handle = tokio::spawn(Self::supervise(
            event_loop,
            self.settings.clone(),
            state_tx,
            shutdown_rx,
            events,
            Arc::clone(&self.requests),
        ));

        self.client = Some(client);
        self.state_rx = Some(state_rx);
        self.shutdown_tx = Some(shutdown_tx);
        self.event_loop_handle = Some(handle);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<RequestId, TransportError> {
        let bytes = payload.len();
        let client = self.connected_client()?.clone();
        let request = self.allocate_request();
        lock_tracker(&self.requests).queue_publish(request, qos);

        if let Err(e) = client.publish(topic, qos, retain, payload).await {
            lock_tracker(&self.requests).cancel(request);
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }

        debug!(target: "mqtt_transport", topic = %topic, bytes, ?qos, retain, request, "Publish queued");
        Ok(request)
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<RequestId, TransportError> {
        let state = self.connection_state().ok_or(TransportError::NotConnected)?;
        if !HealthMonitor::can_subscribe(&state) {
            return Err(TransportError::NotConnected);
        }
        let client = self.connected_client()?.clone();
        let request = self.allocate_request();
        lock_tracker(&self.requests).queue_subscribe(request);

        if let Err(e) = client.subscribe(topic, qos).await {
            lock_tracker(&self.requests).cancel(request);
            return Err(TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }

        debug!(target: "mqtt_transport", topic = %topic, ?qos, request, "Subscribe queued");
        Ok(request)
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.connected_client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::UnsubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let client = self.client.take().ok_or(TransportError::NotConnected)?;

        if let Err(e) = client.disconnect().await {
            self.stop_event_loop();
            return Err(TransportError::DisconnectFailed(e.to_string()));
        }

        // The event loop stops on its own once the disconnect packet is out
        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(DISCONNECT_GRACE, handle).await {
                Ok(Ok(())) => debug!(target: "mqtt_transport", "Event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(target: "mqtt_transport", "Event loop task ended with error: {}", e)
                }
                Err(_) => {
                    warn!(target: "mqtt_transport", "Event loop didn't shut down gracefully, forcing abort");
                    self.stop_event_loop();
                    return Err(TransportError::DisconnectFailed(
                        "disconnect was not flushed in time".to_string(),
                    ));
                }
                _ => {}
            }
        }

        self.shutdown_tx = None;
        info!(target: "mqtt_transport", client_id = %self.settings.client_id, "MQTT client disconnected");
        Ok(())
    }

    fn abort(&mut self) {
        self.stop_event_loop();
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}
