//! Result notification surface
//!
//! The session reports every phase outcome and one aggregate outcome per
//! forwarding cycle through [`ResultNotifier::notify`]. Callers that prefer
//! a method per outcome implement [`ForwardingListener`] and wrap it in a
//! [`ListenerNotifier`].

use std::fmt;
use tokio::sync::mpsc;

/// Phase-level and aggregate outcomes of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardingResult {
    ConnectOk,
    ConnectFailed(String),
    PublishOk,
    PublishFailed(String),
    DisconnectOk,
    DisconnectFailed(String),
    SubscribeOk,
    SubscribeFailed(String),
    ReplyArrived { topic: String, payload: Vec<u8> },
    ReplyTimedOut(String),
    ForwardingSucceeded,
    ForwardingFailed(String),
}

impl ForwardingResult {
    /// Aggregate outcome closing a forwarding cycle
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            ForwardingResult::ForwardingSucceeded | ForwardingResult::ForwardingFailed(_)
        )
    }

    /// Outcome resolving a reply subscription
    pub fn is_reply_resolution(&self) -> bool {
        matches!(
            self,
            ForwardingResult::ReplyArrived { .. } | ForwardingResult::ReplyTimedOut(_)
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ForwardingResult::ConnectFailed(_)
                | ForwardingResult::PublishFailed(_)
                | ForwardingResult::DisconnectFailed(_)
                | ForwardingResult::SubscribeFailed(_)
                | ForwardingResult::ForwardingFailed(_)
        )
    }
}

impl fmt::Display for ForwardingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingResult::ConnectOk => write!(f, "connected"),
            ForwardingResult::ConnectFailed(reason) => write!(f, "connect failed: {reason}"),
            ForwardingResult::PublishOk => write!(f, "published"),
            ForwardingResult::PublishFailed(reason) => write!(f, "publish failed: {reason}"),
            ForwardingResult::DisconnectOk => write!(f, "disconnected"),
            ForwardingResult::DisconnectFailed(reason) => {
                write!(f, "disconnect failed: {reason}")
            }
            ForwardingResult::SubscribeOk => write!(f, "subscribed"),
            ForwardingResult::SubscribeFailed(reason) => write!(f, "subscribe failed: {reason}"),
            ForwardingResult::ReplyArrived { topic, payload } => write!(
                f,
                "reply on {topic}: {}",
                String::from_utf8_lossy(payload)
            ),
            ForwardingResult::ReplyTimedOut(topic) => write!(f, "no reply on {topic}"),
            ForwardingResult::ForwardingSucceeded => write!(f, "forwarding succeeded"),
            ForwardingResult::ForwardingFailed(reason) => {
                write!(f, "forwarding failed: {reason}")
            }
        }
    }
}

/// Receives session outcomes
///
/// Called from the session task; implementations must not block.
pub trait ResultNotifier: Send + Sync {
    fn notify(&self, result: ForwardingResult);
}

impl ResultNotifier for mpsc::UnboundedSender<ForwardingResult> {
    fn notify(&self, result: ForwardingResult) {
        // Receiver gone means nobody is listening any more
        let _ = self.send(result);
    }
}

/// Method-per-outcome listener
pub trait ForwardingListener: Send + Sync {
    fn on_connect_successful(&self) {}
    fn on_connect_error(&self, _reason: &str) {}
    fn on_publish_successful(&self) {}
    fn on_publish_error(&self, _reason: &str) {}
    fn on_disconnect_successful(&self) {}
    fn on_disconnect_error(&self, _reason: &str) {}
    fn on_subscription_success(&self) {}
    fn on_subscription_error(&self, _reason: &str) {}
    fn on_reply_arrived(&self, _topic: &str, _payload: &[u8]) {}
    fn on_reply_timeout(&self, _topic: &str) {}

    fn on_forwarding_successful(&self);
    fn on_forwarding_error(&self, reason: &str);
}

/// Adapts a [`ForwardingListener`] to the [`ResultNotifier`] dispatch
pub struct ListenerNotifier<L>(pub L);

impl<L: ForwardingListener> ResultNotifier for ListenerNotifier<L> {
    fn notify(&self, result: ForwardingResult) {
        let listener = &self.0;
        match &result {
            ForwardingResult::ConnectOk => listener.on_connect_successful(),
            ForwardingResult::ConnectFailed(reason) => listener.on_connect_error(reason),
            ForwardingResult::PublishOk => listener.on_publish_successful(),
            ForwardingResult::PublishFailed(reason) => listener.on_publish_error(reason),
            ForwardingResult::DisconnectOk => listener.on_disconnect_successful(),
            ForwardingResult::DisconnectFailed(reason) => listener.on_disconnect_error(reason),
            ForwardingResult::SubscribeOk => listener.on_subscription_success(),
            ForwardingResult::SubscribeFailed(reason) => listener.on_subscription_error(reason),
            ForwardingResult::ReplyArrived { topic, payload } => {
                listener.on_reply_arrived(topic, payload)
            }
            ForwardingResult::ReplyTimedOut(topic) => listener.on_reply_timeout(topic),
            ForwardingResult::ForwardingSucceeded => listener.on_forwarding_successful(),
            ForwardingResult::ForwardingFailed(reason) => listener.on_forwarding_error(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    impl ForwardingListener for RecordingListener {
        fn on_publish_successful(&self) {
            self.record("publish");
        }

        fn on_reply_arrived(&self, topic: &str, payload: &[u8]) {
            self.record(format!("reply {topic} {}", String::from_utf8_lossy(payload)));
        }

        fn on_forwarding_successful(&self) {
            self.record("success");
        }

        fn on_forwarding_error(&self, reason: &str) {
            self.record(format!("error {reason}"));
        }
    }

    #[test]
    fn test_listener_dispatch() {
        let notifier = ListenerNotifier(RecordingListener::default());

        notifier.notify(ForwardingResult::ConnectOk);
        notifier.notify(ForwardingResult::PublishOk);
        notifier.notify(ForwardingResult::ReplyArrived {
            topic: "tags/reply".to_string(),
            payload: b"ok".to_vec(),
        });
        notifier.notify(ForwardingResult::ForwardingSucceeded);
        notifier.notify(ForwardingResult::ForwardingFailed("boom".to_string()));

        let calls = notifier.0.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["publish", "reply tags/reply ok", "success", "error boom"]
        );
    }

    #[test]
    fn test_channel_notifier_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tx.notify(ForwardingResult::PublishOk);
    }

    #[test]
    fn test_result_classification() {
        assert!(ForwardingResult::ForwardingSucceeded.is_aggregate());
        assert!(ForwardingResult::ReplyTimedOut("t".to_string()).is_reply_resolution());
        assert!(ForwardingResult::DisconnectFailed("x".to_string()).is_failure());
        assert!(!ForwardingResult::ReplyTimedOut("t".to_string()).is_failure());
        assert_eq!(
            ForwardingResult::PublishFailed("denied".to_string()).to_string(),
            "publish failed: denied"
        );
    }
}
