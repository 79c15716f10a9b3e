//! Reply subscriptions
//!
//! Each response topic moves `Unsubscribed -> Awaiting -> Satisfied`, or back
//! to `Unsubscribed` when its timer fires first. A topic only starts awaiting
//! once the broker grants its SUBACK. An entry exists only while a topic is
//! awaiting; it holds the one timer armed for that topic and the generation
//! that timer was armed with.

use super::actor::{AwaitingSubscribe, LinkRole, LinkState, SessionActor, TimerEvent};
use super::notifier::ForwardingResult;
use crate::subscription_span;
use crate::transport::RequestId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPhase {
    Unsubscribed,
    Awaiting,
    Satisfied,
}

#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    pub(crate) phase: SubscriptionPhase,
    pub(crate) generation: u64,
    pub(crate) timer: Option<JoinHandle<()>>,
    pub(crate) link: LinkRole,
}

impl SubscriptionEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Topic table owned by the session actor
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    entries: HashMap<String, SubscriptionEntry>,
    next_generation: u64,
}

impl SubscriptionTable {
    pub(crate) fn phase(&self, topic: &str) -> SubscriptionPhase {
        self.entries
            .get(topic)
            .map(|entry| entry.phase)
            .unwrap_or(SubscriptionPhase::Unsubscribed)
    }

    pub(crate) fn is_awaiting(&self, topic: &str) -> bool {
        self.phase(topic) == SubscriptionPhase::Awaiting
    }

    pub(crate) fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub(crate) fn begin_awaiting(
        &mut self,
        topic: &str,
        link: LinkRole,
        generation: u64,
        timer: JoinHandle<()>,
    ) {
        let previous = self.entries.insert(
            topic.to_string(),
            SubscriptionEntry {
                phase: SubscriptionPhase::Awaiting,
                generation,
                timer: Some(timer),
                link,
            },
        );
        if let Some(mut previous) = previous {
            previous.cancel_timer();
        }
    }

    /// Resolve an awaiting topic with a reply; other phases are left alone
    pub(crate) fn satisfy(&mut self, topic: &str) -> Option<SubscriptionEntry> {
        if !self.is_awaiting(topic) {
            return None;
        }
        let mut entry = self.entries.remove(topic)?;
        entry.cancel_timer();
        entry.phase = SubscriptionPhase::Satisfied;
        Some(entry)
    }

    /// Resolve an awaiting topic whose timer fired, if the timer is current
    pub(crate) fn expire(&mut self, topic: &str, generation: u64) -> Option<SubscriptionEntry> {
        match self.entries.get(topic) {
            Some(entry)
                if entry.phase == SubscriptionPhase::Awaiting && entry.generation == generation => {}
            _ => return None,
        }
        let mut entry = self.entries.remove(topic)?;
        entry.timer = None;
        entry.phase = SubscriptionPhase::Unsubscribed;
        Some(entry)
    }

    /// Remove every entry, cancelling its timer
    pub(crate) fn drain(&mut self) -> Vec<(String, SubscriptionEntry)> {
        let mut drained: Vec<(String, SubscriptionEntry)> = self.entries.drain().collect();
        for (_, entry) in drained.iter_mut() {
            entry.cancel_timer();
        }
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    pub(crate) fn awaiting_on(&self, link: LinkRole) -> bool {
        self.entries
            .values()
            .any(|entry| entry.link == link && entry.phase == SubscriptionPhase::Awaiting)
    }

    pub(crate) fn topics_on(&self, link: LinkRole) -> Vec<String> {
        let mut topics: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.link == link)
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Timers that have not fired or been cancelled
    pub(crate) fn live_timers(&self) -> usize {
        self.entries
            .values()
            .filter_map(|entry| entry.timer.as_ref())
            .filter(|timer| !timer.is_finished())
            .count()
    }

    pub(crate) fn phases(&self) -> BTreeMap<String, SubscriptionPhase> {
        self.entries
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.phase))
            .collect()
    }
}

impl SessionActor {
    pub(crate) async fn handle_subscribe(&mut self, topic: String) {
        let role = self.subscription_role();
        if self.subscriptions.is_awaiting(&topic) {
            if self.link(role).state == LinkState::Idle {
                // Connecting resubscribes every awaiting topic on the link
                debug!(topic = %topic, "Reconnecting for an awaiting subscription");
                self.start_connect(role).await;
            } else {
                debug!(topic = %topic, "Already awaiting a reply, subscribe ignored");
            }
            return;
        }

        let link = self.link_mut(role);
        if link.pending_subscribes.contains(&topic) || link.is_subscribing(&topic) {
            debug!(topic = %topic, "Subscription already in progress");
            return;
        }

        match link.state {
            LinkState::Connected => self.subscribe_on_link(role, topic).await,
            LinkState::Connecting | LinkState::Reconnecting => {
                link.pending_subscribes.push_back(topic);
            }
            LinkState::Idle => {
                link.pending_subscribes.push_back(topic);
                self.start_connect(role).await;
            }
        }
    }

    pub(crate) async fn subscribe_on_link(&mut self, role: LinkRole, topic: String) {
        let span = subscription_span!(topic = %topic, link = ?role);
        self.run_subscribe(role, topic).instrument(span).await
    }

    async fn run_subscribe(&mut self, role: LinkRole, topic: String) {
        let qos = self.config.subscribe_qos;
        match self.link_mut(role).transport.subscribe(&topic, qos).await {
            Ok(request) => {
                debug!(request, "Subscribe awaiting acknowledgement");
                let timer = self.arm_ack_timer(role, request);
                self.link_mut(role)
                    .awaiting_subscribes
                    .insert(request, AwaitingSubscribe { topic, timer });
            }
            Err(e) => self.subscribe_failed(role, &topic, e.to_string()).await,
        }
    }

    pub(crate) async fn handle_subscribe_acknowledged(
        &mut self,
        role: LinkRole,
        request: RequestId,
        granted: bool,
    ) {
        let Some(pending) = self.link_mut(role).awaiting_subscribes.remove(&request) else {
            debug!(link = ?role, request, "Acknowledgement for untracked subscribe ignored");
            return;
        };
        pending.timer.abort();
        let topic = pending.topic;

        if !granted {
            let reason = format!("broker refused subscription to {topic}");
            self.subscribe_failed(role, &topic, reason).await;
            return;
        }

        let generation = self.subscriptions.allocate_generation();
        let timer = self.arm_reply_timer(&topic, generation);
        self.subscriptions
            .begin_awaiting(&topic, role, generation, timer);
        info!(topic = %topic, link = ?role, generation, "Awaiting reply");
        self.notify(ForwardingResult::SubscribeOk);
    }

    /// Report a subscribe that will never await, then free the link if idle
    pub(crate) async fn subscribe_failed(&mut self, role: LinkRole, topic: &str, reason: String) {
        warn!(topic = %topic, link = ?role, "Subscription failed: {}", reason);
        self.notify(ForwardingResult::SubscribeFailed(reason));
        if role == LinkRole::Reply || self.config.automatic_disconnect_after_publish {
            self.release_link(role).await;
        }
    }

    fn arm_reply_timer(&self, topic: &str, generation: u64) -> JoinHandle<()> {
        let timeout = self.config.reply.timeout;
        let timers = self.timers_tx.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timers.send(TimerEvent::ReplyExpired { topic, generation });
        })
    }

    pub(crate) async fn handle_reply_message(
        &mut self,
        role: LinkRole,
        topic: String,
        payload: Vec<u8>,
    ) {
        let Some(entry) = self.subscriptions.satisfy(&topic) else {
            debug!(link = ?role, topic = %topic, "Message on topic not awaiting a reply ignored");
            return;
        };

        info!(topic = %topic, bytes = payload.len(), "Reply arrived");
        self.notify(ForwardingResult::ReplyArrived {
            topic: topic.clone(),
            payload,
        });
        self.finish_subscription(entry.link, &topic).await;
    }

    pub(crate) async fn handle_reply_timeout(&mut self, topic: String, generation: u64) {
        let Some(entry) = self.subscriptions.expire(&topic, generation) else {
            debug!(topic = %topic, generation, "Stale reply timer ignored");
            return;
        };

        warn!(topic = %topic, "No reply before timeout");
        self.notify(ForwardingResult::ReplyTimedOut(topic.clone()));
        self.finish_subscription(entry.link, &topic).await;
    }

    async fn finish_subscription(&mut self, role: LinkRole, topic: &str) {
        self.unsubscribe_topic(role, topic).await;
        self.release_link(role).await;
    }

    pub(crate) async fn unsubscribe_topic(&mut self, role: LinkRole, topic: &str) {
        let link = self.link_mut(role);
        if link.state != LinkState::Connected {
            return;
        }
        if let Err(e) = link.transport.unsubscribe(topic).await {
            warn!(topic = %topic, "Unsubscribe failed: {}", e);
        }
    }

    pub(crate) async fn handle_unsubscribe_all(&mut self) {
        let drained = self.subscriptions.drain();
        let role = self.subscription_role();
        let link = self.link_mut(role);
        link.pending_subscribes.clear();
        let mut unanswered: Vec<(RequestId, AwaitingSubscribe)> =
            link.awaiting_subscribes.drain().collect();
        unanswered.sort_by_key(|(request, _)| *request);

        let mut links: Vec<LinkRole> = Vec::new();
        for (topic, entry) in drained {
            self.unsubscribe_topic(entry.link, &topic).await;
            if !links.contains(&entry.link) {
                links.push(entry.link);
            }
        }
        // The broker may still grant these, so unsubscribe behind them
        for (_, pending) in unanswered {
            pending.timer.abort();
            self.unsubscribe_topic(role, &pending.topic).await;
            if !links.contains(&role) {
                links.push(role);
            }
        }

        info!(links = links.len(), "Unsubscribed from all reply topics");
        for role in links {
            self.release_link(role).await;
        }
    }

    /// Subscribe again to every awaiting topic on a freshly connected link
    ///
    /// The topics keep awaiting under their running reply timers, so the
    /// broker's answer to these requests is not tracked.
    pub(crate) async fn restore_subscriptions(&mut self, role: LinkRole) {
        let qos = self.config.subscribe_qos;
        for topic in self.subscriptions.topics_on(role) {
            match self.link_mut(role).transport.subscribe(&topic, qos).await {
                Ok(request) => debug!(topic = %topic, request, "Resubscribed awaiting topic"),
                Err(e) => warn!(topic = %topic, "Resubscribe failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn idle_timer() -> JoinHandle<()> {
        tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)))
    }

    #[tokio::test]
    async fn test_unknown_topic_is_unsubscribed() {
        let table = SubscriptionTable::default();
        assert_eq!(table.phase("tags/reply"), SubscriptionPhase::Unsubscribed);
        assert!(!table.awaiting_on(LinkRole::Primary));
    }

    #[tokio::test]
    async fn test_satisfy_removes_entry_and_cancels_timer() {
        let mut table = SubscriptionTable::default();
        let generation = table.allocate_generation();
        table.begin_awaiting("tags/reply", LinkRole::Primary, generation, idle_timer());
        assert_eq!(table.live_timers(), 1);

        let entry = table.satisfy("tags/reply").unwrap();

        assert_eq!(entry.phase, SubscriptionPhase::Satisfied);
        assert_eq!(table.phase("tags/reply"), SubscriptionPhase::Unsubscribed);
        assert_eq!(table.live_timers(), 0);
        assert!(table.satisfy("tags/reply").is_none());
    }

    #[tokio::test]
    async fn test_stale_generation_does_not_expire() {
        let mut table = SubscriptionTable::default();
        let first = table.allocate_generation();
        table.begin_awaiting("tags/reply", LinkRole::Primary, first, idle_timer());
        let entry = table.satisfy("tags/reply").unwrap();
        drop(entry);

        let second = table.allocate_generation();
        table.begin_awaiting("tags/reply", LinkRole::Primary, second, idle_timer());

        assert!(table.expire("tags/reply", first).is_none());
        assert!(table.is_awaiting("tags/reply"));

        let expired = table.expire("tags/reply", second).unwrap();
        assert_eq!(expired.phase, SubscriptionPhase::Unsubscribed);
        assert!(!table.is_awaiting("tags/reply"));
    }

    #[tokio::test]
    async fn test_drain_is_sorted_and_cancels_timers() {
        let mut table = SubscriptionTable::default();
        for topic in ["b/reply", "a/reply"] {
            let generation = table.allocate_generation();
            table.begin_awaiting(topic, LinkRole::Reply, generation, idle_timer());
        }
        assert!(table.awaiting_on(LinkRole::Reply));
        assert_eq!(table.topics_on(LinkRole::Reply), vec!["a/reply", "b/reply"]);

        let drained = table.drain();

        let topics: Vec<&str> = drained.iter().map(|(topic, _)| topic.as_str()).collect();
        assert_eq!(topics, vec!["a/reply", "b/reply"]);
        assert!(drained.iter().all(|(_, entry)| entry.timer.is_none()));
        assert!(table.phases().is_empty());
    }
}
