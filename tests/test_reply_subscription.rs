//! Reply subscription tests
//!
//! Cover the per-topic state machine (unsubscribed, awaiting, satisfied),
//! SUBACK handling, timers and disconnect ownership on shared and dedicated
//! links.


use std::time::Duration;
use tag_forwarder::session::{ForwardRequest, ForwardingResult, LinkState, SubscriptionPhase};
use tag_forwarder::testing::{MockBehavior, TransportCall};
use test_helpers::*;

fn reply_request() -> ForwardRequest {
    ForwardRequest::new(DEFAULT_TOPIC, "[\"pallet-42\"]").with_reply(true)
}

fn is_reply_resolution(result: &ForwardingResult) -> bool {
    result.is_reply_resolution()
}

#[tokio::test]
async fn test_reply_timeout_on_shared_link_disconnects_once() {
    let mut harness = open_session(test_session_config(), MockBehavior::default());
    assert!(harness.session.snapshot().await.unwrap().subscriptions.is_empty());

    harness.session.forward(reply_request()).unwrap();
    let cycle = harness.results_until_aggregate().await;

    assert_eq!(
        cycle,
        vec![
            ForwardingResult::ConnectOk,
            ForwardingResult::SubscribeOk,
            ForwardingResult::PublishOk,
            ForwardingResult::ForwardingSucceeded,
        ]
    );
    let awaiting = harness.session.snapshot().await.unwrap();
    assert_eq!(
        awaiting.subscriptions.get(RESPONSE_TOPIC),
        Some(&SubscriptionPhase::Awaiting)
    );
    assert_eq!(awaiting.live_timers, 1);
    assert_eq!(awaiting.primary, LinkState::Connected);

    let mut tail = harness.results_until(is_reply_resolution).await;
    tail.extend(harness.drain_results(Duration::from_millis(100)).await);

    assert_eq!(
        tail,
        vec![
            ForwardingResult::ReplyTimedOut(RESPONSE_TOPIC.to_string()),
            ForwardingResult::DisconnectOk,
        ]
    );
    let resolved = harness.session.snapshot().await.unwrap();
    assert!(resolved.subscriptions.is_empty());
    assert_eq!(resolved.live_timers, 0);
    assert_eq!(resolved.primary, LinkState::Idle);
    assert_eq!(harness.primary.disconnect_count(), 1);
    assert_eq!(harness.primary.unsubscribe_count(), 1);
}

#[tokio::test]
async fn test_reply_arrival_resolves_subscription() {
    let mut harness = open_session(test_session_config(), MockBehavior::default());

    harness.session.forward(reply_request()).unwrap();
    harness.results_until_aggregate().await;
    assert!(harness.primary.deliver(RESPONSE_TOPIC, "ack"));

    let tail = harness.results_until(is_reply_resolution).await;
    assert_eq!(
        tail,
        vec![ForwardingResult::ReplyArrived {
            topic: RESPONSE_TOPIC.to_string(),
            payload: b"ack".to_vec(),
        }]
    );

    // Wait past the reply timeout: the cancelled timer must not fire
    let trailing = harness.drain_results(Duration::from_millis(400)).await;
    assert_eq!(trailing, vec![ForwardingResult::DisconnectOk]);
    assert_eq!(harness.primary.disconnect_count(), 1);
    assert_eq!(
        harness.primary.calls().last(),
        Some(&TransportCall::Disconnect)
    );
}

#[tokio::test]
async fn test_duplicate_reply_is_delivered_once() {
    let mut harness = open_session(test_session_config(), MockBehavior::default());

    harness.session.forward(reply_request()).unwrap();
    harness.results_until_aggregate().await;
    harness.primary.deliver(RESPONSE_TOPIC, "first");
    harness.primary.deliver(RESPONSE_TOPIC, "second");

    let results = harness.drain_results(Duration::from_millis(400)).await;

    let replies: Vec<&ForwardingResult> = results
        .iter()
        .filter(|result| result.is_reply_resolution())
        .collect();
    assert_eq!(
        replies,
        vec![&ForwardingResult::ReplyArrived {
            topic: RESPONSE_TOPIC.to_string(),
            payload: b"first".to_vec(),
        }]
    );
}

#[tokio::test]
async fn test_message_on_topic_not_awaiting_is_ignored() {
    let mut config = test_session_config();
    config.reply.timeout = Duration::from_millis(400);
    let mut harness = open_session(config, MockBehavior::default());

    harness.session.subscribe("tags/a").unwrap();
    assert_eq!(harness.next_result().await, ForwardingResult::ConnectOk);
    assert_eq!(harness.next_result().await, ForwardingResult::SubscribeOk);
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.session.subscribe("tags/b").unwrap();
    assert_eq!(harness.next_result().await, ForwardingResult::SubscribeOk);

    // tags/a times out first; tags/b still holds the link open
    assert_eq!(
        harness.next_result().await,
        ForwardingResult::ReplyTimedOut("tags/a".to_string())
    );
    assert!(harness.primary.deliver("tags/a", "late"));
    assert!(harness.primary.deliver("tags/b", "on time"));

    let results = harness.results_until(is_reply_resolution).await;
    assert_eq!(
        results,
        vec![ForwardingResult::ReplyArrived {
            topic: "tags/b".to_string(),
            payload: b"on time".to_vec(),
        }]
    );
}

#[tokio::test]
async fn test_subscribe_to_awaiting_topic_is_noop() {
    let mut harness = open_session(test_session_config(), MockBehavior::default());

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();
    harness.session.subscribe(RESPONSE_TOPIC).unwrap();
    let results = harness
        .results_until(|result| *result == ForwardingResult::SubscribeOk)
        .await;
    harness.session.subscribe(RESPONSE_TOPIC).unwrap();

    let snapshot = harness.session.snapshot().await.unwrap();
    assert_eq!(snapshot.live_timers, 1);
    assert_eq!(count(&results, &ForwardingResult::SubscribeOk), 1);
    assert_eq!(harness.primary.subscribe_count(), 1);

    let rest = harness.results_until(is_reply_resolution).await;
    assert_eq!(count(&rest, &ForwardingResult::SubscribeOk), 0);
    assert_eq!(
        rest.last(),
        Some(&ForwardingResult::ReplyTimedOut(RESPONSE_TOPIC.to_string()))
    );
}

#[tokio::test]
async fn test_subscribe_failure_leaves_topic_unsubscribed() {
    let mut harness = open_session(
        test_session_config(),
        MockBehavior {
            fail_subscribe: Some("not authorized".to_string()),
            ..Default::default()
        },
    );

    harness.session.forward(reply_request()).unwrap();
    let cycle = harness.results_until_aggregate().await;

    assert_eq!(cycle[0], ForwardingResult::ConnectOk);
    assert!(matches!(cycle[1], ForwardingResult::SubscribeFailed(_)));
    assert_eq!(cycle[2], ForwardingResult::PublishOk);
    // No awaiting subscription, so the forward cycle owns the disconnect
    assert_eq!(cycle[3], ForwardingResult::DisconnectOk);
    assert_eq!(cycle[4], ForwardingResult::ForwardingSucceeded);
    assert!(harness.session.snapshot().await.unwrap().subscriptions.is_empty());
}

#[tokio::test]
async fn test_connect_failure_reports_subscribe_failure() {
    let mut harness = open_session(
        test_session_config(),
        MockBehavior {
            refuse_connect: Some("server unavailable".to_string()),
            ..Default::default()
        },
    );

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();

    assert_eq!(
        harness.next_result().await,
        ForwardingResult::ConnectFailed("server unavailable".to_string())
    );
    assert_eq!(
        harness.next_result().await,
        ForwardingResult::SubscribeFailed("server unavailable".to_string())
    );
    assert_eq!(harness.primary.subscribe_count(), 0);
}

#[tokio::test]
async fn test_dedicated_reply_link_owns_its_disconnect() {
    let mut config = test_session_config();
    config.reply.shared_connection = false;
    let mut harness =
        open_session_with_reply_link(config, MockBehavior::default(), MockBehavior::default());

    harness.session.forward(reply_request()).unwrap();
    let mut results = harness.results_until_aggregate().await;
    results.extend(harness.results_until(is_reply_resolution).await);
    results.extend(harness.drain_results(Duration::from_millis(100)).await);

    assert_eq!(count(&results, &ForwardingResult::ConnectOk), 2);
    assert_eq!(count(&results, &ForwardingResult::SubscribeOk), 1);
    assert_eq!(count(&results, &ForwardingResult::DisconnectOk), 2);
    assert_eq!(
        count(
            &results,
            &ForwardingResult::ReplyTimedOut(RESPONSE_TOPIC.to_string())
        ),
        1
    );
    assert_eq!(harness.primary.subscribe_count(), 0);
    assert_eq!(harness.primary.disconnect_count(), 1);
    assert_eq!(harness.reply_broker().subscribe_count(), 1);
    assert_eq!(harness.reply_broker().publish_count(), 0);
    assert_eq!(harness.reply_broker().disconnect_count(), 1);

    let snapshot = harness.session.snapshot().await.unwrap();
    assert_eq!(snapshot.reply, Some(LinkState::Idle));
}

#[tokio::test]
async fn test_reply_delivered_on_dedicated_link() {
    let mut config = test_session_config();
    config.reply.shared_connection = false;
    config.reply.timeout = Duration::from_secs(5);
    let mut harness =
        open_session_with_reply_link(config, MockBehavior::default(), MockBehavior::default());

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();
    harness
        .results_until(|result| *result == ForwardingResult::SubscribeOk)
        .await;
    assert!(harness.reply_broker().deliver(RESPONSE_TOPIC, "ack"));

    let results = harness.results_until(is_reply_resolution).await;
    assert_eq!(
        results.last(),
        Some(&ForwardingResult::ReplyArrived {
            topic: RESPONSE_TOPIC.to_string(),
            payload: b"ack".to_vec(),
        })
    );
    assert_eq!(harness.next_result().await, ForwardingResult::DisconnectOk);
    assert_eq!(harness.primary.connect_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_all_disconnects_once() {
    let mut config = test_session_config();
    config.reply.timeout = Duration::from_secs(5);
    let mut harness = open_session(config, MockBehavior::default());

    harness.session.subscribe("tags/a").unwrap();
    harness.session.subscribe("tags/b").unwrap();
    let subscribed = harness
        .results_until(|result| *result == ForwardingResult::SubscribeOk)
        .await;
    assert_eq!(subscribed[0], ForwardingResult::ConnectOk);
    assert_eq!(harness.next_result().await, ForwardingResult::SubscribeOk);

    harness.session.unsubscribe_all().unwrap();

    assert_eq!(harness.next_result().await, ForwardingResult::DisconnectOk);
    assert_eq!(harness.primary.unsubscribe_count(), 2);
    assert_eq!(harness.primary.disconnect_count(), 1);
    let snapshot = harness.session.snapshot().await.unwrap();
    assert!(snapshot.subscriptions.is_empty());
    assert_eq!(snapshot.live_timers, 0);
}

#[tokio::test]
async fn test_reconnect_restores_awaiting_subscription() {
    let mut config = test_session_config();
    config.reply.timeout = Duration::from_secs(5);
    let mut harness = open_session(config, MockBehavior::default());

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();
    harness
        .results_until(|result| *result == ForwardingResult::SubscribeOk)
        .await;

    assert!(harness.primary.drop_connection("keep alive timeout", true));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.session.snapshot().await.unwrap().primary,
        LinkState::Reconnecting
    );
    assert!(harness.primary.acknowledge());

    assert_eq!(harness.next_result().await, ForwardingResult::ConnectOk);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.primary.subscribe_count(), 2);
    assert!(harness.primary.deliver(RESPONSE_TOPIC, "after reconnect"));
    assert!(matches!(
        harness.next_result().await,
        ForwardingResult::ReplyArrived { .. }
    ));
}

#[tokio::test]
async fn test_refused_suback_fails_subscription() {
    let mut harness = open_session(
        test_session_config(),
        MockBehavior {
            refuse_subscribe: true,
            ..Default::default()
        },
    );

    harness.session.forward(reply_request()).unwrap();
    let cycle = harness.results_until_aggregate().await;

    assert_eq!(
        cycle,
        vec![
            ForwardingResult::ConnectOk,
            ForwardingResult::SubscribeFailed(format!(
                "broker refused subscription to {RESPONSE_TOPIC}"
            )),
            ForwardingResult::PublishOk,
            ForwardingResult::DisconnectOk,
            ForwardingResult::ForwardingSucceeded,
        ]
    );
    let snapshot = harness.session.snapshot().await.unwrap();
    assert!(snapshot.subscriptions.is_empty());
    assert_eq!(snapshot.live_timers, 0);
    assert_eq!(snapshot.awaiting_acks, 0);
    assert_eq!(snapshot.primary, LinkState::Idle);
}

#[tokio::test]
async fn test_subscribe_ok_waits_for_suback() {
    let mut harness = open_session(
        test_session_config(),
        MockBehavior {
            hold_acks: true,
            ..Default::default()
        },
    );

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();
    assert_eq!(harness.next_result().await, ForwardingResult::ConnectOk);
    assert!(harness.drain_results(Duration::from_millis(100)).await.is_empty());

    let pending = harness.session.snapshot().await.unwrap();
    assert!(pending.subscriptions.is_empty());
    assert_eq!(pending.awaiting_acks, 1);

    // A second subscribe while the first is unanswered is not sent again
    harness.session.subscribe(RESPONSE_TOPIC).unwrap();
    assert!(harness.primary.acknowledge_subscribe(true));

    assert_eq!(harness.next_result().await, ForwardingResult::SubscribeOk);
    let awaiting = harness.session.snapshot().await.unwrap();
    assert_eq!(
        awaiting.subscriptions.get(RESPONSE_TOPIC),
        Some(&SubscriptionPhase::Awaiting)
    );
    assert_eq!(awaiting.awaiting_acks, 0);
    assert_eq!(harness.primary.subscribe_count(), 1);
}

#[tokio::test]
async fn test_late_refusal_on_dedicated_link_releases_it() {
    let mut config = test_session_config();
    config.reply.shared_connection = false;
    let mut harness = open_session_with_reply_link(
        config,
        MockBehavior::default(),
        MockBehavior {
            hold_acks: true,
            ..Default::default()
        },
    );

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();
    assert_eq!(harness.next_result().await, ForwardingResult::ConnectOk);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.reply_broker().acknowledge_subscribe(false));

    assert!(matches!(
        harness.next_result().await,
        ForwardingResult::SubscribeFailed(_)
    ));
    assert_eq!(harness.next_result().await, ForwardingResult::DisconnectOk);
    assert!(harness.session.snapshot().await.unwrap().subscriptions.is_empty());
}

#[tokio::test]
async fn test_unanswered_subscribe_times_out() {
    let mut config = test_session_config();
    config.ack_timeout = Duration::from_millis(100);
    let mut harness = open_session(
        config,
        MockBehavior {
            hold_acks: true,
            ..Default::default()
        },
    );

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();

    assert_eq!(harness.next_result().await, ForwardingResult::ConnectOk);
    match harness.next_result().await {
        ForwardingResult::SubscribeFailed(reason) => {
            assert!(reason.contains("no acknowledgement"), "{reason}")
        }
        other => panic!("Expected SubscribeFailed, got {other:?}"),
    }
    assert_eq!(harness.next_result().await, ForwardingResult::DisconnectOk);

    // The SUBACK arriving after the timeout reaches nobody
    assert!(!harness.primary.acknowledge_subscribe(true));
    let snapshot = harness.session.snapshot().await.unwrap();
    assert!(snapshot.subscriptions.is_empty());
    assert_eq!(snapshot.live_timers, 0);
}

#[tokio::test]
async fn test_awaiting_subscription_restored_after_final_connection_loss() {
    let mut config = test_session_config();
    config.reply.timeout = Duration::from_secs(5);
    let mut harness = open_session(config, MockBehavior::default());

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();
    harness
        .results_until(|result| *result == ForwardingResult::SubscribeOk)
        .await;

    assert!(harness.primary.drop_connection("broker restarted", false));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let dropped = harness.session.snapshot().await.unwrap();
    assert_eq!(dropped.primary, LinkState::Idle);
    assert_eq!(
        dropped.subscriptions.get(RESPONSE_TOPIC),
        Some(&SubscriptionPhase::Awaiting)
    );

    harness
        .session
        .forward(ForwardRequest::new(DEFAULT_TOPIC, "[\"pallet-43\"]"))
        .unwrap();
    let cycle = harness.results_until_aggregate().await;

    assert_eq!(
        cycle,
        vec![
            ForwardingResult::ConnectOk,
            ForwardingResult::PublishOk,
            ForwardingResult::ForwardingSucceeded,
        ]
    );
    assert_eq!(harness.primary.subscribe_count(), 2);

    assert!(harness.primary.deliver(RESPONSE_TOPIC, "after restart"));
    assert!(matches!(
        harness.next_result().await,
        ForwardingResult::ReplyArrived { .. }
    ));
    assert_eq!(harness.next_result().await, ForwardingResult::DisconnectOk);
}

#[tokio::test]
async fn test_subscribe_reconnects_idle_link_for_awaiting_topic() {
    let mut config = test_session_config();
    config.reply.timeout = Duration::from_secs(5);
    let mut harness = open_session(config, MockBehavior::default());

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();
    harness
        .results_until(|result| *result == ForwardingResult::SubscribeOk)
        .await;
    assert!(harness.primary.drop_connection("broker restarted", false));
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.session.subscribe(RESPONSE_TOPIC).unwrap();

    assert_eq!(harness.next_result().await, ForwardingResult::ConnectOk);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.primary.connect_count(), 2);
    assert_eq!(harness.primary.subscribe_count(), 2);
    let snapshot = harness.session.snapshot().await.unwrap();
    assert_eq!(snapshot.live_timers, 1);
    assert_eq!(snapshot.primary, LinkState::Connected);
}

#[tokio::test]
async fn test_reply_without_response_topic_reports_subscribe_failure() {
    let mut config = test_session_config();
    config.reply.response_topic = None;
    let mut harness = open_session(config, MockBehavior::default());

    harness.session.forward(reply_request()).unwrap();
    let cycle = harness.results_until_aggregate().await;

    assert_eq!(
        cycle,
        vec![
            ForwardingResult::SubscribeFailed("no response topic configured".to_string()),
            ForwardingResult::ConnectOk,
            ForwardingResult::PublishOk,
            ForwardingResult::DisconnectOk,
            ForwardingResult::ForwardingSucceeded,
        ]
    );
    assert_eq!(harness.primary.subscribe_count(), 0);
}
