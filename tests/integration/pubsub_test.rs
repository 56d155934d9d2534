// tests/integration/pubsub_test.rs

//! Integration tests for Pub/Sub
//! Tests: SUBSCRIBE, PSUBSCRIBE, SSUBSCRIBE, UNSUBSCRIBE, connection packing,
//! resubscription after a dropped connection

use super::test_helpers::{TestContext, wait_until};
use bytes::Bytes;
use spineldb_client::core::pubsub::{Payload, PayloadFormat, PubSubMessage, Subscription, SubscriptionKind};
use spineldb_client::{ClientError, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Inbox = Arc<Mutex<Vec<PubSubMessage>>>;

fn collector(format: PayloadFormat) -> (Inbox, Subscription) {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    let sub = Subscription::new(
        Arc::new(move |m: PubSubMessage| sink.lock().unwrap().push(m)),
        format,
    );
    (inbox, sub)
}

fn names(list: &[&str]) -> Vec<Bytes> {
    list.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
}

/// Publishes until at least one receiver is reported. The subscribe command
/// is written without waiting for its ack, so the first publish may race it.
async fn publish_until_received(ctx: &TestContext, channel: &str, message: &str) {
    let delivered = wait_until(Duration::from_secs(3), || async {
        ctx.client.publish_async(channel.to_string(), message.to_string()).await.unwrap_or(0) >= 1
    })
    .await;
    assert!(delivered, "nobody received the message on '{channel}'");
}

async fn wait_for_messages(inbox: &Inbox, count: usize) -> bool {
    wait_until(Duration::from_secs(3), || async { inbox.lock().unwrap().len() >= count }).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscribe_and_receive() {
    let ctx = TestContext::new().await;
    let (inbox, sub) = collector(PayloadFormat::Text);

    ctx.client
        .subscribe_with_async(SubscriptionKind::Channel, names(&["news"]), sub)
        .await
        .unwrap();
    publish_until_received(&ctx, "news", "hello").await;

    assert!(wait_for_messages(&inbox, 1).await);
    let got = inbox.lock().unwrap()[0].clone();
    assert_eq!(got.kind, SubscriptionKind::Channel);
    assert_eq!(got.channel, Bytes::from_static(b"news"));
    assert_eq!(got.pattern, None);
    assert_eq!(got.payload, Payload::Text("hello".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pattern_subscription_reports_pattern() {
    let ctx = TestContext::new().await;
    let (inbox, sub) = collector(PayloadFormat::Bytes);

    ctx.client
        .subscribe_with_async(SubscriptionKind::Pattern, names(&["news.*"]), sub)
        .await
        .unwrap();
    publish_until_received(&ctx, "news.sport", "goal").await;

    assert!(wait_for_messages(&inbox, 1).await);
    let got = inbox.lock().unwrap()[0].clone();
    assert_eq!(got.kind, SubscriptionKind::Pattern);
    assert_eq!(got.channel, Bytes::from_static(b"news.sport"));
    assert_eq!(got.pattern, Some(Bytes::from_static(b"news.*")));
    assert_eq!(got.payload, Payload::Bytes(Bytes::from_static(b"goal")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shard_subscription() {
    let ctx = TestContext::new().await;
    let (inbox, sub) = collector(PayloadFormat::Text);

    ctx.client
        .subscribe_with_async(SubscriptionKind::Shard, names(&["orders"]), sub)
        .await
        .unwrap();
    let delivered = wait_until(Duration::from_secs(3), || async {
        let reply = ctx
            .client
            .execute_async(&Command::new("SPUBLISH").arg("orders").arg("created"))
            .await;
        matches!(reply, Ok(spineldb_client::RespFrame::Integer(n)) if n >= 1)
    })
    .await;
    assert!(delivered);

    assert!(wait_for_messages(&inbox, 1).await);
    assert_eq!(inbox.lock().unwrap()[0].kind, SubscriptionKind::Shard);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsubscribe_stops_delivery() {
    let ctx = TestContext::new().await;
    let (_inbox, sub) = collector(PayloadFormat::Text);

    ctx.client
        .subscribe_with_async(SubscriptionKind::Channel, names(&["a", "b"]), sub)
        .await
        .unwrap();
    publish_until_received(&ctx, "a", "1").await;

    let removed = ctx
        .client
        .unsubscribe_with_async(SubscriptionKind::Channel, names(&["a"]))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(
        wait_until(Duration::from_secs(3), || async {
            ctx.client.publish_async("a", "2").await.unwrap() == 0
        })
        .await
    );
    assert_eq!(ctx.client.publish_async("b", "3").await.unwrap(), 1);

    // An empty list removes the rest of the kind.
    let removed = ctx
        .client
        .unsubscribe_with_async(SubscriptionKind::Channel, Vec::new())
        .await
        .unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscriptions_are_packed_per_connection() {
    let ctx = TestContext::with_options(|o| o.subscription_concurrency = 2).await;

    for channel in ["c1", "c2", "c3"] {
        let (_inbox, sub) = collector(PayloadFormat::Text);
        ctx.client
            .subscribe_with_async(SubscriptionKind::Channel, names(&[channel]), sub)
            .await
            .unwrap();
    }
    // Re-subscribing an existing name reuses its connection.
    let (_inbox, sub) = collector(PayloadFormat::Text);
    ctx.client
        .subscribe_with_async(SubscriptionKind::Channel, names(&["c3"]), sub)
        .await
        .unwrap();

    assert_eq!(ctx.server.accepted(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_call_spreads_names_over_connections() {
    let ctx = TestContext::with_options(|o| o.subscription_concurrency = 2).await;

    let (_inbox, sub) = collector(PayloadFormat::Text);
    ctx.client
        .subscribe_with_async(SubscriptionKind::Channel, names(&["c1", "c2", "c3"]), sub)
        .await
        .unwrap();
    let packed = wait_until(Duration::from_secs(2), || async {
        ctx.server.subscription_counts() == vec![1, 2]
    })
    .await;
    assert!(packed, "got {:?}", ctx.server.subscription_counts());

    // Known names stay where they are; new ones fill the spare slot first.
    let (_inbox, sub) = collector(PayloadFormat::Text);
    ctx.client
        .subscribe_with_async(SubscriptionKind::Channel, names(&["c1", "c3", "c4"]), sub)
        .await
        .unwrap();
    let packed = wait_until(Duration::from_secs(2), || async {
        ctx.server.subscription_counts() == vec![2, 2]
    })
    .await;
    assert!(packed, "got {:?}", ctx.server.subscription_counts());
    assert_eq!(ctx.server.accepted(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_during_sweep_leaves_no_subscription_connection() {
    let ctx = TestContext::new().await;
    let (_inbox, sub) = collector(PayloadFormat::Text);
    ctx.client
        .subscribe_with_async(SubscriptionKind::Channel, names(&["alerts"]), sub)
        .await
        .unwrap();
    publish_until_received(&ctx, "alerts", "first").await;

    assert_eq!(ctx.server.kill_subscribers(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Slow replies keep the sweep busy reconnecting while the client closes.
    ctx.server.split_replies(true);
    let client = ctx.client.clone();
    let sweep = tokio::spawn(async move { client.run_idle_sweep().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.client.close();
    sweep.await.unwrap();

    let released = wait_until(Duration::from_secs(3), || async {
        ctx.server.open_connections() == 0
    })
    .await;
    assert!(released, "{} connection(s) left open", ctx.server.open_connections());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_channel_list_is_rejected() {
    let ctx = TestContext::new().await;
    let err = ctx
        .client
        .subscribe_with_async(SubscriptionKind::Channel, Vec::new(), Subscription::noop())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidConfig(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscriptions_survive_a_dropped_connection() {
    let ctx = TestContext::new().await;
    let (inbox, sub) = collector(PayloadFormat::Text);

    ctx.client
        .subscribe_with_async(SubscriptionKind::Channel, names(&["alerts"]), sub)
        .await
        .unwrap();
    publish_until_received(&ctx, "alerts", "first").await;
    assert!(wait_for_messages(&inbox, 1).await);

    assert_eq!(ctx.server.kill_subscribers(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = ctx.client.run_idle_sweep().await;
    assert_eq!(summary.subscriptions_replaced, 1);

    publish_until_received(&ctx, "alerts", "second").await;
    assert!(wait_for_messages(&inbox, 2).await);
    let last = inbox.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.payload, Payload::Text("second".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_subscribe_api() {
    let ctx = TestContext::new().await;
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    let client = ctx.client.clone();

    tokio::task::spawn_blocking(move || {
        client.subscribe(&["blocking"], move |m| sink.lock().unwrap().push(m))
    })
    .await
    .unwrap()
    .unwrap();

    publish_until_received(&ctx, "blocking", "hi").await;
    assert!(wait_for_messages(&inbox, 1).await);

    let client = ctx.client.clone();
    let removed = tokio::task::spawn_blocking(move || client.unsubscribe(&["blocking"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(removed, 1);
}
