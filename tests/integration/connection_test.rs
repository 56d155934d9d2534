// tests/integration/connection_test.rs

//! Integration tests for single connections and the call dispatcher
//! Tests: round trips, partial frames, timeouts and cancellation, pipelines,
//! handshake options, the blocking API

use super::fixtures::{MockServer, TEST_KEY1, TEST_KEY2, TEST_VALUE1, TEST_VALUE2};
use super::test_helpers::{TestContext, init_tracing, options_for};
use bytes::Bytes;
use spineldb_client::{CancellationToken, Client, ClientError, Command, RespFrame, RespProtocol};
use std::time::{Duration, Instant};

fn sleep_cmd(ms: u64) -> Command {
    Command::new("SLEEP").arg(ms.to_string())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_set_then_get() {
    let ctx = TestContext::new().await;

    ctx.client.set_async(TEST_KEY1, TEST_VALUE1).await.unwrap();
    let value = ctx.client.get_async(TEST_KEY1).await.unwrap();
    assert_eq!(value, Some(Bytes::from_static(TEST_VALUE1.as_bytes())));

    assert_eq!(ctx.client.get_async(TEST_KEY2).await.unwrap(), None);
    assert_eq!(ctx.client.del_async([TEST_KEY1, TEST_KEY2]).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_error_reply_is_returned_as_error() {
    let ctx = TestContext::new().await;

    let err = ctx
        .client
        .execute_async(&Command::new("NOSUCHCOMMAND"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Server(ref msg) if msg.starts_with("ERR unknown command")));

    // A server error does not poison the connection.
    ctx.client.ping_async().await.unwrap();
    assert_eq!(ctx.server.accepted(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replies_split_across_reads() {
    let ctx = TestContext::new().await;
    ctx.server.split_replies(true);

    ctx.client.set_async(TEST_KEY1, TEST_VALUE2).await.unwrap();
    let value = ctx.client.get_async(TEST_KEY1).await.unwrap();
    assert_eq!(value.as_deref(), Some(TEST_VALUE2.as_bytes()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_wins_over_timeout() {
    let ctx = TestContext::with_options(|o| o.command_timeout_ms = 400).await;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = ctx
        .client
        .execute_async_with(&sleep_cmd(2_000), Some(&token))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_command_timeout_without_cancellation() {
    let ctx = TestContext::with_options(|o| o.command_timeout_ms = 400).await;

    let started = Instant::now();
    let err = ctx
        .client
        .execute_async(&sleep_cmd(2_000))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::CommandTimeout { timeout_ms: 400, .. }), "got {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timed_out_connection_is_not_reused() {
    let ctx = TestContext::with_options(|o| {
        o.command_timeout_ms = 200;
        o.max_pool_size = 1;
    })
    .await;

    let err = ctx.client.execute_async(&sleep_cmd(1_000)).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(ctx.client.stats().live, 0);

    // The late reply to SLEEP must not be read as the reply to PING.
    ctx.client.ping_async().await.unwrap();
    assert_eq!(ctx.server.accepted(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pipeline_preserves_order_and_inline_errors() {
    let ctx = TestContext::new().await;

    let mut pipeline = ctx.client.pipeline();
    pipeline
        .add(Command::new("SET").key(TEST_KEY1).arg("1"))
        .add(Command::new("BOGUS"))
        .add(Command::new("GET").key(TEST_KEY1))
        .add(Command::new("DEL").key(TEST_KEY1));
    assert_eq!(pipeline.len(), 4);

    let replies = pipeline.execute_async().await.unwrap();
    assert!(pipeline.is_empty());
    assert_eq!(replies.len(), 4);
    assert!(replies[0].is_ok());
    assert!(matches!(replies[1], RespFrame::Error(_)));
    assert_eq!(replies[2], RespFrame::BulkString(Bytes::from_static(b"1")));
    assert_eq!(replies[3], RespFrame::Integer(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resp3_handshake_sets_name_and_database() {
    let ctx = TestContext::with_options(|o| {
        o.protocol = RespProtocol::Resp3;
        o.client_name = Some("worker".to_string());
        o.database = 3;
    })
    .await;

    ctx.client.ping_async().await.unwrap();
    assert_eq!(ctx.server.client_names(), vec!["worker".to_string()]);
    assert_eq!(ctx.server.databases(), vec![3]);

    let conn = ctx.client.master_pool().get_connection_async(None).await.unwrap();
    assert_eq!(conn.database(), 3);
    assert!(conn.client_id() >= 100);
    assert_eq!(conn.name(), Some("worker"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resp2_handshake_authenticates() {
    init_tracing();
    let server = MockServer::start_with_password(Some("secret")).await;

    let mut options = options_for(&server);
    options.password = Some("secret".to_string());
    options.client_name = Some("auth-test".to_string());
    let client = Client::new(options).unwrap();
    client.ping_async().await.unwrap();
    assert_eq!(server.command_count("AUTH"), 1);
    assert_eq!(server.client_names(), vec!["auth-test".to_string()]);
    client.close();

    let mut options = options_for(&server);
    options.password = Some("wrong".to_string());
    let client = Client::new(options).unwrap();
    let err = client.ping_async().await.unwrap_err();
    assert!(matches!(err, ClientError::Handshake(ref msg) if msg.contains("WRONGPASS")));
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_key_prefix_is_applied_on_the_wire() {
    let ctx = TestContext::with_options(|o| o.prefix = Some("app:".to_string())).await;

    ctx.client.set_async("user", "ada").await.unwrap();
    assert_eq!(ctx.server.value("app:user"), Some(Bytes::from_static(b"ada")));
    assert_eq!(ctx.server.value("user"), None);
    assert_eq!(
        ctx.client.get_async("user").await.unwrap(),
        Some(Bytes::from_static(b"ada"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_api_from_plain_thread() {
    let ctx = TestContext::new().await;
    let client = ctx.client.clone();

    let value = tokio::task::spawn_blocking(move || {
        client.ping()?;
        client.set(TEST_KEY2, TEST_VALUE2)?;
        let mut pipeline = client.pipeline();
        pipeline.add(Command::new("GET").key(TEST_KEY2));
        let replies = pipeline.execute()?;
        assert_eq!(replies.len(), 1);
        client.get(TEST_KEY2)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(value.as_deref(), Some(TEST_VALUE2.as_bytes()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_string_client() {
    init_tracing();
    let server = MockServer::start().await;
    let client = Client::from_connection_string(&format!(
        "127.0.0.1:{},poolsize=2,name=from-string,defaultDatabase=1",
        server.port()
    ))
    .unwrap();

    client.ping_async().await.unwrap();
    assert_eq!(client.options().max_pool_size, 2);
    assert_eq!(server.client_names(), vec!["from-string".to_string()]);
    assert_eq!(server.databases(), vec![1]);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_failure_frees_the_slot() {
    init_tracing();
    // Bind and drop a listener to find a port nobody listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = Client::new(spineldb_client::ConnectionOptions {
        port,
        max_pool_size: 1,
        connect_timeout_ms: 500,
        command_timeout_ms: 500,
        ..Default::default()
    })
    .unwrap();

    assert!(client.ping_async().await.is_err());
    assert_eq!(client.stats().live, 0);
    assert!(client.ping_async().await.is_err());
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_batch_is_rejected_without_touching_the_socket() {
    let ctx = TestContext::new().await;
    let conn = ctx.client.master_pool().get_connection_async(None).await.unwrap();

    let err = conn.execute_batch_async(&[], None).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidConfig(_)), "got {err:?}");

    // The connection is still usable afterwards.
    assert!(conn.is_connected());
    let reply = conn
        .execute_async(&spineldb_client::core::commands::ping(), None)
        .await
        .unwrap();
    assert_eq!(reply, RespFrame::SimpleString("PONG".into()));
}
