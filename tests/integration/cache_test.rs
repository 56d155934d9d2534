// tests/integration/cache_test.rs

//! Integration tests for server-assisted client-side caching
//! Tests: population and hits, redirected invalidations (RESP2 and RESP3),
//! flush handling, broadcasting mode, repair after the invalidation
//! connection drops

use super::fixtures::{TEST_KEY1, TEST_VALUE1, TEST_VALUE2};
use super::test_helpers::{TestContext, wait_until};
use spineldb_client::{ClientSideCache, MemoryCache};
use std::sync::Arc;
use std::time::Duration;

async fn enable(ctx: &TestContext, cache: MemoryCache) -> Arc<MemoryCache> {
    let cache = Arc::new(cache);
    let plugin: Arc<dyn ClientSideCache> = cache.clone();
    assert!(ctx.client.use_client_side_caching_async(plugin).await.unwrap());
    cache
}

async fn value_becomes(ctx: &TestContext, key: &str, expected: &str) -> bool {
    wait_until(Duration::from_secs(3), || async {
        ctx.client.get_async(key.to_string()).await.unwrap().as_deref() == Some(expected.as_bytes())
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reads_are_served_from_cache() {
    let ctx = TestContext::new().await;
    let cache = enable(&ctx, MemoryCache::new()).await;

    ctx.client.set_async(TEST_KEY1, TEST_VALUE1).await.unwrap();
    for _ in 0..3 {
        let value = ctx.client.get_async(TEST_KEY1).await.unwrap();
        assert_eq!(value.as_deref(), Some(TEST_VALUE1.as_bytes()));
    }

    assert_eq!(ctx.server.command_count("GET"), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(ctx.client.cache_coordinator().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_from_elsewhere_invalidates_entry() {
    let ctx = TestContext::new().await;
    enable(&ctx, MemoryCache::new()).await;

    ctx.client.set_async(TEST_KEY1, TEST_VALUE1).await.unwrap();
    ctx.client.get_async(TEST_KEY1).await.unwrap();

    ctx.server.set_value(TEST_KEY1, TEST_VALUE2);
    assert!(value_becomes(&ctx, TEST_KEY1, TEST_VALUE2).await);
    assert!(ctx.server.command_count("GET") >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_own_write_invalidates_entry() {
    let ctx = TestContext::new().await;
    enable(&ctx, MemoryCache::new()).await;

    ctx.client.set_async(TEST_KEY1, TEST_VALUE1).await.unwrap();
    ctx.client.get_async(TEST_KEY1).await.unwrap();
    ctx.client.set_async(TEST_KEY1, TEST_VALUE2).await.unwrap();

    assert!(value_becomes(&ctx, TEST_KEY1, TEST_VALUE2).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resp3_invalidations_arrive_as_push() {
    let ctx = TestContext::resp3().await;
    enable(&ctx, MemoryCache::new()).await;

    ctx.client.set_async(TEST_KEY1, TEST_VALUE1).await.unwrap();
    ctx.client.get_async(TEST_KEY1).await.unwrap();
    ctx.client.get_async(TEST_KEY1).await.unwrap();
    assert_eq!(ctx.server.command_count("GET"), 1);

    ctx.server.set_value(TEST_KEY1, TEST_VALUE2);
    assert!(value_becomes(&ctx, TEST_KEY1, TEST_VALUE2).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_clears_every_entry() {
    let ctx = TestContext::new().await;
    let cache = enable(&ctx, MemoryCache::new()).await;

    for (key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
        ctx.client.set_async(key, value).await.unwrap();
        ctx.client.get_async(key).await.unwrap();
    }
    assert_eq!(cache.len(), 3);

    ctx.server.flush_all();
    assert!(wait_until(Duration::from_secs(3), || async { cache.is_empty() }).await);
    assert!(ctx.client.cache_coordinator().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_cache_is_ignored() {
    let ctx = TestContext::new().await;
    enable(&ctx, MemoryCache::new()).await;

    let second: Arc<dyn ClientSideCache> = Arc::new(MemoryCache::new());
    assert!(!ctx.client.use_client_side_caching_async(second).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_excluded_keys_are_not_cached() {
    let ctx = TestContext::new().await;
    enable(&ctx, MemoryCache::new().with_exclude("session:*")).await;

    ctx.client.set_async("session:1", "x").await.unwrap();
    ctx.client.get_async("session:1").await.unwrap();
    ctx.client.get_async("session:1").await.unwrap();

    assert_eq!(ctx.server.command_count("GET"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcasting_mode_tracks_prefixes() {
    let ctx = TestContext::new().await;
    // Written before tracking starts so no broadcast races the first fill.
    ctx.server.set_value("user:1", "ada");
    ctx.server.set_value("post:1", "hello");
    let cache = enable(&ctx, MemoryCache::broadcasting(["user:"])).await;

    for _ in 0..2 {
        ctx.client.get_async("user:1").await.unwrap();
        ctx.client.get_async("post:1").await.unwrap();
    }
    // Only the prefixed key is cached.
    assert_eq!(ctx.server.command_count("GET"), 3);
    assert_eq!(cache.len(), 1);

    ctx.server.set_value("user:1", "grace");
    assert!(value_becomes(&ctx, "user:1", "grace").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_recovers_after_invalidation_connection_drops() {
    let ctx = TestContext::new().await;
    let cache = enable(&ctx, MemoryCache::new()).await;
    let coordinator = ctx.client.cache_coordinator().unwrap().clone();

    ctx.client.set_async(TEST_KEY1, TEST_VALUE1).await.unwrap();
    ctx.client.get_async(TEST_KEY1).await.unwrap();
    assert_eq!(cache.len(), 1);
    let first_redirect = ctx.server.tracking_redirects()[0];

    assert_eq!(ctx.server.kill_subscribers(), 1);
    assert!(wait_until(Duration::from_secs(3), || async { !coordinator.is_online() }).await);
    assert!(cache.is_empty());

    // While offline every read goes to the server.
    ctx.client.get_async(TEST_KEY1).await.unwrap();
    assert_eq!(ctx.server.command_count("GET"), 2);

    let summary = ctx.client.run_idle_sweep().await;
    assert_eq!(summary.subscriptions_replaced, 1);
    assert!(coordinator.is_online());

    // The next checkout re-arms tracking towards the new connection.
    ctx.client.get_async(TEST_KEY1).await.unwrap();
    let redirects = ctx.server.tracking_redirects();
    assert!(!redirects.is_empty());
    assert!(redirects.iter().all(|id| *id != first_redirect));

    ctx.server.set_value(TEST_KEY1, TEST_VALUE2);
    assert!(value_becomes(&ctx, TEST_KEY1, TEST_VALUE2).await);
}
