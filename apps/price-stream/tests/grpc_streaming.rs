//! gRPC Streaming Integration Tests
//!
//! Runs the real `PriceService` over TCP with in-memory backends and a
//! scripted price source, and checks what a client sees on the wire.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

mod common;

use chrono::DateTime;
use tonic::Code;

use common::{ScriptedSource, TestServer, WAIT, eventually, next, request, rfc3339_ago};
use price_stream::{HistoryStore, PriceStreamServerConfig};

// =============================================================================
// Replay Then Live
// =============================================================================

#[tokio::test]
async fn test_history_is_replayed_in_order_before_live_prices() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    let oldest = server.seed("USD", 30, 100.0).await;
    let middle = server.seed("USD", 20, 200.0).await;
    let newest = server.seed("USD", 10, 300.0).await;
    server.seed("EUR", 15, 999.0).await;

    let mut client = server.client().await;
    let mut stream = client
        .subscribe(request(&["USD"], &rfc3339_ago(60)))
        .await
        .unwrap()
        .into_inner();

    for expected in [&oldest, &middle, &newest] {
        let update = next(&mut stream).await;
        assert_eq!(update.currency, "USD");
        assert_eq!(update.timedate, expected.timedate());
        assert_eq!(update.price, expected.price());
    }

    let live = next(&mut stream).await;
    assert_eq!(live.currency, "USD");
    assert!(live.price >= 46_000.0);
    let live_at = DateTime::parse_from_rfc3339(&live.timedate).unwrap();
    assert!(live_at.timestamp() > newest.timestamp().timestamp());

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_start_time_limits_the_replay() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    server.seed("USD", 120, 100.0).await;
    let recent = server.seed("USD", 5, 200.0).await;

    let mut client = server.client().await;
    let mut stream = client
        .subscribe(request(&["USD"], &rfc3339_ago(60)))
        .await
        .unwrap()
        .into_inner();

    let first = next(&mut stream).await;
    assert_eq!(first.timedate, recent.timedate());
    assert_eq!(first.price, 200.0);

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_empty_start_time_skips_history() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    server.seed("USD", 10, 100.0).await;

    let mut client = server.client().await;
    let mut stream = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();

    let first = next(&mut stream).await;
    assert!(first.price >= 46_000.0, "got replayed price {}", first.price);

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_every_requested_currency_streams() {
    let server =
        TestServer::start(ScriptedSource::new(&[("USD", 46_000.0), ("EUR", 40_000.0)])).await;

    let mut client = server.client().await;
    let mut stream = client
        .subscribe(request(&["usd", "eur"], ""))
        .await
        .unwrap()
        .into_inner();

    let mut seen = std::collections::HashSet::new();
    while seen.len() < 2 {
        seen.insert(next(&mut stream).await.currency);
    }
    assert!(seen.contains("USD"));
    assert!(seen.contains("EUR"));

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_live_prices_are_cached_for_later_subscribers() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;

    let mut client = server.client().await;
    let mut stream = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    let live = next(&mut stream).await;
    drop(stream);

    let at = DateTime::parse_from_rfc3339(&live.timedate)
        .unwrap()
        .with_timezone(&chrono::Utc);
    let cached = server.store.query_range("USD", at, at).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].price(), live.price);

    server.stop().await;
}

// =============================================================================
// Request Validation
// =============================================================================

#[tokio::test]
async fn test_malformed_start_time_is_invalid_argument() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    let mut client = server.client().await;

    let status = client
        .subscribe(request(&["USD"], "yesterday"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(server.coordinator.registry().active_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_no_currencies_is_invalid_argument() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    let mut client = server.client().await;

    let status = client.subscribe(request(&[], "")).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    server.stop().await;
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_unknown_currency_ends_stream_with_not_found() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    let mut client = server.client().await;

    let mut stream = client
        .subscribe(request(&["XYZ"], ""))
        .await
        .unwrap()
        .into_inner();

    let status = tokio::time::timeout(WAIT, stream.message())
        .await
        .expect("stream did not fail in time")
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert!(status.message().contains("XYZ"));

    let coordinator = &server.coordinator;
    eventually(|| coordinator.active_subscriptions() == 0).await;
    server.stop().await;
}

#[tokio::test]
async fn test_history_store_outage_is_unavailable() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    server.set_store_down(true);
    let mut client = server.client().await;

    let status = match client.subscribe(request(&["USD"], &rfc3339_ago(60))).await {
        Err(status) => status,
        Ok(response) => {
            let mut stream = response.into_inner();
            tokio::time::timeout(WAIT, stream.message())
                .await
                .expect("stream did not fail in time")
                .unwrap_err()
        }
    };
    assert_eq!(status.code(), Code::Unavailable);

    let coordinator = &server.coordinator;
    eventually(|| coordinator.active_subscriptions() == 0).await;
    assert_eq!(server.coordinator.registry().active_count(), 0);

    server.set_store_down(false);
    let mut stream = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    next(&mut stream).await;

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_subscription_limit_is_resource_exhausted() {
    let config = PriceStreamServerConfig {
        max_subscriptions: 1,
        ..PriceStreamServerConfig::default()
    };
    let server =
        TestServer::start_with(ScriptedSource::new(&[("USD", 46_000.0)]), config).await;
    let mut client = server.client().await;

    let mut first = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    next(&mut first).await;

    let status = client.subscribe(request(&["USD"], "")).await.unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);

    drop(first);
    let grpc = &server.grpc;
    eventually(|| grpc.available_slots() == 1).await;

    let mut again = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    next(&mut again).await;

    drop(again);
    server.stop().await;
}
