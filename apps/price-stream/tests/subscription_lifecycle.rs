//! Subscription Lifecycle Integration Tests
//!
//! Checks that pollers are shared between subscriptions of one instrument
//! and released once the last client leaves, and that server shutdown ends
//! open streams.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{ScriptedSource, TestServer, WAIT, eventually, next, request};

#[tokio::test]
async fn test_client_disconnect_releases_the_poller() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    let mut client = server.client().await;

    let mut stream = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    next(&mut stream).await;

    let coordinator = &server.coordinator;
    assert_eq!(coordinator.registry().active_count(), 1);
    assert_eq!(coordinator.active_subscriptions(), 1);

    drop(stream);

    eventually(|| coordinator.registry().active_count() == 0).await;
    eventually(|| coordinator.active_subscriptions() == 0).await;

    // The stopped poller no longer calls upstream.
    let calls = server.source.calls();
    tokio::time::sleep(common::POLL * 5).await;
    assert!(server.source.calls() <= calls + 1);

    server.stop().await;
}

#[tokio::test]
async fn test_subscriptions_of_one_currency_share_a_poller() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    let mut client = server.client().await;

    let mut first = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    let mut second = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    next(&mut first).await;
    next(&mut second).await;

    let registry = server.coordinator.registry();
    assert_eq!(registry.active_count(), 1);
    assert_eq!(registry.lease_count("USD"), 2);

    drop(first);
    eventually(|| registry.lease_count("USD") == 1).await;
    assert_eq!(registry.active_count(), 1);

    // The remaining subscriber keeps receiving prices.
    next(&mut second).await;

    drop(second);
    eventually(|| registry.active_count() == 0).await;
    server.stop().await;
}

#[tokio::test]
async fn test_both_subscribers_see_the_same_live_prices() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    let mut client = server.client().await;

    let mut first = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    let mut second = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();

    // Both are attached to one poller, so after each has caught up on its
    // first update the following ones are identical.
    let a = next(&mut first).await;
    let b = next(&mut second).await;
    let (mut a, mut b) = (a, b);
    while a.timedate != b.timedate {
        if a.timedate < b.timedate {
            a = next(&mut first).await;
        } else {
            b = next(&mut second).await;
        }
    }
    assert_eq!(a, b);
    assert_eq!(next(&mut first).await, next(&mut second).await);

    drop((first, second));
    server.stop().await;
}

#[tokio::test]
async fn test_server_shutdown_ends_open_streams() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    let mut client = server.client().await;

    let mut stream = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    next(&mut stream).await;

    server.shutdown.cancel();

    // Updates already buffered may still arrive; the stream then ends.
    let ended = tokio::time::timeout(WAIT, async {
        loop {
            match stream.message().await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "stream stayed open after shutdown");

    let coordinator = &server.coordinator;
    eventually(|| coordinator.active_subscriptions() == 0).await;
    eventually(|| coordinator.registry().active_count() == 0).await;
    server.stop().await;
}

#[tokio::test]
async fn test_failed_subscription_leaves_the_server_usable() {
    let server = TestServer::start(ScriptedSource::new(&[("USD", 46_000.0)])).await;
    let mut client = server.client().await;

    let mut doomed = client
        .subscribe(request(&["XYZ"], ""))
        .await
        .unwrap()
        .into_inner();
    let status = tokio::time::timeout(WAIT, doomed.message())
        .await
        .expect("stream did not fail in time")
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);

    let registry = server.coordinator.registry();
    eventually(|| registry.active_count() == 0).await;

    let mut healthy = client
        .subscribe(request(&["USD"], ""))
        .await
        .unwrap()
        .into_inner();
    next(&mut healthy).await;

    drop(healthy);
    server.stop().await;
}
