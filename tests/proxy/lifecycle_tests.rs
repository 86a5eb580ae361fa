//! Session lifecycle tests
//!
//! Covers reaping, cancellation, backend crashes and proxy shutdown as seen
//! from connected clients.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use xlang_proxy::jsonrpc::codes;
use xlang_proxy::protocol::{HOVER, SHUT_DOWN_IDLE_SESSIONS};
use xlang_proxy::testing::{
    connect, position_params, wait_until, FakeBackendOptions, FakeLauncher,
};
use xlang_proxy::{ProxyError, ProxyOptions, SessionKey};

use crate::common::{error_code, fast_options, ProxyFixture, MODE};

const SETTLE: Duration = Duration::from_secs(5);

// ============================================================================
// REAPING
// ============================================================================

#[tokio::test]
async fn test_reap_all_then_cold_start() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;
    let document = fixture.document("mux.go");
    client.position(HOVER, &document, 0, 0).await.unwrap();

    let stats = fixture.proxy.shut_down_idle_sessions(Duration::ZERO).await;
    assert_eq!(stats.reaped, 1);
    assert_eq!(stats.remaining, 0);
    assert_eq!(fixture.launcher.live_backends(), 0);

    // Reaping again is a no-op
    let stats = fixture.proxy.shut_down_idle_sessions(Duration::ZERO).await;
    assert_eq!(stats.reaped, 0);

    // The same connection transparently gets a fresh session
    let hover = client.position(HOVER, &document, 0, 9).await.unwrap();
    assert_eq!(hover["contents"]["value"], json!("mux"));
    assert_eq!(fixture.launcher.launches(), 2);
    assert_eq!(fixture.source.fetch_count(), 2);
    assert_eq!(fixture.proxy.registry().len(), 1);
}

#[tokio::test]
async fn test_reap_frees_workspace_of_idle_connected_client() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;
    let document = fixture.document("mux.go");
    client.position(HOVER, &document, 5, 7).await.unwrap();

    let session = fixture
        .proxy
        .registry()
        .get(&SessionKey::new(MODE, fixture.root.clone()))
        .expect("session is registered");
    assert!(session.filesystem().is_loaded());
    let filesystem = Arc::downgrade(session.filesystem());
    drop(session);

    let stats = fixture.proxy.shut_down_idle_sessions(Duration::ZERO).await;
    assert_eq!(stats.reaped, 1);

    // The client is still connected, yet nothing keeps the cache alive
    assert!(wait_until(SETTLE, || filesystem.strong_count() == 0).await);

    let hover = client.position(HOVER, &document, 5, 7).await.unwrap();
    assert_eq!(hover["contents"]["value"], json!("NewRouter"));
    assert_eq!(fixture.source.fetch_count(), 2);
}

#[tokio::test]
async fn test_shut_down_idle_sessions_request() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;

    let result = client
        .call(SHUT_DOWN_IDLE_SESSIONS, json!({ "olderThanMs": 0 }))
        .await
        .unwrap();

    assert_eq!(result, json!({ "reaped": 1, "remaining": 0 }));
    assert!(fixture.proxy.registry().is_empty());

    // A generous threshold leaves fresh sessions alone
    client
        .position(HOVER, &fixture.document("mux.go"), 0, 0)
        .await
        .unwrap();
    let result = client
        .call(SHUT_DOWN_IDLE_SESSIONS, json!({ "olderThanMs": 3_600_000 }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "reaped": 0, "remaining": 1 }));
}

#[tokio::test]
async fn test_reap_skips_busy_session() {
    let fixture = ProxyFixture::with_launcher(FakeLauncher::with_latency(Duration::from_millis(300)));
    let client = Arc::new(fixture.client().await);
    let document = fixture.document("mux.go");

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.position(HOVER, &document, 5, 7).await })
    };
    let registry = fixture.proxy.registry().clone();
    assert!(wait_until(SETTLE, || registry.stats().in_flight == 1).await);

    let stats = fixture.proxy.shut_down_idle_sessions(Duration::ZERO).await;
    assert_eq!(stats.reaped, 0);
    assert_eq!(stats.remaining, 1);

    let hover = pending.await.unwrap().unwrap();
    assert_eq!(hover["contents"]["value"], json!("NewRouter"));
    assert_eq!(fixture.launcher.launches(), 1);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn test_abandoned_request_is_cancelled() {
    let fixture = ProxyFixture::with_launcher(FakeLauncher::with_latency(Duration::from_secs(10)));
    let client = fixture.client().await;
    let params = position_params(&fixture.document("mux.go"), 0, 0);

    let err = client
        .channel()
        .call_with_timeout(HOVER, params, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Timeout { .. }), "got {err:?}");

    // The client's cancel propagates: the proxy stops waiting on the backend
    let registry = fixture.proxy.registry().clone();
    assert!(wait_until(SETTLE, || registry.stats().in_flight == 0).await);

    // Nothing is left pending and the session still serves requests
    assert_eq!(client.channel().pending_requests(), 0);
    let stats = fixture.proxy.shut_down_idle_sessions(Duration::ZERO).await;
    assert_eq!(stats.reaped, 1);
}

#[tokio::test]
async fn test_disconnect_cancels_in_flight_requests() {
    let fixture = ProxyFixture::with_launcher(FakeLauncher::with_latency(Duration::from_secs(10)));
    let client = Arc::new(fixture.client().await);
    let document = fixture.document("mux.go");

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.position(HOVER, &document, 0, 0).await })
    };
    let registry = fixture.proxy.registry().clone();
    assert!(wait_until(SETTLE, || registry.stats().in_flight == 1).await);

    client.channel().close("client went away").await;
    assert!(pending.await.unwrap().is_err());
    assert!(wait_until(SETTLE, || registry.stats().in_flight == 0).await);

    // The session outlives the connection
    assert_eq!(registry.len(), 1);
    assert_eq!(fixture.launcher.live_backends(), 1);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_backend_crash_respawns_session() {
    let fixture = ProxyFixture::build(
        FakeLauncher::new(),
        xlang_proxy::testing::MemorySource::new(),
        fast_options(),
    );
    let client = fixture.client().await;
    let document = fixture.document("mux.go");
    client.position(HOVER, &document, 0, 0).await.unwrap();

    fixture.launcher.crash_all().await;
    let registry = fixture.proxy.registry().clone();
    assert!(
        wait_until(SETTLE, || registry
            .sessions()
            .iter()
            .all(|session| !session.is_alive()))
        .await
    );

    let hover = client.position(HOVER, &document, 5, 7).await.unwrap();
    assert_eq!(hover["contents"]["value"], json!("NewRouter"));
    assert_eq!(fixture.launcher.launches(), 2);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_failed_initialize_is_retried() {
    let fixture = ProxyFixture::with_launcher(FakeLauncher::with_options(FakeBackendOptions {
        fail_initialize: true,
        ..FakeBackendOptions::default()
    }));

    for attempt in 1..=2 {
        let client = connect(&fixture.proxy);
        let err = client.initialize(&fixture.root, MODE).await.unwrap_err();
        assert_eq!(error_code(&err), codes::INTERNAL_ERROR);
        assert!(fixture.proxy.registry().is_empty());
        assert_eq!(fixture.launcher.launches(), attempt);
    }
}

#[tokio::test]
async fn test_session_cap() {
    let fixture = ProxyFixture::with_options(ProxyOptions {
        max_sessions: 1,
        ..ProxyOptions::default()
    });
    let _go = fixture.client_for(&fixture.root, "go").await;

    let client = connect(&fixture.proxy);
    let err = client.initialize(&fixture.root, "python").await.unwrap_err();
    assert_eq!(error_code(&err), codes::RESOURCE_EXHAUSTED);

    // Reaping frees the slot
    fixture.proxy.shut_down_idle_sessions(Duration::ZERO).await;
    assert!(client.initialize(&fixture.root, "python").await.is_ok());
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_client_close_keeps_session() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;
    client.close().await;

    assert_eq!(fixture.proxy.registry().len(), 1);
    let _again = fixture.client().await;
    assert_eq!(fixture.launcher.launches(), 1);
}

#[tokio::test]
async fn test_proxy_shutdown_stops_every_backend() {
    let fixture = ProxyFixture::new();
    let _go = fixture.client_for(&fixture.root, "go").await;
    let _ts = fixture.client_for(&fixture.root, "typescript").await;
    assert_eq!(fixture.launcher.live_backends(), 2);

    fixture.proxy.shutdown().await;

    assert!(fixture.proxy.registry().is_empty());
    assert_eq!(fixture.launcher.live_backends(), 0);
}
