//! Request routing tests
//!
//! Verifies that position queries reach the session for the client's
//! (mode, root), are validated against the workspace, and that errors map to
//! the documented JSON-RPC codes.

use futures_util::future::join_all;
use serde_json::json;

use xlang_proxy::jsonrpc::codes;
use xlang_proxy::protocol::{DEFINITION, HOVER, REFERENCES};
use xlang_proxy::testing::{connect, FakeBackendOptions, FakeLauncher};
use xlang_proxy::{Snapshot, WorkspaceRoot};

use crate::common::{error_code, ProxyFixture, MODE};

// ============================================================================
// INITIALIZE
// ============================================================================

#[tokio::test]
async fn test_initialize_returns_backend_capabilities() {
    let fixture = ProxyFixture::new();
    let client = connect(&fixture.proxy);

    let result = client.initialize(&fixture.root, MODE).await.unwrap();

    assert_eq!(result["capabilities"]["hoverProvider"], json!(true));
    assert_eq!(result["serverInfo"]["mode"], json!(MODE));
    assert_eq!(fixture.launcher.launches(), 1);
    assert_eq!(fixture.proxy.registry().len(), 1);
}

#[tokio::test]
async fn test_initialize_accepts_root_uri() {
    let fixture = ProxyFixture::new();
    let client = connect(&fixture.proxy);

    let result = client
        .call(
            "initialize",
            json!({ "rootUri": fixture.root.to_string(), "mode": MODE }),
        )
        .await;

    assert!(result.is_ok(), "rootUri should be accepted: {result:?}");
}

#[tokio::test]
async fn test_duplicate_initialize_rejected() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;

    let err = client.initialize(&fixture.root, MODE).await.unwrap_err();

    assert_eq!(error_code(&err), codes::INVALID_REQUEST);
    assert_eq!(fixture.launcher.launches(), 1);
}

#[tokio::test]
async fn test_initialize_rejects_bad_parameters() {
    let fixture = ProxyFixture::new();
    let client = connect(&fixture.proxy);

    let err = client
        .call("initialize", json!({ "rootPath": "not a uri", "mode": MODE }))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), codes::INVALID_PARAMS);

    let err = client
        .call("initialize", json!({ "rootPath": fixture.root.to_string() }))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), codes::INVALID_PARAMS);

    let err = client
        .call("initialize", json!({ "mode": MODE }))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), codes::INVALID_PARAMS);

    // Failed attempts leave the connection uninitialized
    assert!(client.initialize(&fixture.root, MODE).await.is_ok());
}

#[tokio::test]
async fn test_unknown_mode_is_not_cached() {
    let fixture = ProxyFixture::with_launcher(FakeLauncher::with_options(FakeBackendOptions {
        modes: vec![MODE.to_string()],
        ..FakeBackendOptions::default()
    }));
    let client = connect(&fixture.proxy);

    let err = client.initialize(&fixture.root, "cobol").await.unwrap_err();

    assert_eq!(error_code(&err), codes::BACKEND_FAILED);
    assert!(fixture.proxy.registry().is_empty());
    assert!(client.initialize(&fixture.root, MODE).await.is_ok());
}

// ============================================================================
// POSITION QUERIES
// ============================================================================

#[tokio::test]
async fn test_hover_reads_through_workspace() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;

    let hover = client
        .position(HOVER, &fixture.document("mux.go"), 5, 7)
        .await
        .unwrap();

    assert_eq!(hover["contents"]["value"], json!("NewRouter"));
    assert_eq!(fixture.source.fetch_count(), 1);
}

#[tokio::test]
async fn test_definition_and_references() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;
    let document = fixture.document("route.go");

    let definition = client.position(DEFINITION, &document, 2, 6).await.unwrap();
    let locations = definition.as_array().expect("definition returns locations");
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0]["uri"], json!(document.to_string()));
    assert_eq!(locations[0]["range"]["start"]["character"], json!(5));
    assert_eq!(locations[0]["range"]["end"]["character"], json!(10));

    let references = client.position(REFERENCES, &document, 2, 6).await.unwrap();
    assert_eq!(references.as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_concurrent_clients_share_one_session() {
    let fixture = ProxyFixture::new();
    let clients = join_all((0..3).map(|_| fixture.client())).await;
    let document = fixture.document("mux.go");

    let queries = clients.iter().flat_map(|client| {
        let document = document.clone();
        [HOVER, DEFINITION, REFERENCES]
            .into_iter()
            .map(move |method| {
                let document = document.clone();
                async move { client.position(method, &document, 0, 9).await }
            })
    });
    let results = join_all(queries).await;

    assert_eq!(results.len(), 9);
    for result in &results {
        assert!(result.is_ok(), "query failed: {result:?}");
    }
    assert_eq!(fixture.launcher.launches(), 1);
    assert_eq!(fixture.launcher.queries(), 9);
    assert_eq!(fixture.source.fetch_count(), 1);
}

#[tokio::test]
async fn test_modes_get_separate_sessions() {
    let fixture = ProxyFixture::new();
    let go = fixture.client_for(&fixture.root, "go").await;
    let ts = fixture.client_for(&fixture.root, "typescript").await;

    let document = fixture.document("mux.go");
    go.position(HOVER, &document, 0, 0).await.unwrap();
    ts.position(HOVER, &document, 0, 0).await.unwrap();

    assert_eq!(fixture.launcher.launches(), 2);
    assert_eq!(fixture.proxy.registry().len(), 2);
    // Each session has its own filesystem
    assert_eq!(fixture.source.fetch_count(), 2);
}

#[tokio::test]
async fn test_position_before_initialize() {
    let fixture = ProxyFixture::new();
    let client = connect(&fixture.proxy);

    let err = client
        .position(HOVER, &fixture.document("mux.go"), 0, 0)
        .await
        .unwrap_err();

    assert_eq!(error_code(&err), codes::SERVER_NOT_INITIALIZED);
    assert_eq!(fixture.launcher.launches(), 0);
}

#[tokio::test]
async fn test_unknown_method() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;

    let err = client
        .call("textDocument/rename", json!({}))
        .await
        .unwrap_err();

    assert_eq!(error_code(&err), codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_position_params() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;

    let err = client
        .call(HOVER, json!({ "textDocument": { "uri": 42 } }))
        .await
        .unwrap_err();

    assert_eq!(error_code(&err), codes::INVALID_PARAMS);
}

// ============================================================================
// VALIDATION ERRORS
// ============================================================================

#[tokio::test]
async fn test_root_mismatch() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;
    let other = WorkspaceRoot::new(
        "git",
        "github.com",
        "/gorilla/mux",
        "d8e2dbac2e1ac7fa1bd6bbd2e1e83a49d8c3cb09",
    );

    let err = client
        .position(HOVER, &other.with_file_path("mux.go"), 0, 0)
        .await
        .unwrap_err();

    assert_eq!(error_code(&err), codes::ROOT_MISMATCH);
    assert_eq!(fixture.launcher.queries(), 0);
}

#[tokio::test]
async fn test_invalid_location_is_distinct() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;
    let document = fixture.document("mux.go");

    let err = client.position(HOVER, &document, 999, 0).await.unwrap_err();
    assert_eq!(error_code(&err), codes::INVALID_LOCATION);

    // "package mux" has 11 characters; the end of the line is addressable
    let err = client.position(HOVER, &document, 0, 12).await.unwrap_err();
    assert_eq!(error_code(&err), codes::INVALID_LOCATION);
    assert!(client.position(HOVER, &document, 0, 11).await.is_ok());

    // A missing file is a fetch failure, not an invalid location
    let err = client
        .position(HOVER, &fixture.document("missing.go"), 0, 0)
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), codes::FETCH_FAILED);

    // Only the valid query reached the backend
    assert_eq!(fixture.launcher.queries(), 1);
}

#[tokio::test]
async fn test_positions_count_characters() {
    let fixture = ProxyFixture::new();
    let client = fixture.client().await;
    let document = fixture.document("doc.go");

    // "// Größe und Gewicht" is 20 characters but 22 bytes
    assert!(client.position(HOVER, &document, 0, 20).await.is_ok());
    let err = client.position(HOVER, &document, 0, 21).await.unwrap_err();
    assert_eq!(error_code(&err), codes::INVALID_LOCATION);

    let hover = client.position(HOVER, &document, 0, 5).await.unwrap();
    assert_eq!(hover["contents"]["value"], json!("Größe"));
}

#[tokio::test]
async fn test_escaped_file_names_reach_their_documents() {
    let fixture = ProxyFixture::new();
    let root = WorkspaceRoot::new("git", "github.com", "/acme/units", "v2");
    fixture.source.insert(
        root.clone(),
        Snapshot::from_files([
            ("größe.go", "package größe\n"),
            ("a b.go", "package ab\n"),
            ("100%.go", "package full\n"),
        ]),
    );
    let client = fixture.client_for(&root, MODE).await;

    for (path, word) in [("größe.go", "größe"), ("a b.go", "ab"), ("100%.go", "full")] {
        let document = root.with_file_path(path);
        let hover = client
            .position(HOVER, &document, 0, 9)
            .await
            .unwrap_or_else(|e| panic!("hover on {path:?} failed: {e:?}"));
        assert_eq!(hover["contents"]["value"], json!(word));
    }

    // The raw, unescaped spelling names the same document
    let hover = client
        .call(
            HOVER,
            json!({
                "textDocument": { "uri": "git://github.com/acme/units?v2#größe.go" },
                "position": { "line": 0, "character": 9 },
            }),
        )
        .await
        .unwrap();
    assert_eq!(hover["contents"]["value"], json!("größe"));
}

#[tokio::test]
async fn test_unfetchable_repository() {
    let fixture = ProxyFixture::new();
    let missing = WorkspaceRoot::new("git", "github.com", "/acme/private", "main");
    let client = fixture.client_for(&missing, MODE).await;

    let err = client
        .position(HOVER, &missing.with_file_path("main.go"), 0, 0)
        .await
        .unwrap_err();

    assert_eq!(error_code(&err), codes::FETCH_FAILED);
    // The session stays usable for other requests
    assert_eq!(fixture.proxy.registry().len(), 1);
}
