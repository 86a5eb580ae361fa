//! Shared fixtures for xlang-proxy integration tests
//!
//! A [`ProxyFixture`] wires a [`Proxy`] to in-process fake backends and an
//! in-memory repository source, so tests exercise the full client path
//! without spawning processes or touching the network.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use xlang_proxy::testing::{connect, workspace, FakeLauncher, MemorySource, TestClient};
use xlang_proxy::{DocumentUri, Proxy, ProxyOptions, SessionOptions, WorkspaceRoot};

pub const MODE: &str = "go";

pub struct ProxyFixture {
    pub proxy: Arc<Proxy>,
    pub launcher: Arc<FakeLauncher>,
    pub source: Arc<MemorySource>,
    pub root: WorkspaceRoot,
}

impl ProxyFixture {
    pub fn new() -> Self {
        Self::with_launcher(FakeLauncher::new())
    }

    pub fn with_launcher(launcher: FakeLauncher) -> Self {
        Self::build(launcher, MemorySource::new(), ProxyOptions::default())
    }

    pub fn with_options(options: ProxyOptions) -> Self {
        Self::build(FakeLauncher::new(), MemorySource::new(), options)
    }

    pub fn build(launcher: FakeLauncher, source: MemorySource, options: ProxyOptions) -> Self {
        let (root, snapshot) = workspace();
        source.insert(root.clone(), snapshot);
        let launcher = Arc::new(launcher);
        let source = Arc::new(source);
        let proxy = Arc::new(Proxy::new(launcher.clone(), source.clone(), options));
        proxy.set_log_tracked_errors(false);
        Self {
            proxy,
            launcher,
            source,
            root,
        }
    }

    pub fn document(&self, path: &str) -> DocumentUri {
        self.root.with_file_path(path)
    }

    /// A client that has completed `initialize` for the fixture workspace
    pub async fn client(&self) -> TestClient {
        self.client_for(&self.root, MODE).await
    }

    pub async fn client_for(&self, root: &WorkspaceRoot, mode: &str) -> TestClient {
        let client = connect(&self.proxy);
        client
            .initialize(root, mode)
            .await
            .expect("initialize should succeed");
        client
    }
}

/// Options with short timeouts, for tests that exercise failures
pub fn fast_options() -> ProxyOptions {
    ProxyOptions {
        session: SessionOptions {
            request_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_millis(500),
            ..SessionOptions::default()
        },
        ..ProxyOptions::default()
    }
}

/// JSON-RPC error code carried by a client-side error
pub fn error_code(error: &xlang_proxy::ProxyError) -> i64 {
    match error {
        xlang_proxy::ProxyError::Rpc { code, .. } => *code,
        other => panic!("expected an error response, got {other:?}"),
    }
}
