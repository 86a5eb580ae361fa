//! In-memory doubles for tests and benchmarks
//!
//! - [`MemorySource`]: a [`RemoteSource`] serving snapshots from a map and
//!   counting fetches.
//! - [`FakeLauncher`]: launches an in-process backend over a duplex pipe.
//!   The fake speaks the same JSON-RPC protocol as a real language server
//!   and reads file content back through the proxy (`textDocument/xcontent`).
//! - [`TestClient`]: a client connection to a [`Proxy`] over a duplex pipe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::backend::{BackendIo, BackendLauncher, Channel, IgnoreInbound, InboundHandler, WeakChannel};
use crate::error::{ProxyError, Result};
use crate::protocol::{self, TextDocumentPositionParams};
use crate::proxy::Proxy;
use crate::session::SessionKey;
use crate::uri::{DocumentUri, WorkspaceRoot};
use crate::vfs::{RemoteSource, Snapshot};

const PIPE_CAPACITY: usize = 1 << 20;

/// Remote source backed by an in-memory map
#[derive(Default)]
pub struct MemorySource {
    snapshots: Mutex<HashMap<WorkspaceRoot, Snapshot>>,
    fetches: AtomicUsize,
    latency: Duration,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch, simulating a slow download
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn insert(&self, root: WorkspaceRoot, snapshot: Snapshot) {
        self.snapshots.lock().insert(root, snapshot);
    }

    /// Number of `fetch_archive` calls, failed ones included
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    async fn fetch_archive(&self, root: &WorkspaceRoot) -> anyhow::Result<Snapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.snapshots
            .lock()
            .get(root)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("repository {} not found", root))
    }
}

/// A small Go workspace used across tests
///
/// `mux.go` line 0 is `package mux`; `doc.go` line 0 contains non-ASCII
/// characters.
pub fn workspace() -> (WorkspaceRoot, Snapshot) {
    let root = WorkspaceRoot::new(
        "git",
        "github.com",
        "/gorilla/mux",
        "0a192a193177452756c362c20087ddafcf6829c4",
    );
    let snapshot = Snapshot::from_files([
        (
            "mux.go",
            "package mux\n\nimport \"net/http\"\n\n// NewRouter returns a new router instance.\nfunc NewRouter() *Router {\n\treturn &Router{}\n}\n",
        ),
        (
            "route.go",
            "package mux\n\ntype Route struct {\n\tname string\n}\n\nfunc (r *Route) Name() string {\n\treturn r.name\n}\n",
        ),
        ("doc.go", "// Größe und Gewicht\npackage mux\n"),
        ("internal/util.go", "package internal\n"),
    ]);
    (root, snapshot)
}

/// Behavior of fake backends
#[derive(Debug, Clone, Default)]
pub struct FakeBackendOptions {
    /// Delay before answering a position query
    pub latency: Duration,
    /// Modes that can be launched; empty means any
    pub modes: Vec<String>,
    /// Reject `initialize`
    pub fail_initialize: bool,
}

/// Launcher for in-process fake backends
#[derive(Default)]
pub struct FakeLauncher {
    options: FakeBackendOptions,
    launches: AtomicUsize,
    backends: Mutex<Vec<Arc<FakeBackend>>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: FakeBackendOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self::with_options(FakeBackendOptions {
            latency,
            ..FakeBackendOptions::default()
        })
    }

    /// Number of backends launched so far
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Backends that are connected and have not been shut down
    pub fn live_backends(&self) -> usize {
        self.backends.lock().iter().filter(|b| b.is_live()).count()
    }

    /// Position queries received across all backends
    pub fn queries(&self) -> usize {
        self.backends
            .lock()
            .iter()
            .map(|b| b.queries.load(Ordering::SeqCst))
            .sum()
    }

    /// Drop the connection of every backend, as if the processes died
    pub async fn crash_all(&self) {
        let channels: Vec<Channel> = self
            .backends
            .lock()
            .iter()
            .filter_map(|b| b.channel())
            .collect();
        for channel in channels {
            channel.close("backend crashed").await;
        }
    }

    /// Send a request from the most recently launched backend to the proxy
    pub async fn backend_call(&self, method: &str, params: Value) -> Result<Value> {
        let channel = self
            .backends
            .lock()
            .last()
            .and_then(|b| b.channel())
            .ok_or_else(|| ProxyError::backend_closed("no fake backend running"))?;
        channel.call(method, params).await
    }
}

#[async_trait]
impl BackendLauncher for FakeLauncher {
    async fn launch(&self, key: &SessionKey) -> Result<BackendIo> {
        if !self.options.modes.is_empty() && !self.options.modes.contains(&key.mode) {
            return Err(ProxyError::UnknownMode {
                mode: key.mode.clone(),
            });
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (proxy_end, backend_end) = tokio::io::duplex(PIPE_CAPACITY);
        let backend = Arc::new(FakeBackend {
            key: key.clone(),
            options: self.options.clone(),
            channel: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        });
        let channel = Channel::start(
            format!("fake {}", key),
            BackendIo::from_stream(backend_end),
            backend.clone(),
            Duration::from_secs(30),
        );
        // The reader task keeps the channel alive until the pipe closes
        *backend.channel.lock() = Some(channel.downgrade());
        self.backends.lock().push(backend);

        Ok(BackendIo::from_stream(proxy_end))
    }
}

/// Fake language server: answers position queries with the word under the
/// cursor, read back from the proxy's workspace filesystem
struct FakeBackend {
    key: SessionKey,
    options: FakeBackendOptions,
    channel: Mutex<Option<WeakChannel>>,
    shut_down: AtomicBool,
    queries: AtomicUsize,
}

impl FakeBackend {
    fn channel(&self) -> Option<Channel> {
        self.channel.lock().as_ref().and_then(WeakChannel::upgrade)
    }

    fn is_live(&self) -> bool {
        !self.shut_down.load(Ordering::SeqCst)
            && self.channel().is_some_and(|channel| !channel.is_closed())
    }

    async fn position_query(&self, method: &str, params: Value) -> Result<Value> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if !self.options.latency.is_zero() {
            tokio::time::sleep(self.options.latency).await;
        }

        let params: TextDocumentPositionParams = serde_json::from_value(params)
            .map_err(|e| ProxyError::invalid_request(e.to_string()))?;
        let uri = params.text_document.uri;
        let channel = self
            .channel()
            .ok_or_else(|| ProxyError::backend_closed("fake backend detached"))?;
        let content = channel
            .call(protocol::XCONTENT, json!({ "textDocument": { "uri": uri } }))
            .await?;
        let text = content["text"].as_str().unwrap_or_default();
        let (start, end, word) = word_at(text, params.position.line, params.position.character);

        let range = json!({
            "start": { "line": params.position.line, "character": start },
            "end": { "line": params.position.line, "character": end },
        });
        Ok(match method {
            protocol::HOVER => json!({ "contents": { "kind": "plaintext", "value": word } }),
            protocol::DEFINITION => json!([{ "uri": uri, "range": range }]),
            _ => json!([{ "uri": uri, "range": range }, { "uri": uri, "range": range }]),
        })
    }
}

#[async_trait]
impl InboundHandler for FakeBackend {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            protocol::INITIALIZE => {
                if self.options.fail_initialize {
                    return Err(ProxyError::Rpc {
                        code: crate::jsonrpc::codes::INTERNAL_ERROR,
                        message: "initialize failed".to_string(),
                        data: None,
                    });
                }
                Ok(json!({
                    "capabilities": {
                        "hoverProvider": true,
                        "definitionProvider": true,
                        "referencesProvider": true,
                    },
                    "serverInfo": { "name": "fake", "mode": self.key.mode },
                }))
            }
            protocol::SHUTDOWN => {
                self.shut_down.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
            m if protocol::is_position_method(m) => self.position_query(m, params).await,
            other => Err(ProxyError::MethodNotFound {
                method: other.to_string(),
            }),
        }
    }

    async fn handle_notification(&self, method: &str, _params: Value) {
        if method == protocol::EXIT {
            if let Some(channel) = self.channel() {
                // Closing aborts the reader, which is the task running this handler
                tokio::spawn(async move { channel.close("exit").await });
            }
        }
    }
}

/// Word around a position, with its character range
fn word_at(text: &str, line: u32, character: u32) -> (usize, usize, String) {
    let Some(line) = text.lines().nth(line as usize) else {
        return (0, 0, String::new());
    };
    let chars: Vec<char> = line.chars().collect();
    let is_word = |c: &char| c.is_alphanumeric() || *c == '_';
    let mut pos = (character as usize).min(chars.len());
    if pos == chars.len() || !is_word(&chars[pos]) {
        if pos > 0 && is_word(&chars[pos - 1]) {
            pos -= 1;
        } else {
            return (pos, pos, String::new());
        }
    }
    let start = chars[..pos]
        .iter()
        .rposition(|c| !is_word(c))
        .map_or(0, |i| i + 1);
    let end = chars[pos..]
        .iter()
        .position(|c| !is_word(c))
        .map_or(chars.len(), |i| pos + i);
    (start, end, chars[start..end].iter().collect())
}

/// A client connected to a proxy over an in-memory pipe
pub struct TestClient {
    channel: Channel,
    connection: JoinHandle<()>,
}

/// Open a client connection to `proxy`
pub fn connect(proxy: &Arc<Proxy>) -> TestClient {
    let (client_end, proxy_end) = tokio::io::duplex(PIPE_CAPACITY);
    let connection = proxy.spawn_connection(proxy_end, "test-client".to_string());
    let channel = Channel::start(
        "test-client",
        BackendIo::from_stream(client_end),
        Arc::new(IgnoreInbound),
        Duration::from_secs(30),
    );
    TestClient {
        channel,
        connection,
    }
}

impl TestClient {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.channel.call(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.channel.notify(method, params).await
    }

    pub async fn initialize(&self, root: &WorkspaceRoot, mode: &str) -> Result<Value> {
        self.call(
            protocol::INITIALIZE,
            json!({ "rootPath": root.to_string(), "mode": mode }),
        )
        .await
    }

    pub async fn position(
        &self,
        method: &str,
        document: &DocumentUri,
        line: u32,
        character: u32,
    ) -> Result<Value> {
        self.call(method, position_params(document, line, character))
            .await
    }

    /// Close the connection and wait for the proxy side to finish
    pub async fn close(self) {
        self.channel.close("client closed").await;
        let _ = self.connection.await;
    }
}

/// Parameters of a position query
pub fn position_params(document: &DocumentUri, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": document.to_string() },
        "position": { "line": line, "character": character },
    })
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
