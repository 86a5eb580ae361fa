//! Client-facing proxy
//!
//! Accepts client connections, binds each to the session serving its
//! (mode, workspace root), and routes requests to that session. Clients
//! connect over TCP with LSP framing or, optionally, over WebSocket with one
//! JSON-RPC message per text frame.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   initialize(root, mode)   ┌───────────────┐   get_or_create   ┌─────────┐
//! │  Client  │ ─────────────────────────► │  Connection   │ ────────────────► │Registry │
//! └──────────┘   hover / definition / ... └───────────────┘                   └─────────┘
//!                                              │ one task per request              │
//!                                              ▼                                   ▼
//!                                         ┌─────────┐  JSON-RPC (pipelined)  ┌─────────┐
//!                                         │ Session │ ─────────────────────► │ Backend │
//!                                         └─────────┘ ◄── xcontent/xfiles ── └─────────┘
//! ```

mod connection;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::backend::{BackendLauncher, ProcessLauncher};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::reaper::{self, ReapStats};
use crate::session::{Session, SessionKey, SessionOptions, SessionRegistry};
use crate::vfs::{ArchiveSource, RemoteSource};

use connection::Connection;

/// Proxy-wide limits
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub max_sessions: usize,
    pub session: SessionOptions,
    pub log_tracked_errors: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            session: SessionOptions::default(),
            log_tracked_errors: true,
        }
    }
}

impl From<&ProxyConfig> for ProxyOptions {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_sessions: config.sessions.max_sessions,
            session: SessionOptions {
                request_timeout: config.sessions.request_timeout(),
                shutdown_timeout: config.sessions.shutdown_timeout(),
                max_in_flight: config.sessions.max_in_flight,
            },
            log_tracked_errors: config.logging.log_tracked_errors,
        }
    }
}

/// The multiplexing proxy; owns the session registry
pub struct Proxy {
    registry: Arc<SessionRegistry>,
    launcher: Arc<dyn BackendLauncher>,
    source: Arc<dyn RemoteSource>,
    options: ProxyOptions,
    log_tracked_errors: AtomicBool,
}

impl Proxy {
    pub fn new(
        launcher: Arc<dyn BackendLauncher>,
        source: Arc<dyn RemoteSource>,
        options: ProxyOptions,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(options.max_sessions)),
            launcher,
            source,
            log_tracked_errors: AtomicBool::new(options.log_tracked_errors),
            options,
        }
    }

    /// Proxy with process backends and HTTP archive downloads
    pub fn from_config(config: &ProxyConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(config.backends.clone()));
        let source = Arc::new(ArchiveSource::new(
            config.archive.url_template.clone(),
            config.archive.token.clone(),
        ));
        Self::new(launcher, source, ProxyOptions::from(config))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Live session for `key`, spawning one if needed
    pub async fn session_for(&self, key: &SessionKey) -> Result<Arc<Session>> {
        let launcher = self.launcher.clone();
        let source = self.source.clone();
        let options = self.options.session.clone();
        self.registry
            .get_or_create(key, || async move {
                Session::start(key.clone(), launcher.as_ref(), source, options).await
            })
            .await
    }

    /// Detach a session whose backend broke and stop it
    pub(crate) fn discard_session(&self, session: &Arc<Session>) {
        if self.registry.remove_session(session) {
            tracing::warn!("Discarding broken session {} for {}", session.id(), session.key());
            let session = session.clone();
            tokio::spawn(async move { session.shutdown().await });
        }
    }

    /// Retire sessions idle longer than `older_than` (zero: every idle session)
    pub async fn shut_down_idle_sessions(&self, older_than: Duration) -> ReapStats {
        reaper::reap(&self.registry, older_than).await
    }

    /// Shut down every session
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain();
        tracing::info!("Shutting down {} sessions", sessions.len());
        join_all(sessions.iter().map(|session| session.shutdown())).await;
    }

    pub fn set_log_tracked_errors(&self, enabled: bool) {
        self.log_tracked_errors.store(enabled, Ordering::Relaxed);
    }

    pub fn log_tracked_errors(&self) -> bool {
        self.log_tracked_errors.load(Ordering::Relaxed)
    }

    /// Log an error returned to a client, unless it is harmless
    pub fn track_error(&self, method: &str, error: &ProxyError) {
        if error.is_harmless() || !self.log_tracked_errors() {
            return;
        }
        tracing::warn!("{} failed ({:?}): {}", method, error.kind(), error);
    }

    /// Accept LSP-framed client connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("xlang-proxy listening on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::info!("Accepted connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    self.spawn_connection(stream, addr.to_string());
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Serve one LSP-framed client over any byte stream
    pub fn spawn_connection<S>(self: &Arc<Self>, stream: S, peer: String) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let proxy = self.clone();
        tokio::spawn(async move {
            let writer_task = tokio::spawn(connection::write_lsp(writer, rx));
            Connection::new(proxy, tx, peer)
                .run(connection::lsp_frames(reader))
                .await;
            let _ = writer_task.await;
        })
    }

    /// Accept WebSocket client connections until the listener fails
    pub async fn serve_websocket(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("xlang-proxy listening on ws://{}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let proxy = Arc::clone(&self);
                    tokio::spawn(async move {
                        let ws = match accept_async(stream).await {
                            Ok(ws) => ws,
                            Err(e) => {
                                tracing::error!("WebSocket handshake with {} failed: {}", addr, e);
                                return;
                            }
                        };
                        tracing::info!("Accepted WebSocket connection from {}", addr);
                        proxy.run_websocket(ws, addr.to_string()).await;
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Serve one client over an established WebSocket
    pub async fn run_websocket<S>(self: Arc<Self>, ws: WebSocketStream<S>, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        use futures_util::StreamExt;

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(connection::write_websocket(sink, rx));
        Connection::new(self, tx, peer)
            .run(connection::websocket_frames(stream))
            .await;
        let _ = writer_task.await;
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}
