//! Per-client connection handling
//!
//! Messages are read in order. `initialize` is handled inline so that every
//! later request sees the binding; position queries and administrative
//! requests each run on their own task and their responses funnel through a
//! single writer task, so a slow session never delays an unrelated reply.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::Proxy;
use crate::error::{ProxyError, Result};
use crate::jsonrpc::{read_frame, write_message, Incoming, Outgoing, RequestId};
use crate::protocol::{
    self, CancelParams, InitializeParams, ShutDownIdleParams, TextDocumentPositionParams,
};
use crate::session::{Session, SessionKey};
use crate::uri::{DocumentUri, WorkspaceRoot};

/// Frames of an LSP-framed byte stream; ends at EOF or after the first error
pub(crate) fn lsp_frames<R>(reader: R) -> impl Stream<Item = Result<Vec<u8>>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures_util::stream::unfold(Some(BufReader::new(reader)), |state| async move {
        let mut reader = state?;
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => Some((Ok(frame), Some(reader))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}

pub(crate) async fn write_lsp<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outgoing>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            tracing::debug!("Client write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Text and binary frames of a WebSocket, one JSON-RPC message each
pub(crate) fn websocket_frames<S>(
    stream: SplitStream<WebSocketStream<S>>,
) -> impl Stream<Item = Result<Vec<u8>>> + Send
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    stream.filter_map(|message| async move {
        match message {
            Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
            Ok(Message::Binary(data)) => Some(Ok(data)),
            // Ping/pong are answered by tungstenite; close ends the stream
            Ok(_) => None,
            Err(e) => Some(Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            )))),
        }
    })
}

pub(crate) async fn write_websocket<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = rx.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode message: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            tracing::debug!("WebSocket write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

/// The session a connection is bound to
///
/// The session is held weakly: once the registry drops it (reaped or
/// discarded) its workspace cache is freed even if the client stays
/// connected. The next request rebinds by key; the key never changes.
struct Binding {
    key: SessionKey,
    session: Mutex<Weak<Session>>,
}

impl Binding {
    fn new(key: SessionKey, session: &Arc<Session>) -> Self {
        Self {
            key,
            session: Mutex::new(Arc::downgrade(session)),
        }
    }

    /// The bound session, rebinding if it is gone or no longer usable
    async fn session(&self, proxy: &Proxy) -> Result<Arc<Session>> {
        let current = self.session.lock().upgrade();
        match current {
            Some(session) if session.is_alive() => Ok(session),
            _ => self.rebind(proxy).await,
        }
    }

    async fn rebind(&self, proxy: &Proxy) -> Result<Arc<Session>> {
        let fresh = proxy.session_for(&self.key).await?;
        let mut current = self.session.lock();
        if current.as_ptr() != Arc::as_ptr(&fresh) {
            tracing::debug!("Rebinding {} to {}", self.key, fresh.id());
            *current = Arc::downgrade(&fresh);
        }
        Ok(fresh)
    }
}

type TaskMap = Arc<Mutex<HashMap<RequestId, AbortHandle>>>;

pub(crate) struct Connection {
    id: String,
    peer: String,
    proxy: Arc<Proxy>,
    out: mpsc::UnboundedSender<Outgoing>,
    binding: Option<Arc<Binding>>,
    tasks: TaskMap,
}

impl Connection {
    pub(crate) fn new(proxy: Arc<Proxy>, out: mpsc::UnboundedSender<Outgoing>, peer: String) -> Self {
        let id = format!("cli_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Self {
            id,
            peer,
            proxy,
            out,
            binding: None,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) async fn run<S>(mut self, frames: S)
    where
        S: Stream<Item = Result<Vec<u8>>>,
    {
        tracing::debug!("Connection {} opened from {}", self.id, self.peer);
        let mut frames = std::pin::pin!(frames);

        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("Connection {}: read failed: {}", self.id, e);
                    break;
                }
            };

            match Incoming::decode(&frame) {
                Ok(Incoming::Request { id, method, params }) => {
                    self.handle_request(id, method, params).await
                }
                Ok(Incoming::Notification { method, params }) => {
                    if method == protocol::EXIT {
                        break;
                    }
                    self.handle_notification(&method, params);
                }
                Ok(Incoming::Response { id, .. }) => {
                    tracing::debug!("Connection {}: ignoring response {:?}", self.id, id);
                }
                Err(e) => self.reply(None, "<undecodable>", Err(e)),
            }
        }

        self.disconnect();
    }

    async fn handle_request(&mut self, id: RequestId, method: String, params: Value) {
        let name = method.clone();
        match name.as_str() {
            protocol::INITIALIZE => {
                let result = self.initialize(params).await;
                self.reply(Some(id), &method, result);
            }
            protocol::SHUTDOWN => self.reply(Some(id), &method, Ok(Value::Null)),
            protocol::SHUT_DOWN_IDLE_SESSIONS => {
                let proxy = self.proxy.clone();
                self.spawn_request(id, method, async move {
                    let params: ShutDownIdleParams = if params.is_null() {
                        ShutDownIdleParams::default()
                    } else {
                        parse_params(params)?
                    };
                    let stats = proxy
                        .shut_down_idle_sessions(Duration::from_millis(params.older_than_ms))
                        .await;
                    Ok(json!({ "reaped": stats.reaped, "remaining": stats.remaining }))
                });
            }
            m if protocol::is_position_method(m) => match &self.binding {
                Some(binding) => {
                    let proxy = self.proxy.clone();
                    let binding = binding.clone();
                    let query_method = method.clone();
                    self.spawn_request(id, method, async move {
                        position_query(&proxy, &binding, &query_method, params).await
                    });
                }
                None => self.reply(Some(id), &method, Err(ProxyError::NotInitialized)),
            },
            _ => {
                let err = ProxyError::MethodNotFound {
                    method: method.clone(),
                };
                self.reply(Some(id), &method, Err(err));
            }
        }
    }

    fn handle_notification(&mut self, method: &str, params: Value) {
        match method {
            protocol::CANCEL_REQUEST => {
                let Ok(CancelParams { id }) = serde_json::from_value::<CancelParams>(params) else {
                    tracing::debug!("Connection {}: malformed cancel", self.id);
                    return;
                };
                let handle = self.tasks.lock().remove(&id);
                if let Some(handle) = handle {
                    handle.abort();
                    tracing::debug!("Connection {}: cancelled request {}", self.id, id);
                    let _ = self.out.send(Outgoing::response(
                        Some(id),
                        Err(ProxyError::Cancelled.to_error_object()),
                    ));
                }
            }
            other => tracing::trace!("Connection {}: ignoring notification {}", self.id, other),
        }
    }

    async fn initialize(&mut self, params: Value) -> Result<Value> {
        if self.binding.is_some() {
            return Err(ProxyError::AlreadyInitialized);
        }
        let params: InitializeParams = parse_params(params)?;
        let root = params
            .root()
            .ok_or_else(|| ProxyError::invalid_request("initialize requires rootPath or rootUri"))?;
        let root = WorkspaceRoot::parse(root)?;
        if params.mode.trim().is_empty() {
            return Err(ProxyError::invalid_request("initialize requires a mode"));
        }

        let key = SessionKey::new(params.mode, root);
        let session = self.proxy.session_for(&key).await?;
        tracing::info!(
            "Connection {} bound to session {} ({})",
            self.id,
            session.id(),
            key
        );
        let result = session.initialize_result().clone();
        self.binding = Some(Arc::new(Binding::new(key, &session)));
        Ok(result)
    }

    /// Run `request` on its own task; its response is sent unless cancelled
    fn spawn_request<F>(&self, id: RequestId, method: String, request: F)
    where
        F: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&id) {
            drop(tasks);
            let err = ProxyError::invalid_request(format!("request id {} is already in flight", id));
            self.reply(Some(id), &method, Err(err));
            return;
        }

        let registry = self.tasks.clone();
        let proxy = self.proxy.clone();
        let out = self.out.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let result = request.await;
            // A cancelled request has already been answered
            if registry.lock().remove(&task_id).is_none() {
                return;
            }
            if let Err(e) = &result {
                proxy.track_error(&method, e);
            }
            let _ = out.send(Outgoing::response(
                Some(task_id),
                result.map_err(|e| e.to_error_object()),
            ));
        });
        tasks.insert(id, handle.abort_handle());
    }

    fn reply(&self, id: Option<RequestId>, method: &str, result: Result<Value>) {
        if let Err(e) = &result {
            self.proxy.track_error(method, e);
        }
        let _ = self.out.send(Outgoing::response(
            id,
            result.map_err(|e| e.to_error_object()),
        ));
    }

    fn disconnect(&mut self) {
        let tasks: Vec<AbortHandle> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        if !tasks.is_empty() {
            tracing::debug!(
                "Connection {}: aborting {} requests on disconnect",
                self.id,
                tasks.len()
            );
        }
        for task in tasks {
            task.abort();
        }
        self.binding = None;
        tracing::info!("Connection {} from {} closed", self.id, self.peer);
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| ProxyError::invalid_request(e.to_string()))
}

/// Route one position query to the bound session
///
/// A request that races with the reaper is retried once on a fresh session.
async fn position_query(
    proxy: &Proxy,
    binding: &Binding,
    method: &str,
    params: Value,
) -> Result<Value> {
    let parsed: TextDocumentPositionParams = parse_params(params.clone())?;
    let document = DocumentUri::parse(&parsed.text_document.uri)?;
    if document.root() != &binding.key.root {
        return Err(ProxyError::RootMismatch {
            root: binding.key.root.to_string(),
            document: parsed.text_document.uri,
        });
    }

    let session = binding.session(proxy).await?;
    tracing::debug!("{} {} via {}", method, document, session.id());
    match session
        .position_query(method, &document, parsed.position, params.clone())
        .await
    {
        Err(ProxyError::SessionRetired { .. }) => {
            let fresh = binding.rebind(proxy).await?;
            fresh
                .position_query(method, &document, parsed.position, params)
                .await
        }
        Err(e) if e.breaks_session() => {
            proxy.discard_session(&session);
            Err(e)
        }
        other => other,
    }
}
