//! Pipelined JSON-RPC channel to a backend
//!
//! Any number of requests may be outstanding at once. Each request gets a
//! fresh numeric id and a oneshot slot in the pending table; the reader task
//! completes slots as responses arrive, in whatever order the backend sends
//! them.
//!
//! Requests flowing the other way (backend to proxy) are dispatched to an
//! [`InboundHandler`] on their own tasks so that a slow archive fetch never
//! blocks response delivery.
//!
//! When the stream breaks, every outstanding request fails with
//! [`ProxyError::BackendClosed`] and later calls fail immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::BackendIo;
use crate::error::{ProxyError, Result};
use crate::jsonrpc::{read_frame, write_frame, ErrorObject, Incoming, Outgoing, RequestId};
use crate::protocol;

/// Handles requests and notifications sent by the peer
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value>;

    async fn handle_notification(&self, method: &str, _params: Value) {
        trace!("Ignoring notification {}", method);
    }
}

/// Handler that rejects every inbound request
pub struct IgnoreInbound;

#[async_trait]
impl InboundHandler for IgnoreInbound {
    async fn handle_request(&self, method: &str, _params: Value) -> Result<Value> {
        Err(ProxyError::MethodNotFound {
            method: method.to_string(),
        })
    }
}

type ResponseSlot = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct PendingTable {
    /// Set once; no request may be registered afterwards
    closed: Option<String>,
    requests: HashMap<u64, ResponseSlot>,
}

struct Inner {
    label: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Mutex<PendingTable>,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: Mutex<Option<AbortHandle>>,
    child: Mutex<Option<Child>>,
}

impl Inner {
    /// Mark the channel closed and fail everything outstanding
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<ResponseSlot> = {
            let mut pending = self.pending.lock();
            if pending.closed.is_none() {
                pending.closed = Some(reason.to_string());
            }
            pending.requests.drain().map(|(_, slot)| slot).collect()
        };
        if !drained.is_empty() {
            debug!(
                "{}: failing {} pending requests: {}",
                self.label,
                drained.len(),
                reason
            );
        }
        for slot in drained {
            let _ = slot.send(Err(ProxyError::backend_closed(reason)));
        }
    }

    fn complete(&self, id: Option<RequestId>, outcome: std::result::Result<Value, ErrorObject>) {
        let id = match id {
            Some(RequestId::Number(n)) if n >= 0 => n as u64,
            other => {
                warn!("{}: response with unexpected id {:?}", self.label, other);
                return;
            }
        };
        let slot = self.pending.lock().requests.remove(&id);
        match slot {
            Some(slot) => {
                let _ = slot.send(outcome.map_err(ProxyError::from));
            }
            None => debug!("{}: response for abandoned request {}", self.label, id),
        }
    }

    fn abort_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

/// Cloneable handle to a backend connection
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

/// Non-owning reference to a [`Channel`]
#[derive(Clone)]
pub struct WeakChannel {
    inner: Weak<Inner>,
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

/// Removes the pending entry if the caller stops waiting
struct PendingGuard<'a> {
    channel: &'a Channel,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut pending = self.channel.inner.pending.lock();
            pending.requests.remove(&self.id).is_some() && pending.closed.is_none()
        };
        if !abandoned {
            return;
        }
        // Let the backend stop working on a request nobody waits for
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            let id = self.id;
            handle.spawn(async move {
                let _ = channel
                    .notify(protocol::CANCEL_REQUEST, json!({ "id": id }))
                    .await;
            });
        }
    }
}

impl Channel {
    /// Start the reader task and return the connected channel
    pub fn start(
        label: impl Into<String>,
        io: BackendIo,
        handler: Arc<dyn InboundHandler>,
        request_timeout: Duration,
    ) -> Self {
        let BackendIo {
            reader,
            writer,
            child,
        } = io;
        let inner = Arc::new(Inner {
            label: label.into(),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(PendingTable::default()),
            next_id: AtomicU64::new(1),
            request_timeout,
            reader: Mutex::new(None),
            child: Mutex::new(child),
        });

        let task = tokio::spawn(read_loop(inner.clone(), BufReader::new(reader), handler));
        *inner.reader.lock() = Some(task.abort_handle());

        Self { inner }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed.is_some()
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().requests.len()
    }

    /// Send a request and wait for its response
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(method, params, self.inner.request_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if let Some(reason) = &pending.closed {
                return Err(ProxyError::backend_closed(reason.clone()));
            }
            pending.requests.insert(id, tx);
        }
        let _guard = PendingGuard { channel: self, id };

        self.send(&Outgoing::request(id, method, params)).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProxyError::backend_closed("response slot dropped")),
            Err(_) => Err(ProxyError::Timeout {
                method: method.to_string(),
                timeout,
            }),
        }
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.send(&Outgoing::notification(method, params)).await
    }

    async fn send(&self, message: &Outgoing) -> Result<()> {
        let body = message.encode()?;
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, &body).await {
            drop(writer);
            let reason = format!("write failed: {}", e);
            self.inner.fail_pending(&reason);
            return Err(ProxyError::backend_closed(reason));
        }
        Ok(())
    }

    /// Close the stream; outstanding requests fail with `reason`
    pub async fn close(&self, reason: &str) {
        self.inner.fail_pending(reason);
        self.inner.abort_reader();
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Synchronous teardown for drop paths
    pub fn abort(&self) {
        self.inner.fail_pending("channel aborted");
        self.inner.abort_reader();
        if let Some(child) = self.inner.child.lock().as_mut() {
            let _ = child.start_kill();
        }
    }

    /// Graceful LSP shutdown: `shutdown` request, `exit` notification, then
    /// wait for the process. Killed if it does not exit within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.is_closed() {
            match self
                .call_with_timeout(protocol::SHUTDOWN, Value::Null, timeout)
                .await
            {
                Ok(_) => {
                    let _ = self.notify(protocol::EXIT, Value::Null).await;
                }
                Err(e) => debug!("{}: shutdown request failed: {}", self.inner.label, e),
            }
        }
        self.close("channel shut down").await;

        let child = self.inner.child.lock().take();
        if let Some(mut child) = child {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => debug!("{}: backend exited with {}", self.inner.label, status),
                Ok(Err(e)) => warn!("{}: failed to wait for backend: {}", self.inner.label, e),
                Err(_) => {
                    warn!(
                        "{}: backend did not exit within {:?}, killing",
                        self.inner.label, timeout
                    );
                    let _ = child.kill().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut reader: R, handler: Arc<dyn InboundHandler>)
where
    R: AsyncBufRead + Unpin,
{
    let reason = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "peer closed the connection".to_string(),
            Err(e) => break format!("read failed: {}", e),
        };

        match Incoming::decode(&frame) {
            Ok(Incoming::Response { id, outcome }) => inner.complete(id, outcome),
            Ok(Incoming::Request { id, method, params }) => {
                let channel = Channel {
                    inner: inner.clone(),
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let outcome = handler
                        .handle_request(&method, params)
                        .await
                        .map_err(|e| e.to_error_object());
                    if let Err(e) = channel.send(&Outgoing::response(Some(id), outcome)).await {
                        debug!("{}: failed to answer {}: {}", channel.label(), method, e);
                    }
                });
            }
            Ok(Incoming::Notification { method, params }) => {
                handler.handle_notification(&method, params).await
            }
            Err(e) => warn!("{}: dropping undecodable message: {}", inner.label, e),
        }
    };

    debug!("{}: reader stopped: {}", inner.label, reason);
    inner.fail_pending(&reason);
}
