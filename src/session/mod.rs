//! Backend sessions
//!
//! A [`Session`] is one running backend bound to exactly one
//! (mode, workspace root) pair. It owns the JSON-RPC channel to the backend,
//! the workspace filesystem the backend reads through, and the activity
//! record the reaper consults.
//!
//! # Activity and retirement
//!
//! Every forwarded request holds an [`InFlightGuard`]. The reaper may only
//! retire a session whose in-flight count is zero, and retirement happens
//! under the same lock that admits requests, so a request is either admitted
//! before retirement (and the session is not reaped) or rejected with
//! [`ProxyError::SessionRetired`] after it.

pub mod registry;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::backend::{BackendLauncher, Channel, InboundHandler};
use crate::error::{ProxyError, Result};
use crate::protocol::{self, Position, TextDocumentParams};
use crate::uri::{DocumentUri, WorkspaceRoot};
use crate::vfs::{RemoteSource, WorkspaceFilesystem};

pub use registry::{RegistryStats, SessionRegistry};

/// Identity of a session: which backend kind over which workspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub mode: String,
    pub root: WorkspaceRoot,
}

impl SessionKey {
    pub fn new(mode: impl Into<String>, root: WorkspaceRoot) -> Self {
        Self {
            mode: mode.into(),
            root,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mode, self.root)
    }
}

/// Per-session limits
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            max_in_flight: 256,
        }
    }
}

#[derive(Debug)]
struct Activity {
    last_activity: Instant,
    in_flight: usize,
    retired: bool,
}

/// A running backend for one workspace
pub struct Session {
    id: String,
    key: SessionKey,
    channel: Channel,
    fs: Arc<WorkspaceFilesystem>,
    created_at: Instant,
    activity: Mutex<Activity>,
    options: SessionOptions,
    initialize_result: Value,
}

impl Session {
    /// Launch and initialize a backend for `key`
    ///
    /// Starts the workspace archive download in the background so it
    /// overlaps with the backend's own startup.
    pub async fn start(
        key: SessionKey,
        launcher: &dyn BackendLauncher,
        source: Arc<dyn RemoteSource>,
        options: SessionOptions,
    ) -> Result<Arc<Self>> {
        let id = format!("ses_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let io = launcher.launch(&key).await?;

        let fs = Arc::new(WorkspaceFilesystem::new(key.root.clone(), source));
        let prefetch = fs.clone();
        tokio::spawn(async move {
            if let Err(e) = prefetch.stat("/").await {
                debug!("Prefetch of {} failed: {}", prefetch.root(), e);
            }
        });

        let channel = Channel::start(
            format!("{} {}", id, key),
            io,
            Arc::new(WorkspaceHandler { fs: fs.clone() }),
            options.request_timeout,
        );

        let root = key.root.to_string();
        let params = json!({
            "processId": null,
            "rootPath": root,
            "rootUri": root,
            "capabilities": {},
            "initializationOptions": { "mode": key.mode },
        });
        let handshake = async {
            let result = channel.call(protocol::INITIALIZE, params).await?;
            channel.notify(protocol::INITIALIZED, json!({})).await?;
            Ok::<_, ProxyError>(result)
        };
        let initialize_result = match handshake.await {
            Ok(result) => result,
            Err(e) => {
                channel.shutdown(options.shutdown_timeout).await;
                return Err(e);
            }
        };

        info!("Session {} started for {}", id, key);
        let now = Instant::now();
        Ok(Arc::new(Self {
            id,
            key,
            channel,
            fs,
            created_at: now,
            activity: Mutex::new(Activity {
                last_activity: now,
                in_flight: 0,
                retired: false,
            }),
            options,
            initialize_result,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn root(&self) -> &WorkspaceRoot {
        &self.key.root
    }

    pub fn filesystem(&self) -> &Arc<WorkspaceFilesystem> {
        &self.fs
    }

    /// Result of the backend's `initialize`, replayed to every client
    pub fn initialize_result(&self) -> &Value {
        &self.initialize_result
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn idle_for(&self) -> Duration {
        self.activity.lock().last_activity.elapsed()
    }

    pub fn in_flight(&self) -> usize {
        self.activity.lock().in_flight
    }

    pub fn is_retired(&self) -> bool {
        self.activity.lock().retired
    }

    /// Usable for new requests
    pub fn is_alive(&self) -> bool {
        !self.is_retired() && !self.channel.is_closed()
    }

    /// Admit one request, failing if retired, broken or saturated
    pub fn begin_request(&self) -> Result<InFlightGuard<'_>> {
        let mut activity = self.activity.lock();
        if activity.retired {
            return Err(ProxyError::SessionRetired {
                key: self.key.to_string(),
            });
        }
        if self.channel.is_closed() {
            return Err(ProxyError::backend_closed(format!(
                "backend for {} is gone",
                self.key
            )));
        }
        if activity.in_flight >= self.options.max_in_flight {
            return Err(ProxyError::resource_exhausted(format!(
                "session {} already has {} requests in flight",
                self.id, activity.in_flight
            )));
        }
        activity.in_flight += 1;
        activity.last_activity = Instant::now();
        Ok(InFlightGuard { session: self })
    }

    fn end_request(&self) {
        let mut activity = self.activity.lock();
        activity.in_flight = activity.in_flight.saturating_sub(1);
        activity.last_activity = Instant::now();
    }

    /// Forward an arbitrary request to the backend
    pub async fn forward(&self, method: &str, params: Value) -> Result<Value> {
        let _guard = self.begin_request()?;
        self.channel.call(method, params).await
    }

    /// Validate a position against the document, then forward the query
    pub async fn position_query(
        &self,
        method: &str,
        document: &DocumentUri,
        position: Position,
        params: Value,
    ) -> Result<Value> {
        let _guard = self.begin_request()?;
        let text = self.fs.read_document(document.file_path()).await?;
        text.check_position(position.line, position.character)
            .map_err(ProxyError::invalid_location)?;
        self.channel.call(method, params).await
    }

    /// Retire if idle longer than `older_than` with nothing in flight
    ///
    /// A zero threshold matches every idle session.
    pub(crate) fn try_retire(&self, older_than: Duration) -> bool {
        let mut activity = self.activity.lock();
        if activity.retired || activity.in_flight > 0 {
            return false;
        }
        if !idle_exceeds(activity.last_activity.elapsed(), older_than) {
            return false;
        }
        activity.retired = true;
        true
    }

    pub(crate) fn retire(&self) {
        self.activity.lock().retired = true;
    }

    /// Whether the reaper should consider this session
    pub fn is_idle_longer_than(&self, older_than: Duration) -> bool {
        let activity = self.activity.lock();
        !activity.retired
            && activity.in_flight == 0
            && idle_exceeds(activity.last_activity.elapsed(), older_than)
    }

    /// Retire and stop the backend
    pub async fn shutdown(&self) {
        self.retire();
        self.channel.shutdown(self.options.shutdown_timeout).await;
        info!(
            "Session {} for {} shut down after {:?}",
            self.id,
            self.key,
            self.created_at.elapsed()
        );
    }
}

fn idle_exceeds(idle: Duration, threshold: Duration) -> bool {
    threshold.is_zero() || idle > threshold
}

impl Drop for Session {
    fn drop(&mut self) {
        // Stops the reader task and kills a backend that never got a graceful shutdown
        self.channel.abort();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let activity = self.activity.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("in_flight", &activity.in_flight)
            .field("retired", &activity.retired)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Marks one request in flight until dropped
pub struct InFlightGuard<'a> {
    session: &'a Session,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.session.end_request();
    }
}

/// Serves backend requests for workspace content
struct WorkspaceHandler {
    fs: Arc<WorkspaceFilesystem>,
}

impl WorkspaceHandler {
    fn document(&self, uri: &str) -> Result<DocumentUri> {
        let document = DocumentUri::parse(uri)?;
        if document.root() != self.fs.root() {
            return Err(ProxyError::RootMismatch {
                root: self.fs.root().to_string(),
                document: uri.to_string(),
            });
        }
        Ok(document)
    }
}

#[async_trait]
impl InboundHandler for WorkspaceHandler {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            protocol::XCONTENT => {
                let params: TextDocumentParams = serde_json::from_value(params)
                    .map_err(|e| ProxyError::invalid_request(e.to_string()))?;
                let document = self.document(&params.text_document.uri)?;
                let text = self.fs.read_document(document.file_path()).await?;
                Ok(json!({
                    "uri": params.text_document.uri,
                    "text": text.text(),
                }))
            }
            protocol::XFILES => {
                let root = self.fs.root();
                let files: Vec<Value> = self
                    .fs
                    .list_files()
                    .await?
                    .iter()
                    .map(|path| json!({ "uri": root.with_file_path(path).to_string() }))
                    .collect();
                Ok(Value::Array(files))
            }
            other => Err(ProxyError::MethodNotFound {
                method: other.to_string(),
            }),
        }
    }

    async fn handle_notification(&self, method: &str, _params: Value) {
        debug!("Backend notification {} for {}", method, self.fs.root());
    }
}
