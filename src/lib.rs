//! xlang-proxy: a multiplexing language-server proxy
//!
//! Many short-lived client connections share a pool of long-lived backend
//! sessions, one per (mode, workspace root). Workspaces are remote
//! repositories at a fixed revision, fetched lazily as a single archive and
//! served to backends from memory.
//!
//! # Components
//!
//! - [`vfs`]: lazily fetched, read-only workspace filesystem
//! - [`session`]: one backend per (mode, root), plus the [`SessionRegistry`]
//! - [`proxy`]: client connections and request routing
//! - [`reaper`]: retirement of idle sessions
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xlang_proxy::{Proxy, ProxyConfig};
//!
//! let config = ProxyConfig::load()?;
//! let proxy = Arc::new(Proxy::from_config(&config));
//! let listener = tokio::net::TcpListener::bind(&config.listen).await?;
//! proxy.serve(listener).await?;
//! ```

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod protocol;
pub mod proxy;
pub mod reaper;
pub mod session;
pub mod testing;
pub mod uri;
pub mod vfs;

pub use backend::{BackendIo, BackendLauncher, Channel, ProcessLauncher};
pub use config::{ConfigError, ProxyConfig};
pub use error::{ErrorKind, FetchError, ProxyError, Result};
pub use proxy::{Proxy, ProxyOptions};
pub use reaper::{reap, spawn_reaper, ReapStats};
pub use session::{Session, SessionKey, SessionOptions, SessionRegistry};
pub use uri::{DocumentUri, WorkspaceRoot};
pub use vfs::{ArchiveSource, RemoteSource, Snapshot, WorkspaceFilesystem};
