//! Backend collaborators
//!
//! A backend is an opaque language server. The proxy only needs a byte
//! stream to it ([`BackendIo`]), obtained from a [`BackendLauncher`], and
//! speaks JSON-RPC over that stream through a [`Channel`].

pub mod channel;
pub mod process;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

use crate::error::Result;
use crate::session::SessionKey;

pub use channel::{Channel, IgnoreInbound, InboundHandler, WeakChannel};
pub use process::ProcessLauncher;

/// Byte streams to a started backend
pub struct BackendIo {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Process to reap on shutdown, if the backend is a child process
    pub child: Option<Child>,
}

impl BackendIo {
    /// Wrap any bidirectional stream (pipes, sockets, in-memory duplex)
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

/// Starts the backend serving a session key
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self, key: &SessionKey) -> Result<BackendIo>;
}
