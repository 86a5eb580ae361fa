//! Error types for xlang-proxy
//!
//! Errors fall into four families that callers treat differently:
//!
//! | Kind               | Examples                                     | Effect                         |
//! |--------------------|----------------------------------------------|--------------------------------|
//! | Client             | malformed request, root mismatch, bad range  | reported to the client only    |
//! | RemoteFetch        | archive download failed, path not found      | reported to the triggering call|
//! | Backend            | backend error, broken channel, timeout       | session may be discarded       |
//! | ResourceExhausted  | session or in-flight cap exceeded            | caller should back off         |

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::jsonrpc::{codes, ErrorObject};

/// Error returned by the workspace filesystem
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("failed to fetch {path}: {message}")]
    Remote { path: String, message: String },

    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("is a directory: {path}")]
    IsADirectory { path: String },

    /// Positions are counted in characters, so documents must be UTF-8
    #[error("not a UTF-8 text file: {path}")]
    NotText { path: String },
}

impl FetchError {
    /// The path the failing operation was addressing
    pub fn path(&self) -> &str {
        match self {
            Self::Remote { path, .. }
            | Self::NotFound { path }
            | Self::NotADirectory { path }
            | Self::IsADirectory { path }
            | Self::NotText { path } => path,
        }
    }
}

/// Broad classification of a [`ProxyError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    RemoteFetch,
    Backend,
    ResourceExhausted,
    Internal,
}

/// Main error type for proxy operations
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("method not found: {method}")]
    MethodNotFound { method: String },

    #[error("connection is not initialized")]
    NotInitialized,

    #[error("connection is already initialized")]
    AlreadyInitialized,

    #[error("invalid URI {uri:?}: {message}")]
    InvalidUri { uri: String, message: String },

    #[error("document {document} is not in workspace root {root}")]
    RootMismatch { root: String, document: String },

    /// A position outside an otherwise valid document. Harmless.
    #[error("invalid location: {message}")]
    InvalidLocation { message: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Error object returned by the JSON-RPC peer, relayed verbatim
    #[error("{message} (code {code})")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("backend connection closed: {reason}")]
    BackendClosed { reason: String },

    #[error("session {key} has been retired")]
    SessionRetired { key: String },

    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("no backend configured for mode {mode:?}")]
    UnknownMode { mode: String },

    #[error("failed to start backend for mode {mode:?}: {message}")]
    Spawn { mode: String, message: String },

    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn invalid_location(message: impl Into<String>) -> Self {
        Self::InvalidLocation {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    pub fn backend_closed(reason: impl Into<String>) -> Self {
        Self::BackendClosed {
            reason: reason.into(),
        }
    }

    /// Classify the error for callers deciding between retry, backoff and reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. }
            | Self::MethodNotFound { .. }
            | Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::InvalidUri { .. }
            | Self::RootMismatch { .. }
            | Self::InvalidLocation { .. }
            | Self::Cancelled => ErrorKind::Client,
            Self::Fetch(_) => ErrorKind::RemoteFetch,
            Self::Rpc { .. }
            | Self::BackendClosed { .. }
            | Self::SessionRetired { .. }
            | Self::Timeout { .. }
            | Self::UnknownMode { .. }
            | Self::Spawn { .. } => ErrorKind::Backend,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether this is the one error excluded from error logging: a request
    /// addressing an invalid location within a valid document.
    ///
    /// Backends report the same condition with an `invalid location:` message,
    /// so relayed errors are matched on that prefix.
    pub fn is_harmless(&self) -> bool {
        match self {
            Self::InvalidLocation { .. } => true,
            Self::Rpc { code, message, .. } => {
                *code == codes::INVALID_LOCATION || message.starts_with("invalid location:")
            }
            _ => false,
        }
    }

    /// Whether the session that produced this error can no longer be used
    pub fn breaks_session(&self) -> bool {
        matches!(self, Self::BackendClosed { .. })
    }

    /// JSON-RPC error code reported to clients
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidRequest { .. } | Self::InvalidUri { .. } => codes::INVALID_PARAMS,
            Self::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            Self::NotInitialized => codes::SERVER_NOT_INITIALIZED,
            Self::AlreadyInitialized => codes::INVALID_REQUEST,
            Self::RootMismatch { .. } => codes::ROOT_MISMATCH,
            Self::InvalidLocation { .. } => codes::INVALID_LOCATION,
            Self::Fetch(_) => codes::FETCH_FAILED,
            Self::Rpc { code, .. } => *code,
            Self::BackendClosed { .. }
            | Self::SessionRetired { .. }
            | Self::UnknownMode { .. }
            | Self::Spawn { .. } => codes::BACKEND_FAILED,
            Self::Timeout { .. } => codes::REQUEST_TIMEOUT,
            Self::ResourceExhausted { .. } => codes::RESOURCE_EXHAUSTED,
            Self::Cancelled => codes::REQUEST_CANCELLED,
            Self::Json(_) => codes::PARSE_ERROR,
            Self::Io(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Convert into the error object sent on the wire
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::Rpc {
                code,
                message,
                data,
            } => ErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => ErrorObject {
                code: other.code(),
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl From<ErrorObject> for ProxyError {
    fn from(error: ErrorObject) -> Self {
        Self::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
