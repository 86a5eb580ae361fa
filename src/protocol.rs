//! Client and backend protocol message types
//!
//! Defines the JSON parameter shapes the proxy itself interprets. Result
//! payloads are never interpreted; they are relayed as raw JSON.
//!
//! ```json
//! // Client -> Proxy
//! {"method": "initialize", "params": {"rootPath": "git://github.com/gorilla/mux?0a192a19", "mode": "go"}}
//! {"method": "textDocument/hover", "params": {"textDocument": {"uri": "git://github.com/gorilla/mux?0a192a19#mux.go"}, "position": {"line": 0, "character": 8}}}
//! {"method": "xlang/shutDownIdleSessions", "params": {"olderThanMs": 0}}
//!
//! // Backend -> Proxy
//! {"method": "textDocument/xcontent", "params": {"textDocument": {"uri": "...#mux.go"}}}
//! {"method": "workspace/xfiles", "params": {}}
//! ```

use serde::{Deserialize, Serialize};

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "initialized";
pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";
pub const CANCEL_REQUEST: &str = "$/cancelRequest";

pub const DEFINITION: &str = "textDocument/definition";
pub const HOVER: &str = "textDocument/hover";
pub const REFERENCES: &str = "textDocument/references";

/// Position queries forwarded to backends
pub const POSITION_METHODS: [&str; 3] = [DEFINITION, HOVER, REFERENCES];

/// Administrative idle sweep
pub const SHUT_DOWN_IDLE_SESSIONS: &str = "xlang/shutDownIdleSessions";

/// Backend request for the text of a workspace file
pub const XCONTENT: &str = "textDocument/xcontent";
/// Backend request for the list of workspace files
pub const XFILES: &str = "workspace/xfiles";

pub fn is_position_method(method: &str) -> bool {
    POSITION_METHODS.contains(&method)
}

/// Parameters of a client `initialize`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default)]
    pub root_path: Option<String>,
    #[serde(default)]
    pub root_uri: Option<String>,
    /// Backend kind serving the workspace
    pub mode: String,
}

impl InitializeParams {
    /// The workspace root, preferring `rootUri`
    pub fn root(&self) -> Option<&str> {
        self.root_uri
            .as_deref()
            .or(self.root_path.as_deref())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

/// 0-based position; `character` counts Unicode characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentPositionParams {
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentParams {
    pub text_document: TextDocumentIdentifier,
}

/// Parameters of `xlang/shutDownIdleSessions`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutDownIdleParams {
    #[serde(default)]
    pub older_than_ms: u64,
}

/// Parameters of `$/cancelRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: crate::jsonrpc::RequestId,
}
