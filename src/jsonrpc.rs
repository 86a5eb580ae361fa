//! JSON-RPC 2.0 messages with LSP `Content-Length` framing
//!
//! Both sides of the proxy speak the same wire format:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"initialize",...}
//! ```

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Error codes used on the wire
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const REQUEST_CANCELLED: i64 = -32800;

    pub const RESOURCE_EXHAUSTED: i64 = -32005;
    pub const INVALID_LOCATION: i64 = -32006;
    pub const FETCH_FAILED: i64 = -32007;
    pub const BACKEND_FAILED: i64 = -32008;
    pub const REQUEST_TIMEOUT: i64 = -32009;
    pub const ROOT_MISMATCH: i64 = -32010;
}

/// Request identifier (numbers and strings are both legal)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id as i64)
    }
}

/// A JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded incoming message
#[derive(Debug, Clone)]
pub enum Incoming {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Option<RequestId>,
        outcome: std::result::Result<Value, ErrorObject>,
    },
}

/// Wire shape of any message, before classification
#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    // Present-but-null must stay distinguishable from absent
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Incoming {
    /// Decode a frame body
    pub fn decode(body: &[u8]) -> Result<Self> {
        let raw: RawMessage = serde_json::from_slice(body)?;
        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Ok(Incoming::Request {
                id,
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (Some(method), None) => Ok(Incoming::Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (None, id) => {
                let outcome = match (raw.error, raw.result) {
                    (Some(error), _) => Err(error),
                    (None, Some(result)) => Ok(result),
                    (None, None) => {
                        return Err(ProxyError::invalid_request(
                            "message has neither method, result nor error",
                        ))
                    }
                };
                Ok(Incoming::Response { id, outcome })
            }
        }
    }
}

/// A message to be written to a peer
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Response(ResponseMessage),
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestMessage {
    jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationMessage {
    jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    jsonrpc: &'static str,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Result half of a response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
}

impl Outgoing {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Outgoing::Request(RequestMessage {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Outgoing::Notification(NotificationMessage {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        })
    }

    pub fn response(
        id: Option<RequestId>,
        outcome: std::result::Result<Value, ErrorObject>,
    ) -> Self {
        Outgoing::Response(ResponseMessage {
            jsonrpc: "2.0",
            id,
            outcome: match outcome {
                Ok(value) => Outcome::Result(value),
                Err(error) => Outcome::Error(error),
            },
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Read one framed message body
///
/// Returns `Ok(None)` on a clean end of stream before any header.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if saw_header {
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside message headers",
                )));
            }
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if saw_header {
                break;
            }
            // Tolerate stray blank lines between messages
            continue;
        }
        saw_header = true;

        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len = value.trim().parse::<usize>().map_err(|e| {
                    ProxyError::invalid_request(format!("invalid Content-Length: {}", e))
                })?;
                content_length = Some(len);
            }
        }
    }

    let len = content_length
        .ok_or_else(|| ProxyError::invalid_request("missing Content-Length header"))?;
    if len > MAX_FRAME_LEN {
        return Err(ProxyError::resource_exhausted(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    tracing::trace!("<- {}", String::from_utf8_lossy(&body));
    Ok(Some(body))
}

/// Write one framed message body
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tracing::trace!("-> {}", String::from_utf8_lossy(body));
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write a message
pub async fn write_message<W>(writer: &mut W, message: &Outgoing) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &message.encode()?).await
}
