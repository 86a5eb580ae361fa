//! Transport tests: LSP framing over TCP and JSON-RPC over WebSocket

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, client_async, WebSocketStream};

use xlang_proxy::backend::{BackendIo, Channel, IgnoreInbound};
use xlang_proxy::jsonrpc::{codes, read_frame, write_frame, Incoming, RequestId};
use xlang_proxy::protocol::HOVER;
use xlang_proxy::testing::position_params;

use crate::common::{ProxyFixture, MODE};

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn test_tcp_client_round_trip() {
    let fixture = ProxyFixture::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(fixture.proxy.clone().serve(listener));

    let stream = TcpStream::connect(addr).await.unwrap();
    let client = Channel::start(
        "tcp-client",
        BackendIo::from_stream(stream),
        Arc::new(IgnoreInbound),
        Duration::from_secs(10),
    );

    client
        .call(
            "initialize",
            json!({ "rootPath": fixture.root.to_string(), "mode": MODE }),
        )
        .await
        .unwrap();
    let hover = client
        .call(HOVER, position_params(&fixture.document("mux.go"), 5, 7))
        .await
        .unwrap();
    assert_eq!(hover["contents"]["value"], json!("NewRouter"));

    client.close("done").await;
    server.abort();
}

#[tokio::test]
async fn test_undecodable_message_gets_error_reply() {
    let fixture = ProxyFixture::new();
    let (client_end, proxy_end) = tokio::io::duplex(64 * 1024);
    let connection = fixture
        .proxy
        .spawn_connection(proxy_end, "raw-client".to_string());
    let (reader, mut writer) = tokio::io::split(client_end);
    let mut reader = BufReader::new(reader);

    write_frame(&mut writer, b"{not json").await.unwrap();
    let frame = read_frame(&mut reader).await.unwrap().expect("a reply");
    match Incoming::decode(&frame).unwrap() {
        Incoming::Response { id, outcome } => {
            assert_eq!(id, None);
            assert_eq!(outcome.unwrap_err().code, codes::PARSE_ERROR);
        }
        other => panic!("expected a response, got {other:?}"),
    }

    // The connection survives and ends on `exit`
    write_frame(
        &mut writer,
        br#"{"jsonrpc":"2.0","id":"a","method":"shutdown"}"#,
    )
    .await
    .unwrap();
    let frame = read_frame(&mut reader).await.unwrap().expect("a reply");
    match Incoming::decode(&frame).unwrap() {
        Incoming::Response { id, outcome } => {
            assert_eq!(id, Some(RequestId::String("a".to_string())));
            assert_eq!(outcome.unwrap(), Value::Null);
        }
        other => panic!("expected a response, got {other:?}"),
    }

    write_frame(&mut writer, br#"{"jsonrpc":"2.0","method":"exit"}"#)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), connection)
        .await
        .expect("connection ends after exit")
        .unwrap();
    assert!(read_frame(&mut reader).await.unwrap().is_none());
    let _ = writer.shutdown().await;
}

// ============================================================================
// WEBSOCKET
// ============================================================================

async fn websocket_pair(
    fixture: &ProxyFixture,
) -> WebSocketStream<tokio::io::DuplexStream> {
    let (client_end, proxy_end) = tokio::io::duplex(64 * 1024);
    let proxy = fixture.proxy.clone();
    tokio::spawn(async move {
        let ws = accept_async(proxy_end).await.expect("handshake");
        proxy.run_websocket(ws, "ws-client".to_string()).await;
    });
    let (ws, _response) = client_async("ws://localhost/", client_end)
        .await
        .expect("handshake");
    ws
}

async fn ws_call(
    ws: &mut WebSocketStream<tokio::io::DuplexStream>,
    id: i64,
    method: &str,
    params: Value,
) -> Value {
    let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
    ws.send(Message::Text(request.to_string())).await.unwrap();
    loop {
        let message = ws.next().await.expect("open").expect("message");
        if let Message::Text(text) = message {
            let reply: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(reply["id"], json!(id));
            return reply;
        }
    }
}

#[tokio::test]
async fn test_websocket_client() {
    let fixture = ProxyFixture::new();
    let mut ws = websocket_pair(&fixture).await;

    let reply = ws_call(
        &mut ws,
        1,
        "initialize",
        json!({ "rootPath": fixture.root.to_string(), "mode": MODE }),
    )
    .await;
    assert_eq!(reply["result"]["capabilities"]["hoverProvider"], json!(true));

    let reply = ws_call(
        &mut ws,
        2,
        HOVER,
        position_params(&fixture.document("route.go"), 2, 6),
    )
    .await;
    assert_eq!(reply["result"]["contents"]["value"], json!("Route"));

    let reply = ws_call(
        &mut ws,
        3,
        HOVER,
        position_params(&fixture.document("route.go"), 40, 0),
    )
    .await;
    assert_eq!(reply["error"]["code"], json!(codes::INVALID_LOCATION));

    ws.close(None).await.unwrap();
    assert_eq!(fixture.launcher.launches(), 1);
}
