#![allow(dead_code)]

use std::time::Duration;

use http::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use http::{HeaderValue, Uri};
use serde_json::Value;
use tidepool::{Engine, Method, Request, Response, WebSocketChannel, WebSocketPeer, WsCommand};
use tidepool_core::Data;

pub fn uri(target: String) -> Uri {
    target.parse().expect("valid request target")
}

pub fn get(query: &str) -> Request {
    Request::new(Method::GET, uri(format!("/socket.io/?EIO=3&{query}")))
}

pub fn post(query: &str, body: &str) -> Request {
    Request::new(Method::POST, uri(format!("/socket.io/?EIO=3&{query}")))
        .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain;charset=UTF-8"))
        .with_body(body.to_string())
}

pub fn poll(sid: &str) -> Request {
    get(&format!("transport=polling&sid={sid}"))
}

pub fn websocket(query: &str) -> Request {
    Request::new(
        Method::GET,
        uri(format!("/socket.io/?EIO=3&transport=websocket{query}")),
    )
    .with_header(UPGRADE, HeaderValue::from_static("websocket"))
    .with_header(CONNECTION, HeaderValue::from_static("Upgrade"))
}

/// Parses the open frame out of a handshake response body.
pub fn open_payload(response: &Response) -> Value {
    let body = response.body_text().expect("text body");
    let (_, frame) = body.split_once(':').expect("length prefix");
    let json = frame.strip_prefix('0').expect("open frame");
    serde_json::from_str(json).expect("handshake json")
}

/// Runs a polling handshake and returns the sid.
pub async fn open_polling(engine: &Engine) -> String {
    let response = engine.handle_request(get("transport=polling")).await;
    assert_eq!(response.status, 200);
    open_payload(&response)["sid"]
        .as_str()
        .expect("sid")
        .to_string()
}

/// Opens a session directly over WebSocket; returns the sid and the socket
/// side of the channel with the open frame already consumed.
pub async fn open_websocket(engine: &Engine) -> (String, WebSocketPeer) {
    let (channel, mut peer) = WebSocketChannel::pair();
    let session = engine.handle_upgrade(websocket(""), channel).expect("websocket handshake");
    let open = next_text(&mut peer).await;
    assert!(open.starts_with("0{"), "unexpected open frame {open}");
    (session.id().to_string(), peer)
}

pub async fn next_command(peer: &mut WebSocketPeer) -> WsCommand {
    tokio::time::timeout(Duration::from_secs(5), peer.commands.recv())
        .await
        .expect("command within timeout")
        .expect("command channel open")
}

pub async fn next_text(peer: &mut WebSocketPeer) -> String {
    match next_command(peer).await {
        WsCommand::Send(Data::Text(text)) => text,
        other => panic!("expected a text message, got {other:?}"),
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
