mod common;

use std::time::Duration;

use common::{get, open_payload, open_polling, poll, post, uri, wait_until};
use http::header::ORIGIN;
use http::HeaderValue;
use serde_json::json;
use tidepool::io::Server;
use tidepool::{Engine, EngineConfig, Method, OriginPolicy, Request};
use tidepool_core::Data;

#[tokio::test]
async fn handshake_then_default_namespace_connect() {
    let (engine, connections) = Engine::new(EngineConfig::default());
    let io = Server::new();
    let _binder = io.bind(connections);

    let response = engine.handle_request(get("transport=polling")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/plain; charset=UTF-8"));
    let open = open_payload(&response);
    let sid = open["sid"].as_str().unwrap().to_string();
    assert_eq!(open["upgrades"], json!(["websocket"]));
    assert_eq!(open["pingInterval"], json!(25000));
    assert_eq!(open["pingTimeout"], json!(60000));
    let cookie = response.header("set-cookie").unwrap();
    assert!(cookie.starts_with(&format!("io={sid};")));

    let response = engine
        .handle_request(post(&format!("transport=polling&sid={sid}"), "2:40"))
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), Some("ok"));

    let response = tokio::time::timeout(Duration::from_secs(5), engine.handle_request(poll(&sid)))
        .await
        .unwrap();
    let ack = format!("40{{\"sid\":\"{sid}\"}}");
    assert_eq!(response.body_text().unwrap(), format!("{}:{}", ack.len(), ack));

    let root = io.of("/");
    assert_eq!(root.len(), 1);
    assert!(root.socket(&sid).is_some());
}

#[tokio::test]
async fn sids_are_unique_across_handshakes() {
    let (engine, _connections) = Engine::new(EngineConfig::default());
    let first = open_polling(&engine).await;
    let second = open_polling(&engine).await;
    assert_ne!(first, second);
    assert_eq!(engine.session_count(), 2);
}

#[tokio::test]
async fn refused_requests_carry_error_codes() {
    let (engine, _connections) = Engine::new(EngineConfig::default());

    let response = engine.handle_request(get("transport=carrier-pigeon")).await;
    assert_eq!(response.status, 403);
    assert_eq!(
        response.body_text(),
        Some(r#"{"code":0,"message":"Transport unknown"}"#)
    );

    let response = engine.handle_request(poll("does-not-exist")).await;
    assert_eq!(
        response.body_text(),
        Some(r#"{"code":1,"message":"Session ID unknown"}"#)
    );

    let response = engine
        .handle_request(Request::new(
            Method::POST,
            uri("/socket.io/?EIO=3&transport=polling".to_string()),
        ))
        .await;
    assert_eq!(
        response.body_text(),
        Some(r#"{"code":2,"message":"Bad handshake method"}"#)
    );

    assert_eq!(engine.session_count(), 0);
}

fn handshake_from(origin: &'static str) -> Request {
    get("transport=polling").with_header(ORIGIN, HeaderValue::from_static(origin))
}

#[tokio::test]
async fn origin_policy_gates_handshakes() {
    let config = EngineConfig {
        origins: "http://a.com:80 http://b.com:*".parse::<OriginPolicy>().unwrap(),
        ..EngineConfig::default()
    };
    let (engine, _connections) = Engine::new(config);

    let response = engine
        .handle_request(handshake_from("http://c.com"))
        .await;
    assert_eq!(response.status, 403);
    assert_eq!(
        response.body_text(),
        Some(r#"{"code":null,"message":"Origin not allowed"}"#)
    );

    let response = engine
        .handle_request(handshake_from("http://b.com:9000"))
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(
        response.header("access-control-allow-origin"),
        Some("http://b.com:9000")
    );
    assert_eq!(response.header("access-control-allow-credentials"), Some("true"));

    let response = engine
        .handle_request(handshake_from("http://a.com"))
        .await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn overlapping_poll_is_rejected_and_first_poll_kept() {
    let (engine, _connections) = Engine::new(EngineConfig::default());
    let sid = open_polling(&engine).await;
    let session = engine.session(&sid).unwrap();

    let first = tokio::spawn({
        let engine = engine.clone();
        let sid = sid.clone();
        async move { engine.handle_request(poll(&sid)).await }
    });
    wait_until(|| session.transport_writable()).await;

    let second = engine.handle_request(poll(&sid)).await;
    assert_eq!(second.status, 403);
    assert_eq!(second.body_text(), Some(r#"{"code":3,"message":"Bad request"}"#));

    session.write(Data::from("hello"));
    let first = first.await.unwrap();
    assert_eq!(first.body_text(), Some("6:4hello"));
}

#[tokio::test]
async fn abandoned_poll_neither_blocks_the_next_nor_eats_writes() {
    let (engine, _connections) = Engine::new(EngineConfig::default());
    let sid = open_polling(&engine).await;
    let session = engine.session(&sid).unwrap();

    let parked = tokio::spawn({
        let engine = engine.clone();
        let sid = sid.clone();
        async move { engine.handle_request(poll(&sid)).await }
    });
    wait_until(|| session.transport_writable()).await;
    parked.abort();
    assert!(parked.await.unwrap_err().is_cancelled());
    assert!(!session.transport_writable());

    session.write(Data::from("hello"));
    assert_eq!(session.buffered(), 1);

    let response = engine.handle_request(poll(&sid)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), Some("6:4hello"));
    assert_eq!(session.buffered(), 0);
}

#[tokio::test]
async fn idle_poll_is_released_with_noop() {
    let config = EngineConfig {
        poll_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let (engine, _connections) = Engine::new(config);
    let sid = open_polling(&engine).await;

    let response = engine.handle_request(poll(&sid)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), Some("1:6"));
    assert!(engine.session(&sid).is_some());
}

#[tokio::test]
async fn writes_are_buffered_until_the_next_poll() {
    let (engine, _connections) = Engine::new(EngineConfig::default());
    let sid = open_polling(&engine).await;
    let session = engine.session(&sid).unwrap();

    session.write(Data::from("a"));
    session.write(Data::from("bc"));
    assert_eq!(session.buffered(), 2);

    let response = engine.handle_request(poll(&sid)).await;
    assert_eq!(response.body_text(), Some("2:4a3:4bc"));
    assert_eq!(session.buffered(), 0);
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (engine, _connections) = Engine::new(EngineConfig::default());
    let sid = open_polling(&engine).await;

    let response = engine
        .handle_request(post(&format!("transport=polling&sid={sid}"), "6:2probe"))
        .await;
    assert_eq!(response.body_text(), Some("ok"));

    let response = engine.handle_request(poll(&sid)).await;
    assert_eq!(response.body_text(), Some("6:3probe"));
}

#[tokio::test]
async fn malformed_post_closes_the_session() {
    let (engine, _connections) = Engine::new(EngineConfig::default());
    let sid = open_polling(&engine).await;

    let response = engine
        .handle_request(post(&format!("transport=polling&sid={sid}"), "9:4short"))
        .await;
    assert_eq!(response.status, 403);
    assert_eq!(response.body_text(), Some(r#"{"code":3,"message":"Bad request"}"#));
    assert!(engine.session(&sid).is_none());
}

#[tokio::test]
async fn client_close_frame_ends_the_session() {
    let (engine, mut connections) = Engine::new(EngineConfig::default());
    let sid = open_polling(&engine).await;
    let session = connections.recv().await.unwrap();
    let mut events = session.take_events().unwrap();

    engine
        .handle_request(post(&format!("transport=polling&sid={sid}"), "1:1"))
        .await;

    assert!(engine.session(&sid).is_none());
    assert_eq!(
        events.recv().await,
        Some(tidepool::SessionEvent::Close(tidepool::CloseReason::TransportClose))
    );
}

#[tokio::test]
async fn jsonp_handshake_is_wrapped() {
    let (engine, _connections) = Engine::new(EngineConfig::default());
    let response = engine.handle_request(get("transport=polling&j=2")).await;

    assert_eq!(response.status, 200);
    assert_eq!(
        response.header("content-type"),
        Some("text/javascript; charset=UTF-8")
    );
    let body = response.body_text().unwrap();
    assert!(body.starts_with("___eio[2](\""));
    assert!(body.ends_with("\");"));
}

#[tokio::test]
async fn options_preflight_allows_content_type() {
    let (engine, _connections) = Engine::new(EngineConfig::default());
    let sid = open_polling(&engine).await;

    let request = Request::new(
        Method::OPTIONS,
        uri(format!("/socket.io/?EIO=3&transport=polling&sid={sid}")),
    )
    .with_header(ORIGIN, HeaderValue::from_static("http://a.com"));
    let response = engine.handle_request(request).await;
    assert_eq!(response.status, 200);
    assert_eq!(
        response.header("access-control-allow-headers"),
        Some("Content-Type")
    );
    assert_eq!(
        response.header("access-control-allow-origin"),
        Some("http://a.com")
    );
}

#[tokio::test]
async fn server_close_releases_the_parked_poll() {
    let (engine, _connections) = Engine::new(EngineConfig::default());
    let sid = open_polling(&engine).await;
    let session = engine.session(&sid).unwrap();

    let parked = tokio::spawn({
        let engine = engine.clone();
        let sid = sid.clone();
        async move { engine.handle_request(poll(&sid)).await }
    });
    wait_until(|| session.transport_writable()).await;

    session.close();
    let response = parked.await.unwrap();
    assert_eq!(response.body_text(), Some("1:1"));
    assert!(engine.session(&sid).is_none());
    assert_eq!(session.ready_state(), tidepool::ReadyState::Closed);
}
