//! TCP host: reads raw bytes, delimits requests with the framing adapter,
//! routes them, and bridges upgraded connections onto engine channels.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use http::{HeaderValue, StatusCode};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tidepool_core::Data;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::UpgradeError;
use crate::framing::{FrameAdapter, Framed, FramingError};
use crate::message::{ConnectionInfo, Request, Response};
use crate::transport::{WebSocketChannel, WebSocketPeer, WsCommand, WsEvent};

pub const DEFAULT_PATH: &str = "/socket.io/";

pub struct Listener {
    engine: Engine,
    path: String,
    metrics: Option<PrometheusHandle>,
    adapter: FrameAdapter,
}

impl Listener {
    pub fn new(engine: Engine, path: impl Into<String>, metrics: Option<PrometheusHandle>) -> Self {
        let adapter = FrameAdapter::new(engine.config().max_package_size);
        Self {
            engine,
            path: path.into(),
            metrics,
            adapter,
        }
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let host = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = host.handle_connection(stream, peer).await {
                                debug!(peer = %peer, error = %err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                _ = &mut shutdown => {
                    info!("listener stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let connection = ConnectionInfo::new(Some(peer));
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            let framed = match self.adapter.input(&buf, connection) {
                Ok(framed) => framed,
                Err(err) => {
                    warn!(peer = %peer, error = %err, "refusing unframeable request");
                    counter!("tidepool_framing_rejections_total", 1, "reason" => err.metric_label());
                    stream.write_all(err.response()).await?;
                    stream.shutdown().await?;
                    return Ok(());
                }
            };

            match framed {
                Framed::Upgrade(request) => return self.upgrade(stream, request).await,
                Framed::Request { length } if buf.len() >= length => {
                    let raw = buf.split_to(length).freeze();
                    let request = match Request::parse(raw, connection) {
                        Ok(request) => request,
                        Err(err) => {
                            counter!("tidepool_framing_rejections_total", 1, "reason" => err.metric_label());
                            stream.write_all(err.response()).await?;
                            stream.shutdown().await?;
                            return Ok(());
                        }
                    };
                    let keep_alive = request.keep_alive();
                    let Some(response) = self.route_while_connected(request, &mut stream, &mut buf).await
                    else {
                        debug!(peer = %peer, "peer went away while its request was pending");
                        return Ok(());
                    };
                    stream.write_all(&response.to_bytes(keep_alive)).await?;
                    if !keep_alive {
                        stream.shutdown().await?;
                        return Ok(());
                    }
                    continue;
                }
                Framed::Request { .. } | Framed::Incomplete => {}
            }

            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    /// Routes `request` while watching the socket. A peer that hangs up
    /// before the answer is ready cancels the request, which releases a
    /// parked poll so the session keeps its queued frames. Bytes pipelined
    /// behind the request are kept in `buf`.
    async fn route_while_connected(
        &self,
        request: Request,
        stream: &mut TcpStream,
        buf: &mut BytesMut,
    ) -> Option<Response> {
        let route = self.route(request);
        tokio::pin!(route);
        loop {
            tokio::select! {
                response = &mut route => return Some(response),
                read = stream.read_buf(&mut *buf) => match read {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                },
            }
        }
    }

    async fn route(&self, request: Request) -> Response {
        let path = request.path();
        if path.starts_with(&self.path) || format!("{path}/") == self.path {
            return self.engine.handle_request(request).await;
        }
        match path {
            "/healthz" => Response::new(StatusCode::OK)
                .with_body("application/json", json!({ "status": "ok" }).to_string()),
            "/metrics" => match &self.metrics {
                Some(handle) => Response::new(StatusCode::OK)
                    .with_body("text/plain; version=0.0.4", handle.render()),
                None => Response::not_found(),
            },
            _ => Response::not_found(),
        }
    }

    async fn upgrade(&self, mut stream: TcpStream, request: Request) -> Result<()> {
        if !request.path().starts_with(&self.path) {
            stream.write_all(&Response::not_found().to_bytes(false)).await?;
            return Ok(());
        }
        let Some(key) = request.header(SEC_WEBSOCKET_KEY.as_str()).map(str::to_string) else {
            let err = FramingError::BadRequest("missing websocket key");
            stream.write_all(err.response()).await?;
            return Ok(());
        };
        if let Err(err) = self.engine.verify_upgrade(&request) {
            warn!(error = %err, "refusing websocket upgrade");
            counter!("tidepool_upgrades_total", 1, "outcome" => err.metric_label());
            let response = upgrade_error_response(&err, request.origin());
            stream.write_all(&response.to_bytes(false)).await?;
            return Ok(());
        }

        let accept = HeaderValue::from_str(&derive_accept_key(key.as_bytes()))?;
        let switching = Response::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(UPGRADE, HeaderValue::from_static("websocket"))
            .with_header(CONNECTION, HeaderValue::from_static("Upgrade"))
            .with_header(SEC_WEBSOCKET_ACCEPT, accept);
        stream.write_all(&switching.to_bytes(true)).await?;
        let socket = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;

        let (channel, peer) = WebSocketChannel::pair();
        if let Err(err) = self.engine.handle_upgrade(request, channel) {
            debug!(error = %err, "upgrade dropped after switching protocols");
            return Ok(());
        }
        bridge(socket, peer).await;
        Ok(())
    }
}

fn upgrade_error_response(err: &UpgradeError, origin: Option<&str>) -> Response {
    match err {
        UpgradeError::Rejected(inner) => Response::request_error(*inner, origin),
        other => Response::json_error(Some(3), &other.to_string(), origin),
    }
}

/// Pumps frames between the socket and the engine's channel pair until
/// either side goes away.
async fn bridge(socket: WebSocketStream<TcpStream>, peer: WebSocketPeer) {
    let WebSocketPeer {
        mut commands,
        events,
    } = peer;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let message = match command {
                WsCommand::Send(Data::Text(text)) => Message::text(text),
                WsCommand::Send(Data::Binary(bytes)) => Message::binary(bytes),
                WsCommand::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(err) = sink.send(message).await {
                debug!(error = %err, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        let event = match message {
            Ok(Message::Text(text)) => WsEvent::Message(Data::Text(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => WsEvent::Message(Data::Binary(bytes)),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                let _ = events.send(WsEvent::Error(err.to_string()));
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
    let _ = events.send(WsEvent::Closed);
    writer.abort();
}
