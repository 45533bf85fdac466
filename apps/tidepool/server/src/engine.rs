use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use http::header::SET_COOKIE;
use http::{HeaderValue, Method};
use metrics::{counter, decrement_gauge, increment_gauge};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{RequestError, UpgradeError};
use crate::message::{Request, Response};
use crate::session::Session;
use crate::transport::{
    Polling, PollingFlavor, Transport, TransportKind, WebSocketChannel, WebSocketTransport,
    WsEvent,
};

/// Session registry plus request routing. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    config: Arc<EngineConfig>,
    sessions: DashMap<String, Arc<Session>>,
    connections: mpsc::UnboundedSender<Arc<Session>>,
    next_ws_id: AtomicU64,
}

impl EngineInner {
    /// Idempotent; only the first removal of a sid counts.
    pub(crate) fn remove_session(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            decrement_gauge!("tidepool_sessions_active", 1.0);
            debug!(session_id = %id, "session removed from registry");
        }
    }
}

impl Engine {
    /// Returns the engine and the stream of newly opened sessions.
    pub fn new(config: EngineConfig) -> (Self, mpsc::UnboundedReceiver<Arc<Session>>) {
        let (connections, receiver) = mpsc::unbounded_channel();
        let inner = EngineInner {
            config: Arc::new(config),
            sessions: DashMap::new(),
            connections,
            next_ws_id: AtomicU64::new(1),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Closes every open session.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            session.close();
        }
    }

    /// Answers one plain HTTP request under the engine path.
    pub async fn handle_request(&self, request: Request) -> Response {
        match self.verify(&request, false) {
            Err(err) => {
                warn!(
                    uri = %request.uri(),
                    code = ?err.code(),
                    error = %err,
                    "request refused"
                );
                counter!("tidepool_request_errors_total", 1, "reason" => err.metric_label());
                Response::request_error(err, request.origin())
            }
            Ok(Some(session)) => session.handle_request(&request).await,
            Ok(None) => self.handshake(&request).await,
        }
    }

    /// Checks an upgrade request without touching any session. The listener
    /// calls this before answering `101 Switching Protocols`.
    pub fn verify_upgrade(&self, request: &Request) -> Result<(), UpgradeError> {
        match self.verify(request, true) {
            Ok(Some(session)) if session.is_upgraded() => Err(UpgradeError::AlreadyUpgraded),
            Ok(Some(session)) if session.is_upgrading() => Err(UpgradeError::AlreadyUpgrading),
            Ok(_) => Ok(()),
            Err(RequestError::UnknownSid) => Err(UpgradeError::ClosedClient),
            Err(err) => Err(UpgradeError::Rejected(err)),
        }
    }

    /// Attaches an accepted WebSocket, either as the upgrade candidate of an
    /// existing session or as the transport of a new one.
    pub fn handle_upgrade(
        &self,
        request: Request,
        channel: WebSocketChannel,
    ) -> Result<Arc<Session>, UpgradeError> {
        let result = self.attach_websocket(request, channel);
        if let Err(err) = &result {
            warn!(error = %err, "upgrade refused");
            counter!("tidepool_upgrades_total", 1, "outcome" => err.metric_label());
        }
        result
    }

    fn attach_websocket(
        &self,
        request: Request,
        channel: WebSocketChannel,
    ) -> Result<Arc<Session>, UpgradeError> {
        let existing = match self.verify(&request, true) {
            Ok(existing) => existing,
            Err(RequestError::UnknownSid) => return Err(UpgradeError::ClosedClient),
            Err(err) => return Err(UpgradeError::Rejected(err)),
        };
        let ws_id = self.inner.next_ws_id.fetch_add(1, Ordering::Relaxed);
        let WebSocketChannel { commands, events } = channel;
        let transport = WebSocketTransport::new(ws_id, commands, !request.has_query("b64"));

        let session = match existing {
            Some(session) => {
                session.maybe_upgrade(transport)?;
                session
            }
            None => self
                .register(Transport::WebSocket(transport), request)
                .map_err(|err| UpgradeError::Handshake(err.to_string()))?,
        };
        spawn_pump(Arc::clone(&session), ws_id, events);
        Ok(session)
    }

    /// `Ok(None)` means the request is a valid handshake.
    fn verify(
        &self,
        request: &Request,
        upgrade: bool,
    ) -> Result<Option<Arc<Session>>, RequestError> {
        let kind = request
            .query("transport")
            .and_then(TransportKind::from_name)
            .filter(|kind| self.inner.config.allows(*kind))
            .ok_or(RequestError::UnknownTransport)?;

        match request.query("sid").filter(|sid| !sid.is_empty()) {
            Some(sid) => {
                let session = self.session(sid).ok_or(RequestError::UnknownSid)?;
                if !upgrade && session.transport_name() != kind.name() {
                    debug!(session_id = %sid, transport = kind.name(), "transport mismatch");
                    return Err(RequestError::BadRequest);
                }
                Ok(Some(session))
            }
            None => {
                if request.method() != Method::GET {
                    return Err(RequestError::BadHandshakeMethod);
                }
                if !self.inner.config.origins.check(request) {
                    return Err(RequestError::OriginNotAllowed);
                }
                if kind == TransportKind::WebSocket && !upgrade {
                    return Err(RequestError::BadRequest);
                }
                Ok(None)
            }
        }
    }

    async fn handshake(&self, request: &Request) -> Response {
        let polling = Polling::new(
            PollingFlavor::from_request(request),
            !request.has_query("b64"),
        );
        let session = match self.register(Transport::Polling(polling), request.clone()) {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "handshake could not be encoded");
                return Response::internal_error();
            }
        };
        let response = session.handle_request(request).await;
        let Some(cookie) = &self.inner.config.cookie else {
            return response;
        };
        match HeaderValue::from_str(&format!(
            "{cookie}={}; Path=/; HttpOnly; SameSite=Lax",
            session.id()
        )) {
            Ok(value) => response.with_header(SET_COOKIE, value),
            Err(_) => {
                warn!(cookie = %cookie, "cookie name is not a valid header value");
                response
            }
        }
    }

    fn register(
        &self,
        transport: Transport,
        request: Request,
    ) -> Result<Arc<Session>, serde_json::Error> {
        let transport_name = transport.name();
        let (id, slot) = loop {
            let id = generate_sid();
            if let Entry::Vacant(slot) = self.inner.sessions.entry(id.clone()) {
                break (id, slot);
            }
        };
        let session = Session::new(
            id,
            transport,
            request,
            Arc::clone(&self.inner.config),
            Arc::downgrade(&self.inner),
        );
        slot.insert(Arc::clone(&session));

        if let Err(err) = session.open() {
            self.inner.remove_session(session.id());
            return Err(err);
        }
        increment_gauge!("tidepool_sessions_active", 1.0);
        counter!("tidepool_handshakes_total", 1, "transport" => transport_name);
        info!(session_id = %session.id(), transport = transport_name, "session opened");

        if self.inner.connections.send(Arc::clone(&session)).is_err() {
            debug!(session_id = %session.id(), "no connection listener attached");
        }
        Ok(session)
    }
}

fn spawn_pump(session: Arc<Session>, ws_id: u64, mut events: mpsc::UnboundedReceiver<WsEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                WsEvent::Message(data) => session.on_ws_message(ws_id, data),
                WsEvent::Closed => {
                    session.on_ws_closed(ws_id, None);
                    return;
                }
                WsEvent::Error(err) => {
                    session.on_ws_closed(ws_id, Some(err));
                    return;
                }
            }
        }
        session.on_ws_closed(ws_id, None);
    });
}

/// Hex of a nanosecond timestamp followed by eight random bytes.
fn generate_sid() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&nanos.to_be_bytes());
    rand::thread_rng().fill(&mut bytes[8..]);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;
    use std::collections::HashSet;

    #[test]
    fn sids_are_unique_hex() {
        let sids: HashSet<String> = (0..1000).map(|_| generate_sid()).collect();
        assert_eq!(sids.len(), 1000);
        assert!(sids
            .iter()
            .all(|sid| sid.len() == 32 && sid.bytes().all(|b| b.is_ascii_hexdigit())));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (engine, _connections) = Engine::new(EngineConfig::default());
        let request = Request::new(
            Method::GET,
            Uri::from_static("/socket.io/?EIO=3&transport=polling"),
        );
        let session = engine
            .register(
                Transport::Polling(Polling::new(PollingFlavor::Xhr, true)),
                request,
            )
            .unwrap();
        assert_eq!(engine.session_count(), 1);

        engine.inner.remove_session(session.id());
        engine.inner.remove_session(session.id());
        assert_eq!(engine.session_count(), 0);
        assert!(engine.session(session.id()).is_none());
    }
}
