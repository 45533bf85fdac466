//! One logical client connection, independent of the channel it currently
//! rides on.
//!
//! All mutable state sits behind a single `parking_lot` mutex that is never
//! held across an await. Transport callbacks, timers and the application all
//! funnel through it, so each session observes its events one at a time.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use http::Method;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tidepool_core::{Data, Frame, FrameType};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::EngineInner;
use crate::error::{RequestError, TransportError, UpgradeError};
use crate::message::{Request, Response};
use crate::transport::{Transport, WebSocketTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TransportClose,
    TransportError,
    PingTimeout,
    ForcedClose,
    ParseError,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::TransportClose => "transport close",
            CloseReason::TransportError => "transport error",
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::ForcedClose => "forced close",
            CloseReason::ParseError => "parse error",
        }
    }
}

/// Delivered to whoever took the session's event receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Data(Data),
    Error(TransportError),
    Close(CloseReason),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Handshake<'a> {
    sid: &'a str,
    upgrades: Vec<&'static str>,
    ping_interval: u128,
    ping_timeout: u128,
}

struct PendingUpgrade {
    transport: WebSocketTransport,
    probed: bool,
    timer: JoinHandle<()>,
}

struct SessionState {
    ready_state: ReadyState,
    transport: Transport,
    upgrade: Option<PendingUpgrade>,
    upgraded: bool,
    write_buffer: VecDeque<Frame>,
    heartbeat: Option<JoinHandle<()>>,
}

enum Channel {
    Active,
    Upgrade,
    Stale,
}

pub struct Session {
    id: String,
    request: Request,
    config: Arc<EngineConfig>,
    registry: Weak<EngineInner>,
    events: mpsc::UnboundedSender<SessionEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("ready_state", &self.ready_state())
            .field("transport", &self.transport_name())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        id: String,
        transport: Transport,
        request: Request,
        config: Arc<EngineConfig>,
        registry: Weak<EngineInner>,
    ) -> Arc<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            request,
            config,
            registry,
            events,
            receiver: Mutex::new(Some(receiver)),
            state: Mutex::new(SessionState {
                ready_state: ReadyState::Opening,
                transport,
                upgrade: None,
                upgraded: false,
                write_buffer: VecDeque::new(),
                heartbeat: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The request that opened the session.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state.lock().ready_state
    }

    pub fn transport_name(&self) -> &'static str {
        self.state.lock().transport.name()
    }

    pub fn transport_writable(&self) -> bool {
        self.state.lock().transport.writable()
    }

    pub fn is_upgraded(&self) -> bool {
        self.state.lock().upgraded
    }

    pub fn is_upgrading(&self) -> bool {
        self.state.lock().upgrade.is_some()
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().write_buffer.len()
    }

    /// Hands out the event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.receiver.lock().take()
    }

    /// Queues one `message` frame.
    pub fn write(&self, data: Data) {
        self.write_all(vec![data]);
    }

    /// Queues several `message` frames back to back in one flush.
    pub fn write_all(&self, parts: Vec<Data>) {
        let mut state = self.state.lock();
        if state.ready_state != ReadyState::Open {
            debug!(session_id = %self.id, "dropping write on a session that is not open");
            return;
        }
        state
            .write_buffer
            .extend(parts.into_iter().map(Frame::message));
        self.flush(&mut state);
    }

    /// Server-initiated close. Whatever the transport can take right now is
    /// flushed first.
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.ready_state != ReadyState::Open {
                return;
            }
            state.ready_state = ReadyState::Closing;
            self.flush(&mut state);
        }
        self.on_close(CloseReason::ForcedClose);
    }

    pub(crate) fn open(self: &Arc<Self>) -> Result<(), serde_json::Error> {
        let mut state = self.state.lock();
        let handshake = Handshake {
            sid: &self.id,
            upgrades: self.config.upgrades_for(state.transport.kind()),
            ping_interval: self.config.ping_interval.as_millis(),
            ping_timeout: self.config.ping_timeout.as_millis(),
        };
        let payload = serde_json::to_string(&handshake)?;
        state.ready_state = ReadyState::Open;
        state
            .write_buffer
            .push_back(Frame::text(FrameType::Open, payload));
        self.reset_heartbeat(&mut state);
        self.flush(&mut state);
        Ok(())
    }

    /// Dispatches a polling request addressed to this session.
    pub(crate) async fn handle_request(self: &Arc<Self>, request: &Request) -> Response {
        match *request.method() {
            Method::GET => self.handle_poll(request).await,
            Method::POST => self.handle_data(request),
            Method::OPTIONS => self.with_polling(request, |polling| polling.options_response()),
            _ => Response::request_error(RequestError::BadRequest, request.origin()),
        }
    }

    fn with_polling(
        &self,
        request: &Request,
        f: impl FnOnce(&mut crate::transport::Polling) -> Response,
    ) -> Response {
        let mut state = self.state.lock();
        match &mut state.transport {
            Transport::Polling(polling) => {
                polling.set_origin(request.origin());
                f(polling)
            }
            Transport::WebSocket(_) => {
                Response::request_error(RequestError::BadRequest, request.origin())
            }
        }
    }

    async fn handle_poll(self: &Arc<Self>, request: &Request) -> Response {
        let (token, mut receiver, fallback) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let probed = state.upgrade.as_ref().is_some_and(|upgrade| upgrade.probed);
            let Transport::Polling(polling) = &mut state.transport else {
                return Response::request_error(RequestError::BadRequest, request.origin());
            };
            polling.set_origin(request.origin());
            let fallback = polling.respond(&[Frame::new(FrameType::Noop)]);
            if probed || state.ready_state == ReadyState::Closed {
                return fallback;
            }
            let Some((token, receiver)) = polling.hold() else {
                warn!(session_id = %self.id, "rejecting overlapping poll");
                return Response::request_error(RequestError::BadRequest, request.origin());
            };
            self.flush(state);
            (token, receiver, fallback)
        };

        tokio::select! {
            response = &mut receiver => response.unwrap_or(fallback),
            _ = tokio::time::sleep(self.config.poll_timeout) => {
                let released = {
                    let mut state = self.state.lock();
                    match &mut state.transport {
                        Transport::Polling(polling) => polling.release(token),
                        Transport::WebSocket(_) => false,
                    }
                };
                if released {
                    fallback
                } else {
                    receiver.await.unwrap_or(fallback)
                }
            }
        }
    }

    fn handle_data(self: &Arc<Self>, request: &Request) -> Response {
        let decoded = {
            let mut state = self.state.lock();
            match &mut state.transport {
                Transport::Polling(polling) => {
                    polling.set_origin(request.origin());
                    polling
                        .decode(request)
                        .map(|frames| (frames, polling.ack_response()))
                }
                Transport::WebSocket(_) => {
                    return Response::request_error(RequestError::BadRequest, request.origin());
                }
            }
        };

        match decoded {
            Ok((frames, ack)) => {
                for frame in frames {
                    self.on_frame(frame);
                }
                ack
            }
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "undecodable polling payload");
                counter!("tidepool_request_errors_total", 1, "reason" => "parse_error");
                self.on_close(CloseReason::ParseError);
                Response::request_error(RequestError::BadRequest, request.origin())
            }
        }
    }

    /// Handles one frame from the active transport.
    pub(crate) fn on_frame(self: &Arc<Self>, frame: Frame) {
        let mut state = self.state.lock();
        if state.ready_state != ReadyState::Open {
            debug!(session_id = %self.id, kind = frame.kind.name(), "ignoring frame on inactive session");
            return;
        }
        self.reset_heartbeat(&mut state);
        match frame.kind {
            FrameType::Ping => {
                state.write_buffer.push_back(Frame {
                    kind: FrameType::Pong,
                    data: frame.data,
                });
                self.flush(&mut state);
            }
            FrameType::Message => {
                let data = frame.data.unwrap_or_else(|| Data::Text(String::new()));
                let _ = self.events.send(SessionEvent::Data(data));
            }
            FrameType::Close => {
                drop(state);
                self.on_close(CloseReason::TransportClose);
            }
            other => {
                debug!(session_id = %self.id, kind = other.name(), "ignoring frame");
            }
        }
    }

    fn flush(&self, state: &mut SessionState) {
        if state.ready_state == ReadyState::Closed
            || state.write_buffer.is_empty()
            || !state.transport.writable()
        {
            return;
        }
        let frames: Vec<Frame> = state.write_buffer.drain(..).collect();
        debug!(
            session_id = %self.id,
            transport = state.transport.name(),
            count = frames.len(),
            "flushing"
        );
        if let Err(unsent) = state.transport.send(frames) {
            for frame in unsent.into_iter().rev() {
                state.write_buffer.push_front(frame);
            }
        }
    }

    fn reset_heartbeat(self: &Arc<Self>, state: &mut SessionState) {
        if let Some(timer) = state.heartbeat.take() {
            timer.abort();
        }
        let session = Arc::downgrade(self);
        let deadline = self.config.heartbeat_deadline();
        state.heartbeat = Some(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(session) = session.upgrade() {
                debug!(session_id = %session.id, "heartbeat deadline passed");
                session.on_close(CloseReason::PingTimeout);
            }
        }));
    }

    /// Tears the session down. Runs at most once; later calls are no-ops.
    pub(crate) fn on_close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if state.ready_state == ReadyState::Closed {
                return;
            }
            state.ready_state = ReadyState::Closed;
            if let Some(timer) = state.heartbeat.take() {
                timer.abort();
            }
            if let Some(mut upgrade) = state.upgrade.take() {
                upgrade.timer.abort();
                upgrade.transport.close();
            }
            state.transport.close();
            state.write_buffer.clear();
            let _ = self.events.send(SessionEvent::Close(reason));
        }

        info!(session_id = %self.id, reason = reason.as_str(), "session closed");
        counter!("tidepool_sessions_closed_total", 1, "reason" => reason.as_str());
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_session(&self.id);
        }
    }

    pub(crate) fn on_error(&self, err: TransportError) {
        {
            let state = self.state.lock();
            if state.ready_state == ReadyState::Closed {
                return;
            }
            warn!(session_id = %self.id, error = %err, "transport error");
            let _ = self.events.send(SessionEvent::Error(err));
        }
        self.on_close(CloseReason::TransportError);
    }

    /// Attaches a WebSocket as upgrade candidate. The candidate must finish
    /// the probe within the upgrade timeout.
    pub(crate) fn maybe_upgrade(
        self: &Arc<Self>,
        mut transport: WebSocketTransport,
    ) -> Result<(), UpgradeError> {
        let mut state = self.state.lock();
        let refusal = if state.ready_state != ReadyState::Open {
            Some(UpgradeError::ClosedClient)
        } else if state.upgraded {
            Some(UpgradeError::AlreadyUpgraded)
        } else if state.upgrade.is_some() {
            Some(UpgradeError::AlreadyUpgrading)
        } else {
            None
        };
        if let Some(err) = refusal {
            transport.close();
            return Err(err);
        }

        let ws_id = transport.id();
        let session = Arc::downgrade(self);
        let timeout = self.config.upgrade_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                session.abandon_upgrade(ws_id, "upgrade timeout");
            }
        });
        state.upgrade = Some(PendingUpgrade {
            transport,
            probed: false,
            timer,
        });
        debug!(session_id = %self.id, ws_id, "upgrade started");
        Ok(())
    }

    fn channel_of(&self, state: &SessionState, ws_id: u64) -> Channel {
        if state
            .upgrade
            .as_ref()
            .is_some_and(|upgrade| upgrade.transport.id() == ws_id)
        {
            Channel::Upgrade
        } else if state.transport.websocket_id() == Some(ws_id) {
            Channel::Active
        } else {
            Channel::Stale
        }
    }

    /// Routes a WebSocket message either to the upgrade handshake or to the
    /// active transport.
    pub(crate) fn on_ws_message(self: &Arc<Self>, ws_id: u64, data: Data) {
        let channel = self.channel_of(&self.state.lock(), ws_id);
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(err) => {
                match channel {
                    Channel::Upgrade => self.abandon_upgrade(ws_id, "undecodable probe frame"),
                    Channel::Active => self.on_error(TransportError::Payload(err)),
                    Channel::Stale => {}
                }
                return;
            }
        };
        match channel {
            Channel::Active => self.on_frame(frame),
            Channel::Upgrade => self.on_upgrade_frame(ws_id, frame),
            Channel::Stale => debug!(session_id = %self.id, ws_id, "frame from stale websocket"),
        }
    }

    pub(crate) fn on_ws_closed(self: &Arc<Self>, ws_id: u64, error: Option<String>) {
        let channel = self.channel_of(&self.state.lock(), ws_id);
        match (channel, error) {
            (Channel::Upgrade, _) => self.abandon_upgrade(ws_id, "probe transport closed"),
            (Channel::Active, Some(err)) => self.on_error(TransportError::Socket(err)),
            (Channel::Active, None) => self.on_close(CloseReason::TransportClose),
            (Channel::Stale, _) => {}
        }
    }

    fn on_upgrade_frame(self: &Arc<Self>, ws_id: u64, frame: Frame) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(upgrade) = state
            .upgrade
            .as_mut()
            .filter(|upgrade| upgrade.transport.id() == ws_id)
        else {
            return;
        };

        match frame.kind {
            FrameType::Ping if !upgrade.probed && frame.text_data() == Some("probe") => {
                upgrade.probed = true;
                let _ = upgrade
                    .transport
                    .send(vec![Frame::text(FrameType::Pong, "probe")]);
                // Let a parked poll return so the client pauses polling.
                state.transport.discard();
                debug!(session_id = %self.id, ws_id, "upgrade probe answered");
            }
            FrameType::Upgrade if upgrade.probed => {
                let Some(upgrade) = state.upgrade.take() else {
                    return;
                };
                upgrade.timer.abort();
                let mut previous =
                    std::mem::replace(&mut state.transport, Transport::WebSocket(upgrade.transport));
                previous.discard();
                state.upgraded = true;
                self.reset_heartbeat(state);
                self.flush(state);
                info!(session_id = %self.id, ws_id, "upgraded to websocket");
                counter!("tidepool_upgrades_total", 1, "outcome" => "completed");
            }
            _ => {
                drop(guard);
                self.abandon_upgrade(ws_id, "unexpected frame during upgrade");
            }
        }
    }

    fn abandon_upgrade(&self, ws_id: u64, reason: &'static str) {
        let mut state = self.state.lock();
        if !matches!(self.channel_of(&state, ws_id), Channel::Upgrade) {
            return;
        }
        if let Some(mut upgrade) = state.upgrade.take() {
            upgrade.timer.abort();
            upgrade.transport.close();
        }
        info!(session_id = %self.id, ws_id, reason, "upgrade abandoned");
        counter!("tidepool_upgrades_total", 1, "outcome" => "abandoned");
    }
}
