use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tidepool_core::{Data, Decoder, Encoder, Packet, PacketType, DEFAULT_NAMESPACE};
use tracing::{debug, warn};

use super::{Server, Socket};
use crate::session::{ReadyState, Session, SessionEvent};

/// Something to write to the session: a packet to encode, or parts some
/// broadcaster already encoded.
pub(crate) enum Outgoing<'a> {
    Packet(&'a Packet),
    Encoded(&'a [Data]),
}

#[derive(Default)]
struct ClientState {
    sockets: HashMap<String, Arc<Socket>>,
    /// Namespace connects that arrived before the default namespace.
    connect_buffer: Vec<String>,
    closed: bool,
}

/// Multiplexes one session into per-namespace sockets.
pub struct Client {
    id: String,
    session: Arc<Session>,
    server: Server,
    encoder: Encoder,
    state: Mutex<ClientState>,
}

impl Client {
    /// Takes the session's event stream and drives it on a task of its own.
    /// The client lives until the session reports its close.
    pub(crate) fn spawn(server: Server, session: Arc<Session>) -> Option<Arc<Self>> {
        let mut events = session.take_events()?;
        let client = Arc::new(Self {
            id: session.id().to_string(),
            session,
            server,
            encoder: Encoder::new(),
            state: Mutex::new(ClientState::default()),
        });

        let driver = Arc::clone(&client);
        tokio::spawn(async move {
            let mut decoder = Decoder::new();
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Data(data) => driver.on_data(&mut decoder, data),
                    SessionEvent::Error(err) => driver.on_error(&err.to_string()),
                    SessionEvent::Close(reason) => {
                        driver.on_close(reason.as_str());
                        break;
                    }
                }
            }
            debug!(client_id = %driver.id, "client finished");
        });
        Some(client)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn socket(&self, nsp: &str) -> Option<Arc<Socket>> {
        self.state.lock().sockets.get(nsp).cloned()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().sockets.keys().cloned().collect()
    }

    /// Disconnects every socket, then closes the session.
    pub fn disconnect(self: &Arc<Self>) {
        let sockets: Vec<Arc<Socket>> = self.state.lock().sockets.values().cloned().collect();
        for socket in sockets {
            socket.disconnect(false);
        }
        self.close();
    }

    pub fn close(&self) {
        if self.session.ready_state() == ReadyState::Open {
            debug!(client_id = %self.id, "forcing session close");
            self.session.close();
        }
        self.on_close("forced server close");
    }

    fn on_data(self: &Arc<Self>, decoder: &mut Decoder, data: Data) {
        match decoder.add(data) {
            Ok(Some(packet)) => self.on_decoded(packet),
            Ok(None) => {}
            Err(err) => {
                warn!(client_id = %self.id, error = %err, "dropping undecodable packet");
                let root = self.socket(DEFAULT_NAMESPACE);
                if let Some(root) = root {
                    root.handle_error("parser error");
                }
            }
        }
    }

    fn on_decoded(self: &Arc<Self>, packet: Packet) {
        if packet.kind == PacketType::Connect {
            self.connect(&packet.nsp);
            return;
        }
        match self.socket(&packet.nsp) {
            Some(socket) => socket.handle_packet(packet),
            None => debug!(client_id = %self.id, nsp = %packet.nsp, "no socket for namespace"),
        }
    }

    fn connect(self: &Arc<Self>, name: &str) {
        let Some(namespace) = self.server.lookup(name) else {
            debug!(client_id = %self.id, nsp = name, "connect to unknown namespace");
            self.packet(Outgoing::Packet(&Packet::error(name, "Invalid namespace")), false);
            return;
        };
        {
            let mut state = self.state.lock();
            if state.closed || state.sockets.contains_key(name) {
                return;
            }
            if name != DEFAULT_NAMESPACE && !state.sockets.contains_key(DEFAULT_NAMESPACE) {
                state.connect_buffer.push(name.to_string());
                return;
            }
        }

        namespace.add(self);

        if name == DEFAULT_NAMESPACE {
            let buffered = std::mem::take(&mut self.state.lock().connect_buffer);
            for pending in buffered {
                self.connect(&pending);
            }
        }
    }

    pub(crate) fn attach_socket(&self, socket: &Arc<Socket>) {
        self.state
            .lock()
            .sockets
            .insert(socket.nsp().to_string(), Arc::clone(socket));
    }

    /// Forgets `socket` if it is still the one registered for its namespace.
    pub(crate) fn detach_socket(&self, socket: &Socket) {
        let mut state = self.state.lock();
        let registered = state
            .sockets
            .get(socket.nsp())
            .is_some_and(|current| current.id() == socket.id());
        if registered {
            state.sockets.remove(socket.nsp());
        }
    }

    /// Writes to the session. Volatile writes are dropped unless the
    /// transport can take them right now.
    pub(crate) fn packet(&self, outgoing: Outgoing<'_>, volatile: bool) -> bool {
        if self.session.ready_state() != ReadyState::Open {
            return false;
        }
        if volatile && !self.session.transport_writable() {
            debug!(client_id = %self.id, "dropping volatile packet");
            return false;
        }
        match outgoing {
            Outgoing::Packet(packet) => self.session.write_all(self.encoder.encode(packet)),
            Outgoing::Encoded(parts) => self.session.write_all(parts.to_vec()),
        }
        true
    }

    fn on_error(&self, message: &str) {
        let sockets: Vec<Arc<Socket>> = self.state.lock().sockets.values().cloned().collect();
        for socket in &sockets {
            socket.handle_error(message);
        }
        self.on_close("client error");
    }

    fn on_close(&self, reason: &str) {
        let sockets: Vec<Arc<Socket>> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connect_buffer.clear();
            state.sockets.drain().map(|(_, socket)| socket).collect()
        };
        debug!(client_id = %self.id, reason, sockets = sockets.len(), "client closed");
        for socket in sockets {
            socket.handle_close(reason);
        }
    }
}
