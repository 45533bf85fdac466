use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tidepool_core::{Packet, PacketType};
use tracing::debug;

use super::{Client, Namespace, Outgoing};

pub type EventHandler = Arc<dyn Fn(&Arc<Socket>, Event) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(&Arc<Socket>, &str) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&Arc<Socket>, &str) + Send + Sync>;
type AckCallback = Box<dyn FnOnce(Vec<Value>, Vec<Bytes>) + Send>;

/// An event received from the peer.
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
    pub attachments: Vec<Bytes>,
    /// Present when the peer asked for an acknowledgement.
    pub ack: Option<AckSender>,
}

/// Answers one acknowledgement request. Consumed on use, so an ack is sent
/// at most once.
pub struct AckSender {
    socket: Weak<Socket>,
    id: u64,
}

impl AckSender {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(self, args: Vec<Value>) -> bool {
        match self.socket.upgrade() {
            Some(socket) => socket.send(&Packet::ack(socket.nsp(), self.id, args)),
            None => false,
        }
    }

    pub fn send_binary(self, args: Vec<Value>, attachments: Vec<Bytes>) -> bool {
        match self.socket.upgrade() {
            Some(socket) => {
                socket.send(&Packet::binary_ack(socket.nsp(), self.id, args, attachments))
            }
            None => false,
        }
    }
}

/// One client's membership in one namespace.
pub struct Socket {
    id: String,
    nsp_name: String,
    namespace: Weak<Namespace>,
    client: Weak<Client>,
    connected: AtomicBool,
    handlers: RwLock<HashMap<String, EventHandler>>,
    disconnect_handlers: RwLock<Vec<DisconnectHandler>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    acks: Mutex<HashMap<u64, AckCallback>>,
    next_ack: AtomicU64,
}

impl Socket {
    pub(crate) fn new(id: String, namespace: &Arc<Namespace>, client: &Arc<Client>) -> Self {
        Self {
            id,
            nsp_name: namespace.name().to_string(),
            namespace: Arc::downgrade(namespace),
            client: Arc::downgrade(client),
            connected: AtomicBool::new(true),
            handlers: RwLock::new(HashMap::new()),
            disconnect_handlers: RwLock::new(Vec::new()),
            error_handlers: RwLock::new(Vec::new()),
            acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nsp(&self) -> &str {
        &self.nsp_name
    }

    pub fn namespace(&self) -> Option<Arc<Namespace>> {
        self.namespace.upgrade()
    }

    pub fn client(&self) -> Option<Arc<Client>> {
        self.client.upgrade()
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Registers the handler for `event`, replacing any previous one.
    pub fn on(
        &self,
        event: impl Into<String>,
        handler: impl Fn(&Arc<Socket>, Event) + Send + Sync + 'static,
    ) {
        self.handlers.write().insert(event.into(), Arc::new(handler));
    }

    pub fn on_disconnect(&self, handler: impl Fn(&Arc<Socket>, &str) + Send + Sync + 'static) {
        self.disconnect_handlers.write().push(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(&Arc<Socket>, &str) + Send + Sync + 'static) {
        self.error_handlers.write().push(Arc::new(handler));
    }

    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        self.send(&Packet::event(self.nsp_name.as_str(), event, args))
    }

    /// Emits with binary attachments; `args` reference them through
    /// placeholders.
    pub fn emit_binary(&self, event: &str, args: Vec<Value>, attachments: Vec<Bytes>) -> bool {
        self.send(&Packet::binary_event(
            self.nsp_name.as_str(),
            event,
            args,
            attachments,
        ))
    }

    /// Dropped instead of buffered when the transport cannot take it now.
    pub fn volatile_emit(&self, event: &str, args: Vec<Value>) -> bool {
        self.write(
            Outgoing::Packet(&Packet::event(self.nsp_name.as_str(), event, args)),
            true,
        )
    }

    /// Emits and runs `callback` with the peer's acknowledgement arguments.
    pub fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Value>,
        callback: impl FnOnce(Vec<Value>, Vec<Bytes>) + Send + 'static,
    ) -> bool {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        self.acks.lock().insert(id, Box::new(callback));
        let sent = self.send(&Packet::event(self.nsp_name.as_str(), event, args).with_id(id));
        if !sent {
            self.acks.lock().remove(&id);
        }
        sent
    }

    /// Leaves the namespace. With `close`, the whole underlying session is
    /// closed as well.
    pub fn disconnect(self: &Arc<Self>, close: bool) {
        if !self.connected() {
            return;
        }
        if close {
            if let Some(client) = self.client.upgrade() {
                client.disconnect();
            }
        } else {
            self.send(&Packet::disconnect(self.nsp_name.as_str()));
            self.handle_close("server namespace disconnect");
        }
    }

    pub(crate) fn send(&self, packet: &Packet) -> bool {
        self.write(Outgoing::Packet(packet), false)
    }

    pub(crate) fn write(&self, outgoing: Outgoing<'_>, volatile: bool) -> bool {
        if !self.connected() {
            return false;
        }
        match self.client.upgrade() {
            Some(client) => client.packet(outgoing, volatile),
            None => false,
        }
    }

    pub(crate) fn handle_packet(self: &Arc<Self>, packet: Packet) {
        match packet.kind {
            PacketType::Event | PacketType::BinaryEvent => self.dispatch_event(packet),
            PacketType::Ack | PacketType::BinaryAck => self.dispatch_ack(packet),
            PacketType::Disconnect => self.handle_close("client namespace disconnect"),
            PacketType::Error => {
                let message = packet
                    .data
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or("error")
                    .to_string();
                self.handle_error(&message);
            }
            PacketType::Connect => {}
        }
    }

    fn dispatch_event(self: &Arc<Self>, packet: Packet) {
        let Packet {
            id,
            data,
            attachments,
            ..
        } = packet;
        let Some(Value::Array(mut items)) = data else {
            debug!(socket_id = %self.id, "event without an argument array");
            return;
        };
        if items.is_empty() {
            return;
        }
        let Value::String(name) = items.remove(0) else {
            debug!(socket_id = %self.id, "event name is not a string");
            return;
        };

        let handler = self.handlers.read().get(&name).cloned();
        let Some(handler) = handler else {
            debug!(socket_id = %self.id, event = %name, "no handler for event");
            return;
        };
        let ack = id.map(|id| AckSender {
            socket: Arc::downgrade(self),
            id,
        });
        handler(
            self,
            Event {
                name,
                args: items,
                attachments,
                ack,
            },
        );
    }

    fn dispatch_ack(&self, packet: Packet) {
        let Some(id) = packet.id else {
            return;
        };
        let callback = self.acks.lock().remove(&id);
        let Some(callback) = callback else {
            debug!(socket_id = %self.id, ack_id = id, "unknown ack id");
            return;
        };
        let args = match packet.data {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        };
        callback(args, packet.attachments);
    }

    pub(crate) fn handle_error(self: &Arc<Self>, message: &str) {
        let handlers: Vec<ErrorHandler> = self.error_handlers.read().clone();
        if handlers.is_empty() {
            debug!(socket_id = %self.id, error = message, "unhandled socket error");
        }
        for handler in handlers {
            handler(self, message);
        }
    }

    /// Leaves namespace and client. Runs the disconnect handlers once.
    pub(crate) fn handle_close(self: &Arc<Self>, reason: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(namespace) = self.namespace.upgrade() {
            namespace.remove(&self.id);
        }
        if let Some(client) = self.client.upgrade() {
            client.detach_socket(self);
        }
        self.acks.lock().clear();
        debug!(socket_id = %self.id, reason, "socket disconnected");

        let handlers: Vec<DisconnectHandler> = self.disconnect_handlers.read().clone();
        for handler in handlers {
            handler(self, reason);
        }
    }
}
