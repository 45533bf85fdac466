use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tidepool_core::{Data, Encoder, Packet, DEFAULT_NAMESPACE};
use tracing::debug;

use super::{Client, Outgoing, Socket};

pub type ConnectionHandler = Arc<dyn Fn(&Arc<Socket>) + Send + Sync>;

/// A named channel that sockets join. Broadcasts are encoded once and the
/// same parts are written to every member.
pub struct Namespace {
    name: String,
    sockets: DashMap<String, Arc<Socket>>,
    connection_handlers: RwLock<Vec<ConnectionHandler>>,
}

impl Namespace {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            sockets: DashMap::new(),
            connection_handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn on_connection(&self, handler: impl Fn(&Arc<Socket>) + Send + Sync + 'static) {
        self.connection_handlers.write().push(Arc::new(handler));
    }

    pub fn socket(&self, id: &str) -> Option<Arc<Socket>> {
        self.sockets.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Sends an event to every connected socket. Returns how many accepted it.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> usize {
        self.broadcast(&Packet::event(self.name.as_str(), event, args), false)
    }

    pub fn emit_binary(&self, event: &str, args: Vec<Value>, attachments: Vec<Bytes>) -> usize {
        self.broadcast(
            &Packet::binary_event(self.name.as_str(), event, args, attachments),
            false,
        )
    }

    /// Like [`Namespace::emit`], skipping sockets that cannot take data
    /// right now.
    pub fn volatile_emit(&self, event: &str, args: Vec<Value>) -> usize {
        self.broadcast(&Packet::event(self.name.as_str(), event, args), true)
    }

    pub fn broadcast(&self, packet: &Packet, volatile: bool) -> usize {
        let parts: Vec<Data> = Encoder::new().encode(packet);
        let delivered = self
            .sockets()
            .iter()
            .filter(|socket| socket.write(Outgoing::Encoded(&parts), volatile))
            .count();
        debug!(nsp = %self.name, delivered, volatile, "broadcast");
        delivered
    }

    /// Joins `client` to this namespace: registers the socket on both sides,
    /// acknowledges the connect and runs the connection handlers.
    pub(crate) fn add(self: &Arc<Self>, client: &Arc<Client>) -> Arc<Socket> {
        let id = if self.name == DEFAULT_NAMESPACE {
            client.id().to_string()
        } else {
            format!("{}#{}", self.name, client.id())
        };
        let socket = Arc::new(Socket::new(id.clone(), self, client));
        client.attach_socket(&socket);
        self.sockets.insert(id.clone(), Arc::clone(&socket));

        let mut body = Map::new();
        body.insert("sid".to_string(), Value::String(id.clone()));
        socket.send(&Packet::connect(self.name.as_str(), Some(body)));
        debug!(nsp = %self.name, socket_id = %id, "socket connected");

        let handlers: Vec<ConnectionHandler> = self.connection_handlers.read().clone();
        for handler in handlers {
            handler(&socket);
        }
        socket
    }

    pub(crate) fn remove(&self, id: &str) {
        if self.sockets.remove(id).is_some() {
            debug!(nsp = %self.name, socket_id = %id, "socket left");
        }
    }
}
