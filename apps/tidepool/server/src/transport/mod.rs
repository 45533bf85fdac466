//! The two physical channels a session can ride on.

use tidepool_core::Frame;

pub mod polling;
pub mod websocket;

pub use polling::{Polling, PollingFlavor};
pub use websocket::{WebSocketChannel, WebSocketPeer, WebSocketTransport, WsCommand, WsEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Polling,
    WebSocket,
}

impl TransportKind {
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::WebSocket => "websocket",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "polling" => Some(TransportKind::Polling),
            "websocket" => Some(TransportKind::WebSocket),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Transport {
    Polling(Polling),
    WebSocket(WebSocketTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Polling(_) => TransportKind::Polling,
            Transport::WebSocket(_) => TransportKind::WebSocket,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn writable(&self) -> bool {
        match self {
            Transport::Polling(polling) => polling.writable(),
            Transport::WebSocket(ws) => ws.writable(),
        }
    }

    pub fn supports_binary(&self) -> bool {
        match self {
            Transport::Polling(polling) => polling.supports_binary(),
            Transport::WebSocket(ws) => ws.supports_binary(),
        }
    }

    /// Hands a batch to the channel. Frames the channel could not take are
    /// given back in order.
    pub fn send(&mut self, frames: Vec<Frame>) -> Result<(), Vec<Frame>> {
        match self {
            Transport::Polling(polling) => polling.send(frames),
            Transport::WebSocket(ws) => ws.send(frames),
        }
    }

    /// Closes the channel, telling the peer where the channel allows it.
    pub fn close(&mut self) {
        match self {
            Transport::Polling(polling) => polling.close(),
            Transport::WebSocket(ws) => ws.close(),
        }
    }

    /// Drops the channel after it was replaced by an upgrade.
    pub fn discard(&mut self) {
        match self {
            Transport::Polling(polling) => polling.discard(),
            Transport::WebSocket(ws) => ws.close(),
        }
    }

    pub fn websocket_id(&self) -> Option<u64> {
        match self {
            Transport::WebSocket(ws) => Some(ws.id()),
            Transport::Polling(_) => None,
        }
    }
}
