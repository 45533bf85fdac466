use tidepool_core::{Data, Frame};
use tokio::sync::mpsc;
use tracing::debug;

/// Instructions from the engine to whatever owns the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsCommand {
    Send(Data),
    Close,
}

/// What the socket owner reports back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Message(Data),
    Closed,
    Error(String),
}

/// Engine side of a WebSocket bridged over channels.
#[derive(Debug)]
pub struct WebSocketChannel {
    pub commands: mpsc::UnboundedSender<WsCommand>,
    pub events: mpsc::UnboundedReceiver<WsEvent>,
}

/// Socket side of the same bridge, driven by the listener or by tests.
#[derive(Debug)]
pub struct WebSocketPeer {
    pub commands: mpsc::UnboundedReceiver<WsCommand>,
    pub events: mpsc::UnboundedSender<WsEvent>,
}

impl WebSocketChannel {
    pub fn pair() -> (WebSocketChannel, WebSocketPeer) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            WebSocketChannel {
                commands: command_tx,
                events: event_rx,
            },
            WebSocketPeer {
                commands: command_rx,
                events: event_tx,
            },
        )
    }
}

#[derive(Debug)]
pub struct WebSocketTransport {
    id: u64,
    commands: mpsc::UnboundedSender<WsCommand>,
    supports_binary: bool,
    open: bool,
}

impl WebSocketTransport {
    pub fn new(id: u64, commands: mpsc::UnboundedSender<WsCommand>, supports_binary: bool) -> Self {
        Self {
            id,
            commands,
            supports_binary,
            open: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    pub fn writable(&self) -> bool {
        self.open && !self.commands.is_closed()
    }

    /// One channel message per frame.
    pub fn send(&mut self, frames: Vec<Frame>) -> Result<(), Vec<Frame>> {
        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            let encoded = frame.encode(self.supports_binary);
            if self.commands.send(WsCommand::Send(encoded)).is_err() {
                debug!(ws_id = self.id, "socket writer gone");
                self.open = false;
                let mut unsent = vec![frame];
                unsent.extend(frames);
                return Err(unsent);
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if std::mem::replace(&mut self.open, false) {
            let _ = self.commands.send(WsCommand::Close);
        }
    }
}
