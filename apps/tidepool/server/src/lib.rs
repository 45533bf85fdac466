//! Realtime server: an engine that keeps logical sessions alive over
//! long-polling or WebSocket, and a namespaced event layer on top of it.
//!
//! [`Engine`] owns the sessions and answers HTTP requests and upgrades.
//! [`io::Server`] consumes the sessions the engine opens and exposes
//! namespaces, sockets, events and acknowledgements. [`listener::Listener`]
//! puts both on a TCP port.

pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod io;
pub mod listener;
pub mod message;
pub mod origin;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{RequestError, TransportError, UpgradeError};
pub use http::{Method, StatusCode};
pub use message::{ConnectionInfo, Request, Response};
pub use origin::OriginPolicy;
pub use session::{CloseReason, ReadyState, Session, SessionEvent};
pub use transport::{TransportKind, WebSocketChannel, WebSocketPeer, WsCommand, WsEvent};
