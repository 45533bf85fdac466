//! Namespaced event layer on top of engine sessions.
//!
//! A [`Client`] wraps one session and multiplexes it into one [`Socket`] per
//! connected [`Namespace`]. The [`Server`] owns the namespaces and turns each
//! new session into a client.

mod client;
mod namespace;
mod server;
mod socket;

pub use client::Client;
pub use namespace::{ConnectionHandler, Namespace};
pub use server::Server;
pub use socket::{AckSender, DisconnectHandler, ErrorHandler, Event, EventHandler, Socket};

pub(crate) use client::Outgoing;
