//! Wire grammar shared by the tidepool server and its tests.
//!
//! Two framing levels live here. [`frame`] covers the transport-level packets
//! (`open`, `ping`, `message`, ...) together with the polling payload
//! encodings, and [`packet`] covers the namespaced application packets that
//! ride inside `message` frames. Nothing in this crate performs I/O.

use bytes::Bytes;

pub mod frame;
pub mod packet;

pub use frame::{
    decode_binary_payload, decode_payload, encode_payload, Frame, FrameError, FrameType,
};
pub use packet::{placeholder, DecodeError, Decoder, Encoder, Packet, PacketType, DEFAULT_NAMESPACE};

/// One unit of data as carried by a channel: either a UTF-8 string or raw
/// bytes. WebSocket messages, encoded packets and frame payloads all use it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Text(String),
    Binary(Bytes),
}

impl Data {
    pub fn is_binary(&self) -> bool {
        matches!(self, Data::Binary(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Data::Text(text) => text.len(),
            Data::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Data::Text(text) => Some(text),
            Data::Binary(_) => None,
        }
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::Text(value)
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::Text(value.to_string())
    }
}

impl From<Bytes> for Data {
    fn from(value: Bytes) -> Self {
        Data::Binary(value)
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Data::Binary(Bytes::from(value))
    }
}
