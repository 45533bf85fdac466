//! Namespaced application packets carried inside `message` frames.
//!
//! Grammar: one type digit, then for binary packets the attachment count and
//! `-`, then the namespace followed by `,` when it is not `/`, then an
//! optional decimal ack id, then an optional JSON body. Binary packets replace
//! each buffer in the body with `{"_placeholder":true,"num":n}` and ship the
//! buffers as separate binary messages.

use std::fmt::Write as _;

use bytes::Bytes;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::Data;

pub const DEFAULT_NAMESPACE: &str = "/";

const PLACEHOLDER_KEY: &str = "_placeholder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect,
    Disconnect,
    Event,
    Ack,
    Error,
    BinaryEvent,
    BinaryAck,
}

impl PacketType {
    pub const ALL: [PacketType; 7] = [
        PacketType::Connect,
        PacketType::Disconnect,
        PacketType::Event,
        PacketType::Ack,
        PacketType::Error,
        PacketType::BinaryEvent,
        PacketType::BinaryAck,
    ];

    pub fn code(self) -> u8 {
        match self {
            PacketType::Connect => 0,
            PacketType::Disconnect => 1,
            PacketType::Event => 2,
            PacketType::Ack => 3,
            PacketType::Error => 4,
            PacketType::BinaryEvent => 5,
            PacketType::BinaryAck => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub fn is_binary(self) -> bool {
        matches!(self, PacketType::BinaryEvent | PacketType::BinaryAck)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type {0:?}")]
    UnknownType(char),
    #[error("malformed attachment count")]
    AttachmentCount,
    #[error("malformed ack id")]
    InvalidId,
    #[error("invalid json body: {0}")]
    InvalidJson(String),
    #[error("placeholder without a numeric index")]
    MalformedPlaceholder,
    #[error("placeholder {0} has no matching attachment")]
    InvalidPlaceholder(u64),
    #[error("got plaintext data when reconstructing a packet")]
    UnexpectedText,
    #[error("got binary data when not reconstructing a packet")]
    UnexpectedBinary,
}

/// An application packet. Immutable once built; encoding borrows it.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketType,
    pub nsp: String,
    pub id: Option<u64>,
    /// JSON body. The constructors only build arrays, objects and strings:
    /// a bare non-negative number would be read back as part of the ack id.
    pub data: Option<Value>,
    pub attachments: Vec<Bytes>,
}

impl Packet {
    pub fn new(kind: PacketType, nsp: impl Into<String>) -> Self {
        Self {
            kind,
            nsp: nsp.into(),
            id: None,
            data: None,
            attachments: Vec::new(),
        }
    }

    pub fn connect(nsp: impl Into<String>, data: Option<Map<String, Value>>) -> Self {
        Self {
            data: data.map(Value::Object),
            ..Self::new(PacketType::Connect, nsp)
        }
    }

    pub fn disconnect(nsp: impl Into<String>) -> Self {
        Self::new(PacketType::Disconnect, nsp)
    }

    pub fn event(nsp: impl Into<String>, event: &str, args: Vec<Value>) -> Self {
        Self {
            data: Some(event_body(event, args)),
            ..Self::new(PacketType::Event, nsp)
        }
    }

    pub fn binary_event(
        nsp: impl Into<String>,
        event: &str,
        args: Vec<Value>,
        attachments: Vec<Bytes>,
    ) -> Self {
        Self {
            data: Some(event_body(event, args)),
            attachments,
            ..Self::new(PacketType::BinaryEvent, nsp)
        }
    }

    pub fn ack(nsp: impl Into<String>, id: u64, args: Vec<Value>) -> Self {
        Self {
            id: Some(id),
            data: Some(Value::Array(args)),
            ..Self::new(PacketType::Ack, nsp)
        }
    }

    pub fn binary_ack(nsp: impl Into<String>, id: u64, args: Vec<Value>, attachments: Vec<Bytes>) -> Self {
        Self {
            id: Some(id),
            data: Some(Value::Array(args)),
            attachments,
            ..Self::new(PacketType::BinaryAck, nsp)
        }
    }

    pub fn error(nsp: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            data: Some(Value::String(message.into())),
            ..Self::new(PacketType::Error, nsp)
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Event name of an `EVENT`/`BINARY_EVENT` body (its first array element).
    pub fn event_name(&self) -> Option<&str> {
        match &self.data {
            Some(Value::Array(items)) => items.first().and_then(Value::as_str),
            _ => None,
        }
    }

    /// Resolves a placeholder value against this packet's attachments.
    pub fn attachment(&self, value: &Value) -> Option<&Bytes> {
        let index = placeholder_index(value)?;
        self.attachments.get(usize::try_from(index).ok()?)
    }
}

fn event_body(event: &str, args: Vec<Value>) -> Value {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::String(event.to_string()));
    items.extend(args);
    Value::Array(items)
}

/// Placeholder standing in for attachment `num` inside a binary packet body.
pub fn placeholder(num: usize) -> Value {
    json!({ "_placeholder": true, "num": num })
}

fn placeholder_index(value: &Value) -> Option<u64> {
    let map = value.as_object()?;
    if map.get(PLACEHOLDER_KEY) != Some(&Value::Bool(true)) {
        return None;
    }
    map.get("num").and_then(Value::as_u64)
}

fn check_placeholders(value: &Value, attachments: usize) -> Result<(), DecodeError> {
    match value {
        Value::Object(map) if map.get(PLACEHOLDER_KEY) == Some(&Value::Bool(true)) => {
            let num = map
                .get("num")
                .and_then(Value::as_u64)
                .ok_or(DecodeError::MalformedPlaceholder)?;
            if usize::try_from(num).map_or(true, |index| index >= attachments) {
                return Err(DecodeError::InvalidPlaceholder(num));
            }
            Ok(())
        }
        Value::Object(map) => map
            .values()
            .try_for_each(|inner| check_placeholders(inner, attachments)),
        Value::Array(items) => items
            .iter()
            .try_for_each(|inner| check_placeholders(inner, attachments)),
        _ => Ok(()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encodes a packet into the messages to write, in order: the text head,
    /// then one binary message per attachment for binary packet types.
    pub fn encode(&self, packet: &Packet) -> Vec<Data> {
        let mut parts = Vec::with_capacity(1 + packet.attachments.len());
        parts.push(Data::Text(encode_str(packet)));
        if packet.kind.is_binary() {
            parts.extend(packet.attachments.iter().cloned().map(Data::Binary));
        }
        parts
    }
}

fn encode_str(packet: &Packet) -> String {
    let mut out = String::new();
    out.push(char::from(b'0' + packet.kind.code()));

    if packet.kind.is_binary() {
        let _ = write!(out, "{}-", packet.attachments.len());
    }

    let mut pending_separator = false;
    if !packet.nsp.is_empty() && packet.nsp != DEFAULT_NAMESPACE {
        out.push_str(&packet.nsp);
        pending_separator = true;
    }

    if let Some(id) = packet.id {
        if pending_separator {
            out.push(',');
            pending_separator = false;
        }
        let _ = write!(out, "{id}");
    }

    if let Some(data) = &packet.data {
        if pending_separator {
            out.push(',');
        }
        out.push_str(&data.to_string());
    }

    out
}

/// Decodes the text head of a packet, returning it with the number of binary
/// attachments still to be collected.
pub fn decode_str(text: &str) -> Result<(Packet, usize), DecodeError> {
    let bytes = text.as_bytes();
    let first = *bytes.first().ok_or(DecodeError::Empty)?;
    let kind = first
        .checked_sub(b'0')
        .and_then(PacketType::from_code)
        .ok_or(DecodeError::UnknownType(char::from(first)))?;
    let mut cursor = 1usize;

    let mut expected = 0usize;
    if kind.is_binary() {
        let dash = text[cursor..]
            .find('-')
            .map(|offset| offset + cursor)
            .ok_or(DecodeError::AttachmentCount)?;
        let digits = &text[cursor..dash];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DecodeError::AttachmentCount);
        }
        expected = digits.parse().map_err(|_| DecodeError::AttachmentCount)?;
        cursor = dash + 1;
    }

    let mut nsp = DEFAULT_NAMESPACE.to_string();
    if bytes.get(cursor) == Some(&b'/') {
        let end = text[cursor..]
            .find(',')
            .map_or(text.len(), |offset| offset + cursor);
        nsp = text[cursor..end].to_string();
        cursor = (end + 1).min(text.len());
    }

    let mut id = None;
    let digits_end = bytes[cursor..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(bytes.len(), |offset| offset + cursor);
    if digits_end > cursor {
        id = Some(
            text[cursor..digits_end]
                .parse()
                .map_err(|_| DecodeError::InvalidId)?,
        );
        cursor = digits_end;
    }

    let data = if cursor < text.len() {
        let value: Value = serde_json::from_str(&text[cursor..])
            .map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
        Some(value)
    } else {
        None
    };

    Ok((
        Packet {
            kind,
            nsp,
            id,
            data,
            attachments: Vec::new(),
        },
        expected,
    ))
}

struct Reconstruction {
    packet: Packet,
    expected: usize,
}

/// Stateful decoder: buffers a binary packet until all of its attachments
/// have arrived.
#[derive(Default)]
pub struct Decoder {
    reconstructing: Option<Reconstruction>,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("reconstructing", &self.reconstructing.is_some())
            .finish()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reconstructing(&self) -> bool {
        self.reconstructing.is_some()
    }

    pub fn reset(&mut self) {
        self.reconstructing = None;
    }

    /// Feeds one message. Returns the packet once it is complete, `None`
    /// while attachments are outstanding. A failed add leaves the decoder
    /// ready for the next packet.
    pub fn add(&mut self, data: Data) -> Result<Option<Packet>, DecodeError> {
        match data {
            Data::Text(text) => {
                if self.reconstructing.take().is_some() {
                    return Err(DecodeError::UnexpectedText);
                }
                let (packet, expected) = decode_str(&text)?;
                if expected == 0 {
                    finish(&packet)?;
                    return Ok(Some(packet));
                }
                self.reconstructing = Some(Reconstruction { packet, expected });
                Ok(None)
            }
            Data::Binary(bytes) => {
                let Some(mut state) = self.reconstructing.take() else {
                    return Err(DecodeError::UnexpectedBinary);
                };
                state.packet.attachments.push(bytes);
                if state.packet.attachments.len() < state.expected {
                    self.reconstructing = Some(state);
                    return Ok(None);
                }
                finish(&state.packet)?;
                Ok(Some(state.packet))
            }
        }
    }
}

fn finish(packet: &Packet) -> Result<(), DecodeError> {
    match &packet.data {
        Some(data) => check_placeholders(data, packet.attachments.len()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: &Packet) -> Packet {
        let mut decoder = Decoder::new();
        let mut decoded = None;
        for part in Encoder::new().encode(packet) {
            assert!(decoded.is_none(), "packet completed before its last part");
            decoded = decoder.add(part).expect("decode");
        }
        decoded.expect("packet completed")
    }

    #[test]
    fn every_packet_type_round_trips() {
        for kind in PacketType::ALL {
            for nsp in ["/", "/chat"] {
                let mut packet = Packet::new(kind, nsp);
                packet.data = Some(json!(["news", { "hello": "world" }]));
                if kind.is_binary() {
                    packet.data = Some(json!(["file", placeholder(0)]));
                    packet.attachments = vec![Bytes::from_static(b"\x00\x01")];
                }
                assert_eq!(round_trip(&packet), packet, "{kind:?} in {nsp}");

                let with_id = packet.clone().with_id(42);
                assert_eq!(round_trip(&with_id), with_id, "{kind:?} in {nsp} with id");
            }
        }
    }

    #[test]
    fn numeric_arguments_survive_without_an_ack_id() {
        let packets = [
            Packet::event("/", "count", vec![json!(5)]),
            Packet::event("/chat", "count", vec![json!(12), json!(-3)]),
            Packet::ack("/", 9, vec![json!(7)]),
            Packet::error("/", "42"),
            Packet::connect("/", json!({ "n": 1 }).as_object().cloned()),
        ];
        for packet in packets {
            assert_eq!(round_trip(&packet), packet);
        }
    }

    #[test]
    fn bare_number_body_is_read_as_the_ack_id() {
        let mut packet = Packet::new(PacketType::Event, "/");
        packet.data = Some(json!(25));
        assert_eq!(Encoder::new().encode(&packet), vec![Data::Text("225".into())]);

        let decoded = round_trip(&packet);
        assert_eq!(decoded.id, Some(25));
        assert_eq!(decoded.data, None);
    }

    #[test]
    fn encodes_reference_strings() {
        let encoder = Encoder::new();
        let connect = Packet::connect("/", json!({ "sid": "S1" }).as_object().cloned());
        assert_eq!(encoder.encode(&connect), vec![Data::Text(r#"0{"sid":"S1"}"#.into())]);

        let bare = Packet::connect("/ws", None);
        assert_eq!(encoder.encode(&bare), vec![Data::Text("0/ws".into())]);

        let event = Packet::event("/chat", "msg", vec![json!("hi")]).with_id(7);
        assert_eq!(
            encoder.encode(&event),
            vec![Data::Text(r#"2/chat,7["msg","hi"]"#.into())]
        );

        let binary = Packet::binary_event("/", "up", vec![placeholder(0)], vec![Bytes::from_static(b"x")]);
        assert_eq!(
            encoder.encode(&binary),
            vec![
                Data::Text(r#"51-["up",{"_placeholder":true,"num":0}]"#.into()),
                Data::Binary(Bytes::from_static(b"x")),
            ]
        );
    }

    #[test]
    fn decodes_namespace_with_trailing_separator() {
        let (packet, expected) = decode_str("0/ws,").unwrap();
        assert_eq!(expected, 0);
        assert_eq!(packet, Packet::connect("/ws", None));

        let (packet, _) = decode_str("0").unwrap();
        assert_eq!(packet, Packet::connect("/", None));
    }

    #[test]
    fn reports_grammar_failures() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.add(Data::Text(String::new())), Err(DecodeError::Empty));
        assert_eq!(decoder.add("9[]".into()), Err(DecodeError::UnknownType('9')));
        assert_eq!(decoder.add("5x-[]".into()), Err(DecodeError::AttachmentCount));
        assert!(matches!(decoder.add("2[oops".into()), Err(DecodeError::InvalidJson(_))));
        assert_eq!(
            decoder.add(Data::Binary(Bytes::from_static(b"x"))),
            Err(DecodeError::UnexpectedBinary)
        );

        assert_eq!(decoder.add("2[\"ok\"]".into()).unwrap(), Some(Packet::event("/", "ok", vec![])));
    }

    #[test]
    fn reconstruction_waits_for_every_attachment() {
        let mut decoder = Decoder::new();
        let head = r#"52-["pair",{"_placeholder":true,"num":0},{"_placeholder":true,"num":1}]"#;
        assert_eq!(decoder.add(head.into()).unwrap(), None);
        assert!(decoder.is_reconstructing());
        assert_eq!(decoder.add(Data::Binary(Bytes::from_static(b"a"))).unwrap(), None);
        let packet = decoder
            .add(Data::Binary(Bytes::from_static(b"b")))
            .unwrap()
            .expect("complete");

        let Some(Value::Array(items)) = &packet.data else {
            panic!("expected array body");
        };
        assert_eq!(packet.attachment(&items[1]), Some(&Bytes::from_static(b"a")));
        assert_eq!(packet.attachment(&items[2]), Some(&Bytes::from_static(b"b")));
        assert!(!decoder.is_reconstructing());
    }

    #[test]
    fn text_while_reconstructing_is_an_error() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.add(r#"51-["a",{"_placeholder":true,"num":0}]"#.into()).unwrap(), None);
        assert_eq!(decoder.add("2[\"b\"]".into()), Err(DecodeError::UnexpectedText));
        assert!(!decoder.is_reconstructing());
    }

    #[test]
    fn placeholder_index_must_be_in_range() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.add(r#"51-["a",{"_placeholder":true,"num":3}]"#.into()).unwrap(), None);
        assert_eq!(
            decoder.add(Data::Binary(Bytes::from_static(b"z"))),
            Err(DecodeError::InvalidPlaceholder(3))
        );
    }
}
