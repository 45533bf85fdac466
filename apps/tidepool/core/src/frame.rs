//! Transport-level frames.
//!
//! A frame is a single type character (or type byte, for binary frames)
//! followed by an optional body. Framed channels such as WebSocket carry one
//! frame per message; polling responses concatenate several frames into a
//! payload using either the length-prefixed text framing or the binary
//! framing.

use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::Data;

const BINARY_LENGTH_TERMINATOR: u8 = 0xFF;
const BASE64_MARKER: char = 'b';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
}

impl FrameType {
    pub const ALL: [FrameType; 7] = [
        FrameType::Open,
        FrameType::Close,
        FrameType::Ping,
        FrameType::Pong,
        FrameType::Message,
        FrameType::Upgrade,
        FrameType::Noop,
    ];

    pub fn code(self) -> u8 {
        match self {
            FrameType::Open => 0,
            FrameType::Close => 1,
            FrameType::Ping => 2,
            FrameType::Pong => 3,
            FrameType::Message => 4,
            FrameType::Upgrade => 5,
            FrameType::Noop => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub fn as_char(self) -> char {
        char::from(b'0' + self.code())
    }

    pub fn from_char(ch: char) -> Option<Self> {
        ch.to_digit(10)
            .and_then(|digit| u8::try_from(digit).ok())
            .and_then(Self::from_code)
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameType::Open => "open",
            FrameType::Close => "close",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Message => "message",
            FrameType::Upgrade => "upgrade",
            FrameType::Noop => "noop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type")]
    UnknownType,
    #[error("invalid base64 body: {0}")]
    Base64(String),
    #[error("malformed payload length")]
    Length,
    #[error("payload truncated")]
    Truncated,
    #[error("payload is not valid utf-8")]
    Utf8,
}

/// A transport-level packet. An empty text body is normalised to `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub data: Option<Data>,
}

impl Frame {
    pub fn new(kind: FrameType) -> Self {
        Self { kind, data: None }
    }

    pub fn text(kind: FrameType, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind,
            data: (!text.is_empty()).then_some(Data::Text(text)),
        }
    }

    pub fn binary(kind: FrameType, bytes: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: Some(Data::Binary(bytes.into())),
        }
    }

    pub fn message(data: Data) -> Self {
        match data {
            Data::Text(text) => Self::text(FrameType::Message, text),
            Data::Binary(bytes) => Self::binary(FrameType::Message, bytes),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.data, Some(Data::Binary(_)))
    }

    pub fn text_data(&self) -> Option<&str> {
        self.data.as_ref().and_then(Data::as_text)
    }

    /// Encodes the frame as a single channel message. Binary bodies fall back
    /// to the base64 text form when the peer cannot take binary.
    pub fn encode(&self, supports_binary: bool) -> Data {
        match &self.data {
            Some(Data::Binary(bytes)) if supports_binary => {
                let mut buf = BytesMut::with_capacity(bytes.len() + 1);
                buf.put_u8(self.kind.code());
                buf.extend_from_slice(bytes);
                Data::Binary(buf.freeze())
            }
            _ => Data::Text(self.encode_text()),
        }
    }

    fn encode_text(&self) -> String {
        let mut out = String::new();
        match &self.data {
            Some(Data::Binary(bytes)) => {
                out.push(BASE64_MARKER);
                out.push(self.kind.as_char());
                out.push_str(&STANDARD.encode(bytes));
            }
            Some(Data::Text(text)) => {
                out.push(self.kind.as_char());
                out.push_str(text);
            }
            None => out.push(self.kind.as_char()),
        }
        out
    }

    pub fn decode(data: &Data) -> Result<Self, FrameError> {
        match data {
            Data::Text(text) => Self::decode_str(text),
            Data::Binary(bytes) => Self::decode_binary(bytes.clone()),
        }
    }

    pub fn decode_str(text: &str) -> Result<Self, FrameError> {
        let mut chars = text.chars();
        let first = chars.next().ok_or(FrameError::Empty)?;
        if first == BASE64_MARKER {
            let kind = chars
                .next()
                .and_then(FrameType::from_char)
                .ok_or(FrameError::UnknownType)?;
            let body = STANDARD
                .decode(chars.as_str())
                .map_err(|err| FrameError::Base64(err.to_string()))?;
            return Ok(Self::binary(kind, body));
        }
        let kind = FrameType::from_char(first).ok_or(FrameError::UnknownType)?;
        Ok(Self::text(kind, chars.as_str()))
    }

    pub fn decode_binary(bytes: Bytes) -> Result<Self, FrameError> {
        let code = *bytes.first().ok_or(FrameError::Empty)?;
        let kind = FrameType::from_code(code).ok_or(FrameError::UnknownType)?;
        Ok(Self::binary(kind, bytes.slice(1..)))
    }
}

/// Encodes a batch of frames for a polling response.
///
/// Produces the binary framing only when the client accepts binary and at
/// least one frame carries bytes; otherwise the `<len>:<frame>` text framing,
/// with lengths counted in UTF-16 code units.
pub fn encode_payload(frames: &[Frame], supports_binary: bool) -> Data {
    if supports_binary && frames.iter().any(Frame::is_binary) {
        return Data::Binary(encode_binary_payload(frames));
    }
    if frames.is_empty() {
        return Data::Text("0:".to_string());
    }

    let mut out = String::new();
    for frame in frames {
        let encoded = frame.encode_text();
        let _ = write!(out, "{}:{}", encoded.encode_utf16().count(), encoded);
    }
    Data::Text(out)
}

fn encode_binary_payload(frames: &[Frame]) -> Bytes {
    let mut buf = BytesMut::new();
    for frame in frames {
        let (flag, body) = match frame.encode(true) {
            Data::Text(text) => (0u8, Bytes::from(text.into_bytes())),
            Data::Binary(bytes) => (1u8, bytes),
        };
        buf.put_u8(flag);
        for digit in body.len().to_string().bytes() {
            buf.put_u8(digit - b'0');
        }
        buf.put_u8(BINARY_LENGTH_TERMINATOR);
        buf.extend_from_slice(&body);
    }
    buf.freeze()
}

/// Decodes a `<len>:<frame>` text payload.
pub fn decode_payload(text: &str) -> Result<Vec<Frame>, FrameError> {
    if text.is_empty() {
        return Err(FrameError::Length);
    }

    let mut frames = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let colon = rest.find(':').ok_or(FrameError::Length)?;
        let digits = &rest[..colon];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FrameError::Length);
        }
        let units: usize = digits.parse().map_err(|_| FrameError::Length)?;
        let body_start = colon + 1;
        let body_len = utf16_prefix_len(&rest[body_start..], units).ok_or(FrameError::Truncated)?;
        let body = &rest[body_start..body_start + body_len];
        if !body.is_empty() {
            frames.push(Frame::decode_str(body)?);
        }
        rest = &rest[body_start + body_len..];
    }
    Ok(frames)
}

/// Byte length of the prefix of `text` spanning exactly `units` UTF-16 code
/// units, or `None` if the text is shorter or the boundary splits a pair.
fn utf16_prefix_len(text: &str, units: usize) -> Option<usize> {
    let mut seen = 0usize;
    for (index, ch) in text.char_indices() {
        if seen == units {
            return Some(index);
        }
        seen += ch.len_utf16();
        if seen > units {
            return None;
        }
    }
    (seen == units).then_some(text.len())
}

/// Decodes the binary payload framing: per frame a `0` (text) or `1`
/// (binary) flag, the body length as one byte per decimal digit, `0xFF`, then
/// the body.
pub fn decode_binary_payload(bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let is_text = match bytes[cursor] {
            0 => true,
            1 => false,
            _ => return Err(FrameError::Length),
        };
        cursor += 1;

        let mut len = 0usize;
        let mut digits = 0usize;
        loop {
            let byte = *bytes.get(cursor).ok_or(FrameError::Truncated)?;
            cursor += 1;
            if byte == BINARY_LENGTH_TERMINATOR {
                break;
            }
            if byte > 9 {
                return Err(FrameError::Length);
            }
            len = len
                .checked_mul(10)
                .and_then(|value| value.checked_add(usize::from(byte)))
                .ok_or(FrameError::Length)?;
            digits += 1;
        }
        if digits == 0 {
            return Err(FrameError::Length);
        }

        let end = cursor
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or(FrameError::Truncated)?;
        let body = &bytes[cursor..end];
        let frame = if is_text {
            let text = std::str::from_utf8(body).map_err(|_| FrameError::Utf8)?;
            Frame::decode_str(text)?
        } else {
            Frame::decode_binary(Bytes::copy_from_slice(body))?
        };
        frames.push(frame);
        cursor = end;
    }
    Ok(frames)
}
