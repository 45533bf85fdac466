//! Request delimiting on a raw byte stream.
//!
//! The listener feeds everything buffered so far into [`FrameAdapter::input`]
//! until it learns how long the next request is, then waits for that many
//! bytes. Oversized or unframeable input is refused from the head alone,
//! before any body is buffered.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE};
use parking_lot::Mutex;
use thiserror::Error;

use crate::message::{allowed_method, ConnectionInfo, Request, MAX_HEADERS};

/// Largest request head accepted before the separator shows up.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;
/// Entries kept by the length cache.
pub const LENGTH_CACHE_CAPACITY: usize = 512;
/// Only buffers up to this size are remembered.
const CACHEABLE_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("request entity too large")]
    RequestTooLarge,
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),
}

impl FramingError {
    /// Raw reply written before the connection is closed.
    pub fn response(&self) -> &'static [u8] {
        match self {
            FramingError::RequestTooLarge => b"HTTP/1.1 413 Request Entity Too Large\r\n\r\n",
            FramingError::BadRequest(_) | FramingError::Malformed(_) => {
                b"HTTP/1.1 400 Bad Request\r\n\r\n"
            }
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            FramingError::RequestTooLarge => "too_large",
            FramingError::BadRequest(_) => "bad_request",
            FramingError::Malformed(_) => "malformed",
        }
    }
}

#[derive(Debug)]
pub enum Framed {
    /// The head is not complete yet.
    Incomplete,
    /// The next request spans `length` bytes from the start of the buffer.
    Request { length: usize },
    /// A WebSocket upgrade; the connection leaves HTTP framing.
    Upgrade(Request),
}

/// Decides request boundaries. One adapter serves every connection of a
/// listener, so the length cache is shared between them.
#[derive(Debug)]
pub struct FrameAdapter {
    max_package_size: usize,
    lengths: Mutex<LengthCache>,
}

impl FrameAdapter {
    pub fn new(max_package_size: usize) -> Self {
        Self {
            max_package_size,
            lengths: Mutex::new(LengthCache::new(LENGTH_CACHE_CAPACITY)),
        }
    }

    pub fn input(&self, buf: &[u8], connection: ConnectionInfo) -> Result<Framed, FramingError> {
        let cacheable = buf.len() <= CACHEABLE_LEN;
        if cacheable {
            if let Some(length) = self.lengths.lock().get(buf) {
                return Ok(Framed::Request { length });
            }
        }

        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut head = httparse::Request::new(&mut slots);
        let head_len = match head.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial if buf.len() >= MAX_HEAD_SIZE => {
                return Err(FramingError::RequestTooLarge);
            }
            httparse::Status::Partial => return Ok(Framed::Incomplete),
        };

        if head.method.and_then(allowed_method).is_none() {
            return Err(FramingError::BadRequest("unsupported method"));
        }

        let length = match header_value(&head, CONTENT_LENGTH.as_str()) {
            Some(value) => {
                let body: usize = std::str::from_utf8(value)
                    .ok()
                    .and_then(|value| value.trim().parse().ok())
                    .ok_or(FramingError::BadRequest("invalid content-length"))?;
                head_len
                    .checked_add(body)
                    .ok_or(FramingError::RequestTooLarge)?
            }
            None if header_value(&head, TRANSFER_ENCODING.as_str()).is_some() => {
                return Err(FramingError::BadRequest("chunked bodies are not supported"));
            }
            None => head_len,
        };
        if length > self.max_package_size {
            return Err(FramingError::RequestTooLarge);
        }

        let upgrade = header_value(&head, UPGRADE.as_str());
        if upgrade.is_some_and(|value| value.eq_ignore_ascii_case(b"websocket")) {
            let request = Request::from_head(&head, Bytes::new(), connection)?;
            return Ok(Framed::Upgrade(request));
        }

        if cacheable {
            self.lengths.lock().insert(buf.to_vec(), length);
        }
        Ok(Framed::Request { length })
    }

    pub fn cached_lengths(&self) -> usize {
        self.lengths.lock().len()
    }
}

fn header_value<'h>(head: &httparse::Request<'_, 'h>, name: &str) -> Option<&'h [u8]> {
    head.headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value)
}

/// Bounded memo of buffer contents to computed request length, evicting the
/// oldest entry first.
#[derive(Debug)]
struct LengthCache {
    capacity: usize,
    order: VecDeque<Vec<u8>>,
    lengths: HashMap<Vec<u8>, usize>,
}

impl LengthCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            lengths: HashMap::with_capacity(capacity),
        }
    }

    fn get(&self, key: &[u8]) -> Option<usize> {
        self.lengths.get(key).copied()
    }

    fn insert(&mut self, key: Vec<u8>, length: usize) {
        if self.lengths.insert(key.clone(), length).is_some() {
            return;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.lengths.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.lengths.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionInfo {
        ConnectionInfo::new(None)
    }

    #[test]
    fn waits_for_the_head_separator() {
        let adapter = FrameAdapter::new(1024);
        let framed = adapter.input(b"GET /socket.io/ HTTP/1.1\r\nHost: x\r\n", conn()).unwrap();
        assert!(matches!(framed, Framed::Incomplete));
    }

    #[test]
    fn length_covers_head_and_body() {
        let adapter = FrameAdapter::new(1024);
        let raw = b"POST /socket.io/ HTTP/1.1\r\ncontent-LENGTH: 4\r\n\r\n2:40";
        match adapter.input(&raw[..raw.len() - 2], conn()).unwrap() {
            Framed::Request { length } => assert_eq!(length, raw.len()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn declared_body_over_limit_is_refused_from_the_head() {
        let adapter = FrameAdapter::new(64);
        let err = adapter
            .input(b"POST / HTTP/1.1\r\nContent-Length: 1000\r\n\r\n", conn())
            .unwrap_err();
        assert_eq!(err, FramingError::RequestTooLarge);
        assert!(err.response().starts_with(b"HTTP/1.1 413"));
    }

    #[test]
    fn unterminated_oversized_head_is_refused() {
        let adapter = FrameAdapter::new(usize::MAX);
        let mut buf = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        buf.resize(MAX_HEAD_SIZE, b'a');
        assert_eq!(adapter.input(&buf, conn()).unwrap_err(), FramingError::RequestTooLarge);
    }

    #[test]
    fn unknown_methods_and_chunked_bodies_are_bad_requests() {
        let adapter = FrameAdapter::new(1024);
        let err = adapter.input(b"BREW / HTTP/1.1\r\n\r\n", conn()).unwrap_err();
        assert!(matches!(err, FramingError::BadRequest(_)));
        assert!(err.response().starts_with(b"HTTP/1.1 400"));

        let err = adapter
            .input(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n", conn())
            .unwrap_err();
        assert!(matches!(err, FramingError::BadRequest(_)));
    }

    #[test]
    fn upgrades_are_detected_and_never_cached() {
        let adapter = FrameAdapter::new(1024);
        let raw = b"GET /socket.io/?transport=websocket HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        match adapter.input(raw, conn()).unwrap() {
            Framed::Upgrade(request) => assert_eq!(request.query("transport"), Some("websocket")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(adapter.cached_lengths(), 0);
    }

    #[test]
    fn cache_stays_bounded_and_consistent() {
        let adapter = FrameAdapter::new(1024);
        for i in 0..(LENGTH_CACHE_CAPACITY + 20) {
            let raw = format!("GET /{i} HTTP/1.1\r\n\r\n");
            let first = adapter.input(raw.as_bytes(), conn()).unwrap();
            let second = adapter.input(raw.as_bytes(), conn()).unwrap();
            match (first, second) {
                (Framed::Request { length: a }, Framed::Request { length: b }) => {
                    assert_eq!(a, raw.len());
                    assert_eq!(a, b);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(adapter.cached_lengths(), LENGTH_CACHE_CAPACITY);
    }

    #[test]
    fn garbage_heads_are_malformed() {
        let adapter = FrameAdapter::new(1024);
        let err = adapter.input(b"GET /\x01 HTTP/1.1\r\n\r\n", conn()).unwrap_err();
        assert!(matches!(err, FramingError::Malformed(_)));
        assert!(err.response().starts_with(b"HTTP/1.1 400"));
    }

    #[test]
    fn lengths_learned_on_one_connection_serve_another() {
        let adapter = FrameAdapter::new(1024);
        let raw = b"GET /socket.io/?EIO=3&transport=polling&sid=abc HTTP/1.1\r\nHost: x\r\n\r\n";
        adapter.input(raw, conn()).unwrap();
        assert_eq!(adapter.cached_lengths(), 1);

        match adapter.input(raw, conn()).unwrap() {
            Framed::Request { length } => assert_eq!(length, raw.len()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(adapter.cached_lengths(), 1);
    }
}
