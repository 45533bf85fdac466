//! HTTP/1.1 value objects on top of the `http` crate: a fully buffered
//! request and the response the engine hands back for it.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_ORIGIN, CONNECTION, CONTENT_LENGTH,
    CONTENT_TYPE, ORIGIN, UPGRADE,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use serde::Serialize;
use uuid::Uuid;

use crate::error::RequestError;
use crate::framing::FramingError;

/// Header slots handed to the head parser.
pub(crate) const MAX_HEADERS: usize = 64;

/// Methods the framing layer lets through.
pub const ALLOWED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::OPTIONS,
    Method::HEAD,
    Method::DELETE,
    Method::PUT,
    Method::PATCH,
];

pub(crate) fn allowed_method(token: &str) -> Option<Method> {
    Method::from_bytes(token.as_bytes())
        .ok()
        .filter(|method| ALLOWED_METHODS.contains(method))
}

/// The physical connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub peer: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
    connection: ConnectionInfo,
}

impl Request {
    /// Builds a request by hand, mostly for callers that did not read it off
    /// a socket.
    pub fn new(method: Method, uri: Uri) -> Self {
        let query = parse_query(&uri);
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            query,
            body: Bytes::new(),
            connection: ConnectionInfo::new(None),
        }
    }

    pub fn from_http(request: http::Request<Bytes>, connection: ConnectionInfo) -> Self {
        let (parts, body) = request.into_parts();
        let query = parse_query(&parts.uri);
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            query,
            body,
            connection,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = connection;
        self
    }

    /// Parses one complete request (head and body) as delimited by the
    /// framing adapter.
    pub fn parse(raw: Bytes, connection: ConnectionInfo) -> Result<Self, FramingError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut head = httparse::Request::new(&mut slots);
        let head_len = match head.parse(&raw)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Err(FramingError::BadRequest("incomplete head")),
        };
        Self::from_head(&head, raw.slice(head_len..), connection)
    }

    /// Builds a request from a head the parser has already accepted.
    pub(crate) fn from_head(
        head: &httparse::Request<'_, '_>,
        body: Bytes,
        connection: ConnectionInfo,
    ) -> Result<Self, FramingError> {
        let method = head
            .method
            .and_then(allowed_method)
            .ok_or(FramingError::BadRequest("unsupported method"))?;
        let uri: Uri = head
            .path
            .ok_or(FramingError::BadRequest("missing request target"))?
            .parse()
            .map_err(|_| FramingError::BadRequest("invalid request target"))?;

        let mut headers = HeaderMap::with_capacity(head.headers.len());
        for header in head.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| FramingError::BadRequest("malformed header name"))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|_| FramingError::BadRequest("malformed header value"))?;
            headers.append(name, value);
        }

        let query = parse_query(&uri);
        Ok(Self {
            method,
            uri,
            version: match head.version {
                Some(0) => Version::HTTP_10,
                _ => Version::HTTP_11,
            },
            headers,
            query,
            body,
            connection,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Header lookup; names are case-insensitive. Values that are not
    /// visible ASCII read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn has_query(&self, name: &str) -> bool {
        self.query.contains_key(name)
    }

    /// The raw body bytes, undecoded.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn connection(&self) -> ConnectionInfo {
        self.connection
    }

    pub fn origin(&self) -> Option<&str> {
        self.header(ORIGIN.as_str())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header(UPGRADE.as_str())
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    }

    pub fn keep_alive(&self) -> bool {
        let connection = self.header(CONNECTION.as_str()).map(str::to_ascii_lowercase);
        match connection.as_deref() {
            Some(value) if value.contains("close") => false,
            Some(value) if value.contains("keep-alive") => true,
            _ => self.version() != Version::HTTP_10,
        }
    }
}

fn parse_query(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: Option<u8>,
    message: &'a str,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.with_header(CONTENT_TYPE, HeaderValue::from_static(content_type))
    }

    /// CORS headers: the request origin is mirrored with credentials allowed,
    /// otherwise any origin is accepted.
    pub fn with_cors(self, origin: Option<&str>) -> Self {
        match origin.and_then(|origin| HeaderValue::from_str(origin).ok()) {
            Some(origin) => self
                .with_header(ACCESS_CONTROL_ALLOW_ORIGIN, origin)
                .with_header(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true")),
            None => self.with_header(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
        }
    }

    /// The 403 JSON body for a refused request.
    pub fn request_error(err: RequestError, origin: Option<&str>) -> Self {
        Self::json_error(err.code(), &err.to_string(), origin)
    }

    pub fn json_error(code: Option<u8>, message: &str, origin: Option<&str>) -> Self {
        let body = serde_json::to_vec(&ErrorBody { code, message }).unwrap_or_default();
        Self::new(StatusCode::FORBIDDEN)
            .with_body("application/json", body)
            .with_cors(origin)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND).with_body("text/plain; charset=UTF-8", "Not Found")
    }

    pub fn internal_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
            .with_body("text/plain; charset=UTF-8", "Internal Server Error")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Serializes the response for the wire. Informational responses carry
    /// no body framing headers.
    pub fn to_bytes(&self, keep_alive: bool) -> Bytes {
        let mut out = BytesMut::with_capacity(128 + self.body.len());
        out.put_slice(b"HTTP/1.1 ");
        out.put_slice(self.status.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.status.canonical_reason().unwrap_or("Unknown").as_bytes());
        out.put_slice(b"\r\n");

        let mut put_header = |name: &HeaderName, value: &[u8]| {
            out.put_slice(name.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        };
        for (name, value) in &self.headers {
            put_header(name, value.as_bytes());
        }
        if !self.status.is_informational() {
            if !self.headers.contains_key(CONTENT_LENGTH) {
                put_header(&CONTENT_LENGTH, self.body.len().to_string().as_bytes());
            }
            let connection: &[u8] = if keep_alive { b"keep-alive" } else { b"close" };
            put_header(&CONNECTION, connection);
        }

        out.put_slice(b"\r\n");
        out.put_slice(&self.body);
        out.freeze()
    }
}

impl From<Response> for http::Response<Bytes> {
    fn from(response: Response) -> Self {
        let mut out = http::Response::new(response.body);
        *out.status_mut() = response.status;
        *out.headers_mut() = response.headers;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_head_query_and_body() {
        let raw = Bytes::from_static(
            b"POST /socket.io/?EIO=3&transport=polling&sid=abc HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\n2:40",
        );
        let request = Request::parse(raw, ConnectionInfo::new(None)).unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.path(), "/socket.io/");
        assert_eq!(request.query("transport"), Some("polling"));
        assert_eq!(request.query("sid"), Some("abc"));
        assert_eq!(request.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(request.body().as_ref(), b"2:40");
        assert!(request.keep_alive());
    }

    #[test]
    fn http_10_without_keep_alive_closes() {
        let raw = Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n");
        let request = Request::parse(raw, ConnectionInfo::new(None)).unwrap();
        assert_eq!(request.version(), Version::HTTP_10);
        assert!(!request.keep_alive());
    }

    #[test]
    fn rejects_malformed_request_lines() {
        let raw = Bytes::from_static(b"GET\r\n\r\n");
        assert!(Request::parse(raw, ConnectionInfo::new(None)).is_err());

        let raw = Bytes::from_static(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(
            Request::parse(raw, ConnectionInfo::new(None)).unwrap_err(),
            FramingError::BadRequest("unsupported method")
        );
    }

    #[test]
    fn error_bodies_carry_code_and_message() {
        let response = Response::request_error(RequestError::UnknownSid, None);
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(
            response.body_text(),
            Some(r#"{"code":1,"message":"Session ID unknown"}"#)
        );
        assert_eq!(response.header("access-control-allow-origin"), Some("*"));

        let response = Response::request_error(RequestError::OriginNotAllowed, Some("http://x.io"));
        assert_eq!(
            response.body_text(),
            Some(r#"{"code":null,"message":"Origin not allowed"}"#)
        );
        assert_eq!(response.header("Access-Control-Allow-Credentials"), Some("true"));
    }

    #[test]
    fn serializes_with_content_length() {
        let bytes = Response::new(StatusCode::OK)
            .with_body("text/plain; charset=UTF-8", "1:6")
            .to_bytes(false);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 3\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n1:6"));
    }

    #[test]
    fn switching_protocols_has_no_body_framing() {
        let bytes = Response::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(UPGRADE, HeaderValue::from_static("websocket"))
            .to_bytes(true);
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\n\r\n"
        );
    }
}
