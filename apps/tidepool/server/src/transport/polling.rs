use http::header::{ACCESS_CONTROL_ALLOW_HEADERS, CONTENT_TYPE};
use http::{HeaderName, HeaderValue, StatusCode};
use tidepool_core::{decode_binary_payload, decode_payload, encode_payload, Data, Frame, FrameError, FrameType};
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::{Request, Response};

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";
const BINARY_CONTENT_TYPE: &str = "application/octet-stream";
const JSONP_CONTENT_TYPE: &str = "text/javascript; charset=UTF-8";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollingFlavor {
    Xhr,
    /// Responses are wrapped in a call to `___eio[index]`.
    Jsonp { index: String },
}

impl PollingFlavor {
    pub fn from_request(request: &Request) -> Self {
        match request.query("j") {
            Some(j) => PollingFlavor::Jsonp {
                index: j.chars().filter(char::is_ascii_digit).collect(),
            },
            None => PollingFlavor::Xhr,
        }
    }
}

#[derive(Debug)]
struct PendingPoll {
    token: u64,
    responder: oneshot::Sender<Response>,
}

/// Long-polling channel. Writable exactly while a GET is parked on it.
#[derive(Debug)]
pub struct Polling {
    flavor: PollingFlavor,
    supports_binary: bool,
    origin: Option<String>,
    pending: Option<PendingPoll>,
    next_token: u64,
}

impl Polling {
    pub fn new(flavor: PollingFlavor, supports_binary: bool) -> Self {
        let supports_binary = supports_binary && flavor == PollingFlavor::Xhr;
        Self {
            flavor,
            supports_binary,
            origin: None,
            pending: None,
            next_token: 0,
        }
    }

    pub fn flavor(&self) -> &PollingFlavor {
        &self.flavor
    }

    pub fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    pub fn writable(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| !pending.responder.is_closed())
    }

    /// Origin of the most recent request, echoed in CORS headers.
    pub fn set_origin(&mut self, origin: Option<&str>) {
        self.origin = origin.map(str::to_string);
    }

    /// Parks a GET. Returns `None` while another GET is still parked.
    pub fn hold(&mut self) -> Option<(u64, oneshot::Receiver<Response>)> {
        if self.writable() {
            return None;
        }
        let (responder, receiver) = oneshot::channel();
        self.next_token += 1;
        let token = self.next_token;
        self.pending = Some(PendingPoll { token, responder });
        Some((token, receiver))
    }

    /// Forgets the parked GET identified by `token`, if it is still parked.
    pub fn release(&mut self, token: u64) -> bool {
        if self.pending.as_ref().is_some_and(|pending| pending.token == token) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Answers the parked GET with `frames` as one payload.
    pub fn send(&mut self, frames: Vec<Frame>) -> Result<(), Vec<Frame>> {
        let Some(pending) = self.pending.take() else {
            return Err(frames);
        };
        let response = self.respond(&frames);
        if pending.responder.send(response).is_err() {
            debug!("poll requester went away before the flush");
            return Err(frames);
        }
        Ok(())
    }

    /// Builds the response body for a batch of frames.
    pub fn respond(&self, frames: &[Frame]) -> Response {
        let response = match (&self.flavor, encode_payload(frames, self.supports_binary)) {
            (PollingFlavor::Xhr, Data::Text(text)) => {
                Response::new(StatusCode::OK).with_body(TEXT_CONTENT_TYPE, text)
            }
            (PollingFlavor::Xhr, Data::Binary(bytes)) => {
                Response::new(StatusCode::OK).with_body(BINARY_CONTENT_TYPE, bytes)
            }
            (PollingFlavor::Jsonp { index }, payload) => {
                let text = match payload {
                    Data::Text(text) => text,
                    Data::Binary(_) => encode_text_payload(frames),
                };
                Response::new(StatusCode::OK)
                    .with_body(JSONP_CONTENT_TYPE, jsonp_wrap(index, &text))
                    .with_header(
                        HeaderName::from_static("x-xss-protection"),
                        HeaderValue::from_static("0"),
                    )
            }
        };
        response.with_cors(self.origin.as_deref())
    }

    /// Decodes a POST body into frames.
    pub fn decode(&self, request: &Request) -> Result<Vec<Frame>, FrameError> {
        match &self.flavor {
            PollingFlavor::Jsonp { .. } => {
                let form = url::form_urlencoded::parse(request.body());
                let (_, data) = form
                    .into_iter()
                    .find(|(key, _)| key == "d")
                    .ok_or(FrameError::Empty)?;
                decode_payload(&unescape_newlines(&data))
            }
            PollingFlavor::Xhr => {
                let binary = request
                    .header(CONTENT_TYPE.as_str())
                    .is_some_and(|value| value.starts_with(BINARY_CONTENT_TYPE));
                if binary {
                    decode_binary_payload(request.body())
                } else {
                    let text =
                        std::str::from_utf8(request.body()).map_err(|_| FrameError::Utf8)?;
                    decode_payload(text)
                }
            }
        }
    }

    /// Reply to a successful POST.
    pub fn ack_response(&self) -> Response {
        Response::new(StatusCode::OK)
            .with_body("text/html", "ok")
            .with_cors(self.origin.as_deref())
    }

    /// CORS preflight reply.
    pub fn options_response(&self) -> Response {
        Response::new(StatusCode::OK)
            .with_header(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"))
            .with_cors(self.origin.as_deref())
    }

    /// Releases a parked GET with a `close` frame.
    pub fn close(&mut self) {
        self.answer_pending(FrameType::Close);
    }

    /// Releases a parked GET with a `noop` so the client moves on.
    pub fn discard(&mut self) {
        self.answer_pending(FrameType::Noop);
    }

    fn answer_pending(&mut self, kind: FrameType) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.responder.send(self.respond(&[Frame::new(kind)]));
        }
    }
}

fn encode_text_payload(frames: &[Frame]) -> String {
    match encode_payload(frames, false) {
        Data::Text(text) => text,
        Data::Binary(_) => String::new(),
    }
}

fn jsonp_wrap(index: &str, payload: &str) -> String {
    let quoted = serde_json::Value::String(payload.to_string())
        .to_string()
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029");
    format!("___eio[{index}]({quoted});")
}

/// `\n` escapes become newlines; an escaped backslash before `n` keeps the
/// literal `\n`.
fn unescape_newlines(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    let mut chars = data.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('\\') => {
                chars.next();
                if chars.peek() == Some(&'n') {
                    chars.next();
                    out.push_str("\\n");
                } else {
                    out.push_str("\\\\");
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};

    #[test]
    fn only_one_poll_is_parked() {
        let mut polling = Polling::new(PollingFlavor::Xhr, true);
        assert!(!polling.writable());

        let (token, _receiver) = polling.hold().unwrap();
        assert!(polling.writable());
        assert!(polling.hold().is_none());

        assert!(polling.release(token));
        assert!(!polling.release(token));
        assert!(!polling.writable());
    }

    #[test]
    fn abandoned_poll_does_not_block_the_next_one() {
        let mut polling = Polling::new(PollingFlavor::Xhr, true);
        let (_, receiver) = polling.hold().unwrap();
        drop(receiver);
        assert!(!polling.writable());
        assert!(polling.hold().is_some());
    }

    #[tokio::test]
    async fn flush_answers_the_parked_poll() {
        let mut polling = Polling::new(PollingFlavor::Xhr, true);
        polling.set_origin(Some("http://a.com"));
        let (_, receiver) = polling.hold().unwrap();

        polling
            .send(vec![Frame::text(FrameType::Message, "hello"), Frame::new(FrameType::Noop)])
            .unwrap();

        let response = receiver.await.unwrap();
        assert_eq!(response.body_text(), Some("6:4hello1:6"));
        assert_eq!(response.header("content-type"), Some(TEXT_CONTENT_TYPE));
        assert_eq!(response.header("access-control-allow-origin"), Some("http://a.com"));
        assert!(!polling.writable());
    }

    #[test]
    fn binary_frames_use_octet_stream_when_supported() {
        let polling = Polling::new(PollingFlavor::Xhr, true);
        let response = polling.respond(&[Frame::binary(FrameType::Message, vec![1u8, 2, 3])]);
        assert_eq!(response.header("content-type"), Some(BINARY_CONTENT_TYPE));

        let b64 = Polling::new(PollingFlavor::Xhr, false);
        let response = b64.respond(&[Frame::binary(FrameType::Message, vec![1u8, 2, 3])]);
        assert_eq!(response.body_text(), Some("6:b4AQID"));
    }

    #[test]
    fn jsonp_wraps_and_escapes() {
        let request = Request::new(
            Method::GET,
            Uri::from_static("/socket.io/?transport=polling&j=4x"),
        );
        let flavor = PollingFlavor::from_request(&request);
        assert_eq!(flavor, PollingFlavor::Jsonp { index: "4".into() });

        let polling = Polling::new(flavor, true);
        assert!(!polling.supports_binary());
        let response = polling.respond(&[Frame::text(FrameType::Message, "a\"b\u{2028}")]);
        assert_eq!(response.header("content-type"), Some(JSONP_CONTENT_TYPE));
        assert_eq!(response.header("x-xss-protection"), Some("0"));
        assert_eq!(
            response.body_text(),
            Some("___eio[4](\"5:4a\\\"b\\u2028\");")
        );
    }

    #[test]
    fn jsonp_posts_are_form_encoded() {
        let polling = Polling::new(PollingFlavor::Jsonp { index: "0".into() }, false);
        let request = Request::new(Method::POST, Uri::from_static("/socket.io/?j=0"))
            .with_body("d=6%3A4a%5Cnb%5C%5Cn");
        let frames = polling.decode(&request).unwrap();
        assert_eq!(frames, vec![Frame::text(FrameType::Message, "a\nb\\n")]);
    }

    #[test]
    fn octet_stream_posts_use_binary_framing() {
        let polling = Polling::new(PollingFlavor::Xhr, true);
        let request = Request::new(Method::POST, Uri::from_static("/socket.io/"))
            .with_header(CONTENT_TYPE, HeaderValue::from_static(BINARY_CONTENT_TYPE))
            .with_body(vec![1u8, 3, 0xff, 4, 9, 9]);
        let frames = polling.decode(&request).unwrap();
        assert_eq!(frames, vec![Frame::binary(FrameType::Message, vec![9u8, 9])]);
    }

    #[test]
    fn close_releases_the_parked_poll() {
        let mut polling = Polling::new(PollingFlavor::Xhr, true);
        let (_, mut receiver) = polling.hold().unwrap();
        polling.close();
        let response = receiver.try_recv().unwrap();
        assert_eq!(response.body_text(), Some("1:1"));
    }
}
