use thiserror::Error;
use tidepool_core::FrameError;

/// Reasons a request is refused before it reaches a session. Each maps to
/// the numeric code sent in the 403 error body; origin rejection has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Transport unknown")]
    UnknownTransport,
    #[error("Session ID unknown")]
    UnknownSid,
    #[error("Bad handshake method")]
    BadHandshakeMethod,
    #[error("Bad request")]
    BadRequest,
    #[error("Origin not allowed")]
    OriginNotAllowed,
}

impl RequestError {
    pub fn code(self) -> Option<u8> {
        match self {
            RequestError::UnknownTransport => Some(0),
            RequestError::UnknownSid => Some(1),
            RequestError::BadHandshakeMethod => Some(2),
            RequestError::BadRequest => Some(3),
            RequestError::OriginNotAllowed => None,
        }
    }

    pub fn metric_label(self) -> &'static str {
        match self {
            RequestError::UnknownTransport => "unknown_transport",
            RequestError::UnknownSid => "unknown_sid",
            RequestError::BadHandshakeMethod => "bad_handshake_method",
            RequestError::BadRequest => "bad_request",
            RequestError::OriginNotAllowed => "origin_not_allowed",
        }
    }
}

/// Refusals of a WebSocket upgrade. The session the upgrade targeted is left
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("upgrade attempt for closed client")]
    ClosedClient,
    #[error("transport has already been trying to upgrade")]
    AlreadyUpgrading,
    #[error("transport had already been upgraded")]
    AlreadyUpgraded,
    #[error("handshake could not be encoded: {0}")]
    Handshake(String),
    #[error(transparent)]
    Rejected(#[from] RequestError),
}

impl UpgradeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            UpgradeError::ClosedClient => "closed_client",
            UpgradeError::AlreadyUpgrading => "already_upgrading",
            UpgradeError::AlreadyUpgraded => "already_upgraded",
            UpgradeError::Handshake(_) => "handshake",
            UpgradeError::Rejected(inner) => inner.metric_label(),
        }
    }
}

/// Failures of the physical channel under a session. They tear the session
/// down but never the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("socket failure: {0}")]
    Socket(String),
    #[error("malformed payload: {0}")]
    Payload(#[from] FrameError),
}
