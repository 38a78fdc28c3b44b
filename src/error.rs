use std::time::Duration;

use thiserror::Error;

use crate::message::RequestId;

/// Failures surfaced by the connection's control-plane operations
/// (`connect`, `send_request`, codec decoding, lifecycle transitions).
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("frame ended unexpectedly between header and payload")]
    TruncatedFrame,

    #[error("header named an unrecognized message type: {0}")]
    MalformedHeader(String),

    #[error("frame decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("frame encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("transport io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("connect() called on a connection that is already connected")]
    AlreadyConnected,

    #[error("send attempted after the sender was closed")]
    ClosedForSend,

    #[error("operation requires an established connection")]
    NotConnected,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(err)
    }
}

/// Why an outstanding request was cancelled rather than answered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelReason {
    /// The caller explicitly cancelled the request via its handle.
    CallerRequested,
    /// No `ProgressResponse` arrived before the configured timeout elapsed.
    Timeout,
    /// The connection began closing while the request was outstanding.
    ConnectionClosed,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CancelReason::CallerRequested => "caller requested cancellation",
            CancelReason::Timeout => "timed out waiting for progress",
            CancelReason::ConnectionClosed => "connection closed",
        };
        f.write_str(label)
    }
}

/// Outcome observed by a waiter on a single outbound request. Distinct from
/// [`ConnectionError`], which covers connection-wide control-plane failures.
#[derive(Clone, Debug, Error)]
pub enum RequestFault {
    #[error("peer returned {code}: {message}")]
    Remote { code: String, message: String, data: Option<serde_json::Value> },

    #[error("request cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("{0}")]
    Local(String),
}

/// A connection-wide event unrelated to any single request's waiter, surfaced
/// through [`crate::Connection::subscribe_faults`].
#[derive(Clone, Debug)]
pub enum ConnectionFault {
    Codec(String),
    OrphanResponse { request_id: RequestId },
    HandlerFault { method: String, message: String },
    Io(String),
}

impl std::fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionFault::Codec(msg) => write!(f, "codec fault: {msg}"),
            ConnectionFault::OrphanResponse { request_id } => {
                write!(f, "response for unknown request {request_id}")
            }
            ConnectionFault::HandlerFault { method, message } => {
                write!(f, "handler for `{method}` failed: {message}")
            }
            ConnectionFault::Io(msg) => write!(f, "io fault: {msg}"),
        }
    }
}

/// Error returned by a [`crate::Handler`] implementation. The connection maps
/// this into an `ErrorResponse` frame sent back to the peer.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError(err.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError(message.to_string())
    }
}
