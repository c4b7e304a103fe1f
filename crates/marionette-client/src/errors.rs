//! Error types surfaced by the connection engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorBody;

/// Transport-layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to resolve a TCP endpoint to a socket address.
    #[error("failed to resolve '{endpoint}': {source}")]
    Resolve {
        /// Endpoint that could not be resolved.
        endpoint: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Failed to establish a connection to the endpoint.
    #[error("failed to connect to '{endpoint}': {source}")]
    Connect {
        /// Endpoint that refused the connection.
        endpoint: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Unix domain sockets are not available on this platform.
    #[error("unix socket endpoint '{0}' is not supported on this platform")]
    UnsupportedUnixTransport(String),
}

/// Errors decoding a frame into a protocol message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame was not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame was valid JSON but matched no known message shape.
    #[error("frame does not match any known message shape")]
    UnrecognisedShape,
}

/// Errors returned by [`Client`](crate::Client) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No live connection; `connect` has not succeeded yet.
    #[error("not connected to the editor host")]
    NotConnected,

    /// `connect` was invoked while a connection is already live.
    #[error("already connected to the editor host")]
    AlreadyConnected,

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A call payload failed to (de)serialize.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A request id was reused while a call with that id is still pending.
    #[error("request id {id} is already pending")]
    DuplicateId {
        /// The colliding request id.
        id: i64,
    },

    /// No response arrived within the caller's deadline.
    #[error("request timed out after {timeout:?}")]
    Timeout {
        /// The deadline the caller supplied.
        timeout: Duration,
    },

    /// The host returned an explicit error response.
    #[error("host returned error: {message} (code: {code})")]
    Remote {
        /// Host-defined error code.
        code: i64,
        /// Error message from the host.
        message: String,
    },

    /// The connection was torn down while the call was pending.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Why the connection went away.
        reason: String,
    },
}

impl ClientError {
    /// Builds a `Remote` error from a wire error body.
    #[must_use]
    pub fn from_remote(error: ErrorBody) -> Self {
        Self::Remote {
            code: error.code,
            message: error.message,
        }
    }
}
