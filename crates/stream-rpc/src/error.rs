//! Error types for the RPC runtime.

use crate::protocol::status::Status;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A value could not be encoded or decoded by the codec.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The length-prefixed framing of a call stream is broken.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Connection-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No handler is registered for the method.
    #[error("No handler registered for method {0}")]
    NotFound(String),

    /// A method was registered twice.
    #[error("Method {0} is already registered")]
    DuplicateMethod(String),

    /// The method identifier is not of the form `/<Service>/<Method>`.
    #[error("Invalid method identifier {0:?}, expected /<Service>/<Method>")]
    InvalidMethod(String),

    /// The peer closed its send direction and no frames are pending.
    ///
    /// This is the normal end of a stream, not a failure.
    #[error("End of stream")]
    EndOfStream,

    /// The call was cancelled, either locally or by the peer.
    #[error("Call cancelled")]
    Cancelled,

    /// The call deadline passed.
    #[error("Deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// A message sequence violated the method's streaming shape.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A handler terminated its call with an explicit status.
    #[error("Call terminated with {0}")]
    Status(Status),

    /// The server terminated the call with a failure status.
    #[error("{method} failed with {status}")]
    Remote {
        /// Method identifier of the failed call.
        method: String,
        /// Terminal status reported by the server.
        status: Status,
    },

    /// A local failure while driving a call.
    #[error("{method}: {source}")]
    Call {
        /// Method identifier of the failed call.
        method: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the innermost error, looking through call context.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Call { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is the normal end-of-stream signal.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.root(), Self::EndOfStream)
    }

    /// Whether the call ended through cancellation or an expired deadline.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), Self::Cancelled | Self::Timeout(_))
    }

    /// Attach the method identifier to a locally raised error.
    ///
    /// End-of-stream and errors that already name the method pass through.
    #[must_use]
    pub(crate) fn in_call(self, method: &str) -> Self {
        match self {
            Self::EndOfStream | Self::NotFound(_) | Self::Remote { .. } | Self::Call { .. } => {
                self
            }
            other => Self::Call {
                method: method.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Transport(TransportError::Io(err))
    }
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("{codec} failed to encode: {reason}")]
    Encode {
        /// Name of the codec.
        codec: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// Deserialization failed.
    #[error("{codec} failed to decode: {reason}")]
    Decode {
        /// Name of the codec.
        codec: &'static str,
        /// Description of the failure.
        reason: String,
    },
}

/// Framing errors.
#[derive(Debug, Error)]
pub enum FramingError {
    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The peer half-closed in the middle of a frame.
    #[error("Stream ended with {remaining} bytes of an incomplete frame")]
    Truncated {
        /// Bytes buffered when the stream ended.
        remaining: usize,
    },

    /// A multiplexer packet could not be parsed.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to establish connection.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The local send direction of the stream was already closed.
    #[error("Send side of stream {0} is closed")]
    SendClosed(u32),

    /// A half-close trailer exceeds what the transport carries.
    #[error("Trailer of {size} bytes exceeds the maximum of {max}")]
    TrailerTooLarge {
        /// Size of the rejected trailer.
        size: usize,
        /// Largest trailer the transport carries.
        max: usize,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
