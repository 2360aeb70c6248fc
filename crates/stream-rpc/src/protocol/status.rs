//! Terminal call status.
//!
//! The status of a call travels in the trailer of the server's half-close,
//! never as a data frame. An empty trailer means success; anything else is a
//! JSON-encoded [`Status`].

use crate::error::{Error, FramingError, Result};

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Categorization of a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    /// The call completed successfully.
    Ok,
    /// The request was malformed.
    InvalidArgument,
    /// The method is not registered.
    NotFound,
    /// The server does not speak the requested codec.
    Unimplemented,
    /// A value could not be encoded.
    Encode,
    /// A value could not be decoded.
    Decode,
    /// A frame was malformed or too large.
    Framing,
    /// The call was cancelled.
    Cancelled,
    /// The call deadline passed.
    DeadlineExceeded,
    /// The server is shutting down.
    Unavailable,
    /// The handler failed.
    Internal,
}

impl StatusCode {
    /// Wire name of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Encode => "ENCODE",
            Self::Decode => "DECODE",
            Self::Framing => "FRAMING",
            Self::Cancelled => "CANCELLED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Status code for categorization.
    pub code: StatusCode,
    /// Human-readable message.
    pub message: String,
    /// Optional additional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Status {
    /// Create a status without details.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// The success status.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    /// Shorthand for an `INVALID_ARGUMENT` status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    /// Shorthand for an `INTERNAL` status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether this is the success status.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Encode as a half-close trailer.
    #[must_use]
    pub fn to_trailer(&self) -> Bytes {
        if self.is_ok() {
            return Bytes::new();
        }

        // A struct of strings and a JSON value always serializes
        serde_json::to_vec(self).map_or_else(
            |_| Bytes::from_static(br#"{"code":"INTERNAL","message":"unencodable status"}"#),
            Bytes::from,
        )
    }

    /// Shrink the status until its trailer fits in `max` bytes.
    ///
    /// Details go first, then the message is cut at a character boundary.
    /// The code is always kept.
    #[must_use]
    pub fn truncated(mut self, max: usize) -> Self {
        if self.to_trailer().len() <= max {
            return self;
        }

        self.details = None;
        loop {
            let len = self.to_trailer().len();
            if len <= max || self.message.is_empty() {
                return self;
            }
            let mut cut = self.message.len().saturating_sub(len - max);
            while !self.message.is_char_boundary(cut) {
                cut -= 1;
            }
            self.message.truncate(cut);
        }
    }

    /// Decode a half-close trailer.
    ///
    /// # Errors
    ///
    /// Returns a framing error if the trailer is not a valid status.
    pub fn from_trailer(trailer: &[u8]) -> Result<Self> {
        if trailer.is_empty() {
            return Ok(Self::ok());
        }

        serde_json::from_slice(trailer).map_err(|e| {
            Error::Framing(FramingError::InvalidPacket(format!(
                "malformed status trailer: {e}"
            )))
        })
    }

    /// Convert the status reported for `method` into a client-side result.
    ///
    /// # Errors
    ///
    /// Returns the error matching a non-OK status code.
    pub fn into_result(self, method: &str) -> Result<()> {
        match self.code {
            StatusCode::Ok => Ok(()),
            StatusCode::NotFound => Err(Error::NotFound(method.to_string())),
            StatusCode::Cancelled => Err(Error::Cancelled),
            _ => Err(Error::Remote {
                method: method.to_string(),
                status: self,
            }),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        let code = match err.root() {
            Error::Codec(crate::error::CodecError::Encode { .. }) => StatusCode::Encode,
            Error::Codec(crate::error::CodecError::Decode { .. }) => StatusCode::Decode,
            Error::Framing(_) => StatusCode::Framing,
            Error::NotFound(_) => StatusCode::NotFound,
            Error::InvalidMethod(_) | Error::Protocol(_) => StatusCode::InvalidArgument,
            Error::Cancelled => StatusCode::Cancelled,
            Error::Timeout(_) => StatusCode::DeadlineExceeded,
            Error::Status(status) | Error::Remote { status, .. } => return status.clone(),
            Error::Transport(_) => StatusCode::Unavailable,
            Error::DuplicateMethod(_) | Error::EndOfStream | Error::Call { .. } => {
                StatusCode::Internal
            }
        };

        Self::new(code, err.root().to_string())
    }
}
