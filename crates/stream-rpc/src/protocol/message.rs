//! Call establishment and method addressing.

use crate::error::{CodecError, Error, Result};

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Declared direction(s) in which a method carries multiple messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingShape {
    /// One request, one response.
    Unary,
    /// One request, many responses.
    ServerStreaming,
    /// Many requests, one response.
    ClientStreaming,
    /// Many requests, many responses.
    Bidirectional,
}

impl StreamingShape {
    /// Whether the client may send more than one message.
    #[must_use]
    pub const fn client_streams(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::Bidirectional)
    }

    /// Whether the server may send more than one message.
    #[must_use]
    pub const fn server_streams(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::Bidirectional)
    }
}

impl fmt::Display for StreamingShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server-streaming",
            Self::ClientStreaming => "client-streaming",
            Self::Bidirectional => "bidirectional",
        })
    }
}

/// Build a method identifier from its parts.
#[must_use]
pub fn method_id(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

/// Check that `id` has the form `/<Service>/<Method>`.
///
/// Matching is case-sensitive and both parts must be non-empty.
///
/// # Errors
///
/// Returns [`Error::InvalidMethod`] otherwise.
pub fn validate_method_id(id: &str) -> Result<()> {
    let invalid = || Error::InvalidMethod(id.to_string());

    let rest = id.strip_prefix('/').ok_or_else(invalid)?;
    let (service, method) = rest.split_once('/').ok_or_else(invalid)?;

    if service.is_empty()
        || method.is_empty()
        || method.contains('/')
        || id.chars().any(char::is_whitespace)
    {
        return Err(invalid());
    }

    Ok(())
}

/// First frame of every call stream.
///
/// The header is always JSON, independent of the payload codec, so a server
/// can reject a codec it does not speak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHeader {
    /// Method identifier.
    pub method: String,
    /// Name of the codec the client encodes payloads with.
    pub codec: String,
    /// Streaming shape the client drives the call with.
    pub shape: StreamingShape,
    /// Remaining client deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CallHeader {
    /// Remaining client deadline.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Encode the header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be serialized.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from).map_err(|e| {
            CodecError::Encode {
                codec: "json",
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Decode a header.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid header.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            CodecError::Decode {
                codec: "json",
                reason: e.to_string(),
            }
            .into()
        })
    }
}
