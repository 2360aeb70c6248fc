//! Pluggable payload codecs.
//!
//! A codec turns an in-memory value into bytes and back, with no knowledge of
//! framing or RPC semantics. The target shape of a decode is always supplied
//! by the caller as a type parameter; codecs never guess a type.
//!
//! Every codec rejects input that carries bytes after a complete value, so a
//! truncated or concatenated payload surfaces as a decode error instead of
//! silently losing data.

use crate::error::CodecError;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Encode/decode capability for wire payloads.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Human-readable name, exchanged during call establishment.
    fn name(&self) -> &'static str;

    /// Encode a value into bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the format cannot represent the value.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Decode bytes into a value of the requested shape.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] on truncated or corrupt input, or when the
    /// encoded data does not match the requested shape.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode {
                codec: self.name(),
                reason: e.to_string(),
            })
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode {
            codec: self.name(),
            reason: e.to_string(),
        })
    }
}

/// CBOR codec backed by `ciborium`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        let mut vec = Vec::new();
        ciborium::ser::into_writer(value, &mut vec).map_err(|e| CodecError::Encode {
            codec: self.name(),
            reason: e.to_string(),
        })?;
        Ok(Bytes::from(vec))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        let mut reader = data;
        let value = ciborium::de::from_reader(&mut reader).map_err(|e| CodecError::Decode {
            codec: self.name(),
            reason: e.to_string(),
        })?;

        if !reader.is_empty() {
            return Err(CodecError::Decode {
                codec: self.name(),
                reason: format!("{} trailing bytes after value", reader.len()),
            });
        }

        Ok(value)
    }
}

/// Bincode codec with fixed-width integers.
///
/// Bincode is not self-describing: values are reconstructed purely from the
/// field order of the requested shape. Types relying on `deserialize_any`
/// (such as `serde_json::Value`) cannot be decoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    fn options() -> impl bincode::Options {
        use bincode::Options;

        bincode::options()
            .with_fixint_encoding()
            .reject_trailing_bytes()
    }
}

impl Codec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        use bincode::Options;

        Self::options()
            .serialize(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode {
                codec: self.name(),
                reason: e.to_string(),
            })
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        use bincode::Options;

        Self::options()
            .deserialize(data)
            .map_err(|e| CodecError::Decode {
                codec: self.name(),
                reason: e.to_string(),
            })
    }
}
