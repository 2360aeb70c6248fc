//! Message framing for call streams.
//!
//! Each message is a 4-byte big-endian length followed by that many payload
//! bytes. There are no separators beyond the prefix.

use crate::error::{Error, FramingError};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame payload size (4MB by default).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Length prefix size.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for length-prefixed message frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// The largest payload this codec accepts.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the prefix without consuming
        let mut prefix = &buf[..LENGTH_PREFIX_SIZE];
        let payload_len = prefix.get_u32() as usize;

        // Reject before reserving anything
        if payload_len > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            }
            .into());
        }

        let frame_len = LENGTH_PREFIX_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(buf.split_to(payload_len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = payload.len();

        if payload_len > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            }
            .into());
        }

        let prefix = u32::try_from(payload_len).map_err(|_| FramingError::FrameTooLarge {
            size: payload_len,
            max: u32::MAX as usize,
        })?;

        buf.reserve(LENGTH_PREFIX_SIZE + payload_len);
        buf.put_u32(prefix);
        buf.put(payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Bytes::from("Hello, World!"), &mut buf).unwrap();
        assert_eq!(&buf[..LENGTH_PREFIX_SIZE], &13u32.to_be_bytes());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Bytes::from("Hello, World!"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Bytes::new(), &mut buf).unwrap();
        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::new());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        // Prefix claims 100 bytes, only 3 present
        buf.put_u32(100);
        buf.put_slice(b"abc");

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE + 3);
    }

    #[test]
    fn test_oversize_prefix_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(16);
        let mut buf = BytesMut::new();
        buf.put_u32(17);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Framing(FramingError::FrameTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_oversize_payload_not_encoded() {
        let mut codec = FrameCodec::new().with_max_frame_size(4);
        let mut buf = BytesMut::new();

        assert!(codec.encode(Bytes::from("too long"), &mut buf).is_err());
        assert!(buf.is_empty());
    }

    proptest! {
        #[test]
        fn frames_survive_arbitrary_chunking(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 0..20),
            chunk_size in 1usize..64,
        ) {
            let mut codec = FrameCodec::new();
            let mut wire = BytesMut::new();
            for payload in &payloads {
                codec.encode(Bytes::from(payload.clone()), &mut wire).unwrap();
            }

            let mut received = Vec::new();
            let mut buf = BytesMut::new();
            for chunk in wire.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    received.push(frame.to_vec());
                }
            }

            prop_assert!(buf.is_empty());
            prop_assert_eq!(received, payloads);
        }
    }
}
