//! Protocol layer for the RPC runtime.
//!
//! This module contains the core protocol definitions including:
//! - Pluggable payload codecs
//! - Length-prefixed message framing
//! - Call establishment and terminal status

pub mod codec;
pub mod framing;
pub mod message;
pub mod status;

pub use codec::{BincodeCodec, CborCodec, Codec, JsonCodec};
pub use framing::{DEFAULT_MAX_FRAME_SIZE, FrameCodec};
pub use message::{CallHeader, StreamingShape, method_id, validate_method_id};
pub use status::{Status, StatusCode};
