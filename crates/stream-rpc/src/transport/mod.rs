//! Transport layer for the RPC runtime.
//!
//! The runtime needs very little from a transport: ordered, reliable,
//! bidirectional byte streams, one per call, that can be half-closed with a
//! trailer and aborted by either side. The traits in this module capture that
//! contract; [`mux`] implements it by multiplexing many call streams over a
//! single connection.

pub mod mux;

pub use mux::{MuxAcceptor, MuxConfig, MuxSession};

use crate::error::TransportError;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// A unit of inbound data on a call stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Bytes of the stream, in order. Chunk boundaries carry no meaning.
    Data(Bytes),
    /// The peer closed its send direction, attaching a trailer.
    Fin(Bytes),
}

/// Sending direction of a call stream.
#[async_trait]
pub trait SendHalf: Send + 'static {
    /// Write bytes to the stream.
    ///
    /// Suspends while the peer has not granted enough receive credit or the
    /// connection's outbound buffer is full.
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the send direction, attaching a trailer for the peer.
    ///
    /// A failed finish leaves the stream open, so it can be retried with a
    /// smaller trailer.
    async fn finish(&mut self, trailer: Bytes) -> Result<(), TransportError>;
}

/// Receiving direction of a call stream.
#[async_trait]
pub trait RecvHalf: Send + 'static {
    /// Receive the next chunk.
    ///
    /// Once [`Chunk::Fin`] has been returned, every later call returns it again.
    async fn recv(&mut self) -> Result<Chunk, TransportError>;
}

/// Handle that aborts a call stream in both directions.
///
/// Aborting is synchronous and idempotent so it can run from `Drop`.
pub trait Abort: Send + Sync + 'static {
    /// Abort the stream and tell the peer.
    fn abort(&self);

    /// Whether the stream was aborted locally.
    fn is_aborted(&self) -> bool;
}

/// One transport-level call stream.
pub struct RawStream {
    /// Stream identifier, unique per connection.
    pub id: u32,
    /// Sending direction.
    pub send: Box<dyn SendHalf>,
    /// Receiving direction.
    pub recv: Box<dyn RecvHalf>,
    /// Abort handle.
    pub abort: Arc<dyn Abort>,
    /// Fired when either side aborts the stream or the connection is lost.
    pub aborted: CancellationToken,
    /// Fired when the connection carrying the stream is lost.
    pub closed: CancellationToken,
}

impl fmt::Debug for RawStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStream")
            .field("id", &self.id)
            .field("aborted", &self.aborted.is_cancelled())
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Client side of a transport: opens call streams.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new call stream.
    async fn open(&self) -> Result<RawStream, TransportError>;
}

/// Server side of a transport: accepts call streams.
#[async_trait]
pub trait Acceptor: Send + 'static {
    /// Accept the next call stream, or `None` once the connection is gone.
    async fn accept(&mut self) -> Result<Option<RawStream>, TransportError>;
}
