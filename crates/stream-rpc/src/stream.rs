//! Message framing over one transport call stream.
//!
//! A [`FrameStream`] turns the ordered byte stream of a call into a sequence
//! of length-prefixed messages. Frames are opaque here: this layer does not
//! know which type a frame encodes.

use crate::error::{Error, FramingError, Result, TransportError};
use crate::protocol::framing::{FrameCodec, LENGTH_PREFIX_SIZE};
use crate::transport::{Abort, Chunk, RawStream, RecvHalf, SendHalf};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::{Instant, sleep_until};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Signals that end a blocking operation of a call early.
#[derive(Debug, Clone)]
pub(crate) struct CallGuard {
    cancel: CancellationToken,
    aborted: CancellationToken,
    closed: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl CallGuard {
    pub(crate) const fn new(
        cancel: CancellationToken,
        aborted: CancellationToken,
        closed: CancellationToken,
    ) -> Self {
        Self {
            cancel,
            aborted,
            closed,
            deadline: None,
        }
    }

    /// Start the deadline clock now.
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.deadline = timeout.and_then(|t| Instant::now().checked_add(t).map(|at| (at, t)));
    }

    /// Time left before the deadline.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.aborted.is_cancelled()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }

    /// Error for an operation attempted after the stream was torn down.
    pub(crate) fn torn_down(&self) -> Error {
        if self.closed.is_cancelled() {
            TransportError::ConnectionClosed.into()
        } else {
            Error::Cancelled
        }
    }

    /// Resolves once the call is cancelled, aborted or out of time.
    pub(crate) async fn interrupted(&self) -> Error {
        let deadline = async {
            match self.deadline {
                Some((at, timeout)) => {
                    sleep_until(at).await;
                    timeout
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Error::Cancelled,
            () = self.closed.cancelled() => TransportError::ConnectionClosed.into(),
            () = self.aborted.cancelled() => Error::Cancelled,
            timeout = deadline => Error::Timeout(timeout),
        }
    }

    /// Drive `fut` unless the call is interrupted first.
    pub(crate) async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            err = self.interrupted() => Err(err),
            out = fut => Ok(out),
        }
    }
}

/// Writing half of a [`FrameStream`].
pub struct FrameWriter {
    id: u32,
    send: Box<dyn SendHalf>,
    codec: FrameCodec,
    guard: CallGuard,
    abort: Arc<dyn Abort>,
    torn: bool,
    closed: bool,
}

impl FrameWriter {
    /// Write one length-prefixed frame.
    ///
    /// Suspends while the transport applies backpressure.
    ///
    /// # Errors
    ///
    /// Fails with a framing error if the payload exceeds the maximum frame
    /// size, with [`Error::Cancelled`]/[`Error::Timeout`] if the call is
    /// interrupted, or with a transport error if the stream is closed.
    pub async fn send_message(&mut self, payload: Bytes) -> Result<()> {
        let codec = self.codec;
        self.send_frame(codec, payload).await
    }

    /// Write a control frame such as the call header.
    ///
    /// Bounded by the default frame size rather than the configured one, so
    /// a small payload limit never rejects the call itself.
    pub(crate) async fn send_control(&mut self, payload: Bytes) -> Result<()> {
        self.send_frame(FrameCodec::new(), payload).await
    }

    async fn send_frame(&mut self, mut codec: FrameCodec, payload: Bytes) -> Result<()> {
        if self.closed {
            return Err(TransportError::SendClosed(self.id).into());
        }
        if self.guard.is_aborted() {
            return Err(self.guard.torn_down());
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        codec.encode(payload, &mut buf)?;
        let len = buf.len();

        // Cleared only once the whole frame is handed to the transport
        self.torn = true;
        let send = &mut self.send;
        self.guard.run(send.send(buf.freeze())).await??;
        self.torn = false;

        trace!("Stream {} sent frame of {} bytes", self.id, len);
        Ok(())
    }

    /// Half-close the send direction, attaching `trailer`.
    ///
    /// Closing twice is a no-op. This does not race the call deadline, so a
    /// status can still be delivered after it has passed.
    ///
    /// # Errors
    ///
    /// Fails if the stream was aborted or a frame was left half written; in
    /// the latter case the stream is aborted instead.
    pub async fn close_send(&mut self, trailer: Bytes) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.guard.is_aborted() {
            return Err(self.guard.torn_down());
        }
        if self.torn {
            self.abort();
            return Err(Error::Protocol(
                "cannot half-close after a partially written frame".to_string(),
            ));
        }

        self.send.finish(trailer).await?;
        self.closed = true;
        Ok(())
    }

    /// Abort the stream in both directions.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Whether the send direction is closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.guard.set_timeout(timeout);
    }
}

/// Reading half of a [`FrameStream`].
pub struct FrameReader {
    id: u32,
    recv: Box<dyn RecvHalf>,
    codec: FrameCodec,
    buf: BytesMut,
    trailer: Option<Bytes>,
    guard: CallGuard,
    abort: Arc<dyn Abort>,
}

impl FrameReader {
    /// Receive the next complete frame.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::EndOfStream`] once the peer half-closed and every
    /// frame has been delivered; every later call fails the same way.
    /// Fails with a framing error on an oversize prefix or when the peer
    /// half-closed in the middle of a frame.
    pub async fn receive_message(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                trace!("Stream {} received frame of {} bytes", self.id, frame.len());
                return Ok(frame);
            }

            if self.trailer.is_some() {
                if self.buf.is_empty() {
                    return Err(Error::EndOfStream);
                }
                return Err(FramingError::Truncated {
                    remaining: self.buf.len(),
                }
                .into());
            }

            let recv = &mut self.recv;
            match self.guard.run(recv.recv()).await?? {
                Chunk::Data(data) => self.buf.extend_from_slice(&data),
                Chunk::Fin(trailer) => self.trailer = Some(trailer),
            }
        }
    }

    /// Trailer attached by the peer, once its send direction is closed.
    #[must_use]
    pub const fn trailer(&self) -> Option<&Bytes> {
        self.trailer.as_ref()
    }

    /// Abort the stream in both directions.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.guard.set_timeout(timeout);
    }

    pub(crate) const fn guard(&self) -> &CallGuard {
        &self.guard
    }
}

/// Length-prefixed message stream over one transport call stream.
pub struct FrameStream {
    writer: FrameWriter,
    reader: FrameReader,
}

impl FrameStream {
    /// Create a new frame stream.
    ///
    /// `cancel` interrupts every pending operation of the stream.
    #[must_use]
    pub fn new(raw: RawStream, codec: FrameCodec, cancel: CancellationToken) -> Self {
        let guard = CallGuard::new(cancel, raw.aborted, raw.closed);

        Self {
            writer: FrameWriter {
                id: raw.id,
                send: raw.send,
                codec,
                guard: guard.clone(),
                abort: Arc::clone(&raw.abort),
                torn: false,
                closed: false,
            },
            reader: FrameReader {
                id: raw.id,
                recv: raw.recv,
                codec,
                buf: BytesMut::new(),
                trailer: None,
                guard,
                abort: raw.abort,
            },
        }
    }

    /// Apply a deadline to every operation, starting now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.writer.set_timeout(timeout);
        self.reader.set_timeout(timeout);
        self
    }

    /// Transport stream identifier.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.writer.id
    }

    /// See [`FrameWriter::send_message`].
    ///
    /// # Errors
    ///
    /// See [`FrameWriter::send_message`].
    pub async fn send_message(&mut self, payload: Bytes) -> Result<()> {
        self.writer.send_message(payload).await
    }

    /// See [`FrameReader::receive_message`].
    ///
    /// # Errors
    ///
    /// See [`FrameReader::receive_message`].
    pub async fn receive_message(&mut self) -> Result<Bytes> {
        self.reader.receive_message().await
    }

    /// See [`FrameWriter::close_send`].
    ///
    /// # Errors
    ///
    /// See [`FrameWriter::close_send`].
    pub async fn close_send(&mut self, trailer: Bytes) -> Result<()> {
        self.writer.close_send(trailer).await
    }

    /// Abort the stream in both directions.
    pub fn abort(&self) {
        self.writer.abort();
    }

    /// Split into independently owned halves.
    #[must_use]
    pub fn split(self) -> (FrameWriter, FrameReader) {
        (self.writer, self.reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mux::{self, MuxConfig};
    use crate::transport::{Acceptor, Connector};
    use bytes::BufMut;
    use proptest::prelude::*;

    async fn stream_pair(config: MuxConfig, codec: FrameCodec) -> (FrameStream, FrameStream) {
        let (client, mut acceptor) = mux::pair(config);
        let local = client.open().await.unwrap();
        let remote = acceptor.accept().await.unwrap().unwrap();
        (
            FrameStream::new(local, codec, CancellationToken::new()),
            FrameStream::new(remote, codec, CancellationToken::new()),
        )
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_then_end() {
        let (mut local, mut remote) = stream_pair(MuxConfig::default(), FrameCodec::new()).await;

        for payload in ["one", "", "three"] {
            local.send_message(Bytes::from(payload)).await.unwrap();
        }
        local.close_send(Bytes::from("bye")).await.unwrap();

        for payload in ["one", "", "three"] {
            assert_eq!(remote.receive_message().await.unwrap(), Bytes::from(payload));
        }
        assert!(matches!(remote.receive_message().await, Err(Error::EndOfStream)));
        assert!(matches!(remote.receive_message().await, Err(Error::EndOfStream)));
        assert_eq!(remote.reader.trailer(), Some(&Bytes::from("bye")));
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected_by_receiver() {
        let (client, mut acceptor) = mux::pair(MuxConfig::default());
        let mut local = FrameStream::new(
            client.open().await.unwrap(),
            FrameCodec::new(),
            CancellationToken::new(),
        );
        let mut remote = FrameStream::new(
            acceptor.accept().await.unwrap().unwrap(),
            FrameCodec::new().with_max_frame_size(8),
            CancellationToken::new(),
        );

        local.send_message(Bytes::from("far too long")).await.unwrap();
        assert!(matches!(
            remote.receive_message().await,
            Err(Error::Framing(FramingError::FrameTooLarge { size: 12, max: 8 }))
        ));
    }

    #[tokio::test]
    async fn test_half_close_mid_frame_is_truncation() {
        let (client, mut acceptor) = mux::pair(MuxConfig::default());
        let mut raw = client.open().await.unwrap();
        let mut remote = FrameStream::new(
            acceptor.accept().await.unwrap().unwrap(),
            FrameCodec::new(),
            CancellationToken::new(),
        );

        let mut partial = BytesMut::new();
        partial.put_u32(10);
        partial.put_slice(b"abc");
        raw.send.send(partial.freeze()).await.unwrap();
        raw.send.finish(Bytes::new()).await.unwrap();

        assert!(matches!(
            remote.receive_message().await,
            Err(Error::Framing(FramingError::Truncated { remaining: 7 }))
        ));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_receive() {
        let (client, mut acceptor) = mux::pair(MuxConfig::default());
        let _local = client.open().await.unwrap();
        let cancel = CancellationToken::new();
        let mut remote = FrameStream::new(
            acceptor.accept().await.unwrap().unwrap(),
            FrameCodec::new(),
            cancel.clone(),
        );

        let pending = tokio::spawn(async move { remote.receive_message().await });
        cancel.cancel();
        assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_peer_abort_unblocks_receive() {
        let (local, mut remote) = stream_pair(MuxConfig::default(), FrameCodec::new()).await;

        let pending = tokio::spawn(async move { remote.receive_message().await });
        local.abort();
        assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_unblocks_receive() {
        let (_local, remote) = stream_pair(MuxConfig::default(), FrameCodec::new()).await;
        let mut remote = remote.with_timeout(Some(Duration::from_millis(250)));

        assert!(matches!(
            remote.receive_message().await,
            Err(Error::Timeout(t)) if t == Duration::from_millis(250)
        ));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_means_no_deadline() {
        let mut guard = CallGuard::new(
            CancellationToken::new(),
            CancellationToken::new(),
            CancellationToken::new(),
        );
        guard.set_timeout(Some(Duration::MAX));
        assert_eq!(guard.remaining(), None);

        guard.set_timeout(Some(Duration::from_secs(1)));
        assert!(guard.remaining().is_some_and(|d| d <= Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_connection_loss_unblocks_receive() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let session = mux::MuxSession::client(client_io, MuxConfig::default());
        let mut local = FrameStream::new(
            session.open().await.unwrap(),
            FrameCodec::new(),
            CancellationToken::new(),
        );

        let pending = tokio::spawn(async move {
            let result = local.receive_message().await;
            (result, local)
        });
        drop(server_io);

        let (result, mut local) = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("receive should not hang")
            .unwrap();
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::ConnectionClosed))
        ));
        assert!(matches!(
            local.send_message(Bytes::from("late")).await,
            Err(Error::Transport(TransportError::ConnectionClosed))
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (mut local, _remote) = stream_pair(MuxConfig::default(), FrameCodec::new()).await;

        local.close_send(Bytes::new()).await.unwrap();
        local.close_send(Bytes::new()).await.unwrap();
        assert!(matches!(
            local.send_message(Bytes::from("late")).await,
            Err(Error::Transport(TransportError::SendClosed(_)))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn frames_survive_small_transport_packets(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..12),
            packet_size in 1usize..48,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let received = runtime.block_on(async {
                let config = MuxConfig { max_packet_size: packet_size, ..MuxConfig::default() };
                let (mut local, mut remote) = stream_pair(config, FrameCodec::new()).await;

                let sent = payloads.clone();
                let writer = tokio::spawn(async move {
                    for payload in sent {
                        local.send_message(Bytes::from(payload)).await.unwrap();
                    }
                    local.close_send(Bytes::new()).await.unwrap();
                    local
                });

                let mut received = Vec::new();
                loop {
                    match remote.receive_message().await {
                        Ok(frame) => received.push(frame.to_vec()),
                        Err(Error::EndOfStream) => break,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                drop(writer.await.unwrap());
                received
            });

            prop_assert_eq!(received, payloads);
        }
    }
}
