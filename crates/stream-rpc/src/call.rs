//! Call-scoped message streams.
//!
//! A [`CallStream`] is the handle both sides of an RPC use to exchange typed
//! messages. It encodes with the call's codec, enforces the direction rules
//! of the method's streaming shape, and on the client turns the server's
//! terminal status into the end of the stream or an error.

use crate::error::{Error, Result};
use crate::protocol::{Codec, Status, StreamingShape};
use crate::stream::{CallGuard, FrameReader, FrameWriter};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::DropGuard;
use tracing::debug;

/// Which end of a call a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The end that opened the call.
    Client,
    /// The end running the handler.
    Server,
}

pub(crate) struct CallInfo {
    pub(crate) method: String,
    pub(crate) shape: StreamingShape,
    pub(crate) role: Role,
    pub(crate) id: u32,
    /// Stops the cancellation watcher once both halves are gone.
    pub(crate) watch: Option<DropGuard>,
}

impl CallInfo {
    fn wrap(&self, err: Error) -> Error {
        match self.role {
            Role::Client => err.in_call(&self.method),
            Role::Server => err,
        }
    }

    /// Whether this end may send more than one message.
    const fn sends_many(&self) -> bool {
        match self.role {
            Role::Client => self.shape.client_streams(),
            Role::Server => self.shape.server_streams(),
        }
    }

    /// Whether the peer may send more than one message.
    const fn receives_many(&self) -> bool {
        match self.role {
            Role::Client => self.shape.server_streams(),
            Role::Server => self.shape.client_streams(),
        }
    }
}

pub(crate) type SharedWriter = Arc<Mutex<FrameWriter>>;

/// A bidirectional, typed message stream for one call.
pub struct CallStream<C: Codec> {
    sender: CallSender<C>,
    receiver: CallReceiver<C>,
}

impl<C: Codec> CallStream<C> {
    pub(crate) fn new(info: CallInfo, codec: C, writer: SharedWriter, reader: FrameReader) -> Self {
        let info = Arc::new(info);
        Self {
            sender: CallSender {
                info: Arc::clone(&info),
                codec: codec.clone(),
                writer,
                guard: reader.guard().clone(),
                sent: 0,
                closed: false,
            },
            receiver: CallReceiver {
                info,
                codec,
                reader,
                received: 0,
                done: false,
            },
        }
    }

    /// Method identifier of the call.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.sender.info.method
    }

    /// Streaming shape the call runs with.
    #[must_use]
    pub fn shape(&self) -> StreamingShape {
        self.sender.info.shape
    }

    /// Transport stream identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.sender.info.id
    }

    /// Codec used for payloads.
    #[must_use]
    pub const fn codec(&self) -> &C {
        &self.sender.codec
    }

    /// Encode and send one message.
    ///
    /// # Errors
    ///
    /// See [`CallSender::send`].
    pub async fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        self.sender.send(message).await
    }

    /// Receive and decode one message.
    ///
    /// # Errors
    ///
    /// See [`CallReceiver::recv`].
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.receiver.recv().await
    }

    /// Close the send direction.
    ///
    /// # Errors
    ///
    /// See [`CallSender::close`].
    pub async fn close(&mut self) -> Result<()> {
        self.sender.close().await
    }

    /// Abort the call in both directions.
    pub fn cancel(&self) {
        self.receiver.cancel();
    }

    /// Whether the call was cancelled, aborted by either side or timed out.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.receiver.reader.guard().is_cancelled()
    }

    /// Time left before the call deadline, if it has one.
    #[must_use]
    pub fn time_remaining(&self) -> Option<Duration> {
        self.sender.guard.remaining()
    }

    /// Resolves once the call is cancelled, aborted or out of time.
    ///
    /// Handlers doing work between stream operations can race this to stop
    /// early.
    pub fn cancelled(&self) -> impl Future<Output = Error> + Send + 'static {
        self.sender.cancelled()
    }

    /// Read to the end of the stream, expecting no further messages.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Protocol`] if another message arrives, and with
    /// any non-OK terminal status on the client.
    pub async fn expect_end(&mut self) -> Result<()> {
        self.receiver.expect_end().await
    }

    /// Split into a sender and a receiver that can be driven independently.
    #[must_use]
    pub fn split(self) -> (CallSender<C>, CallReceiver<C>) {
        (self.sender, self.receiver)
    }
}

impl<C: Codec> fmt::Debug for CallStream<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStream")
            .field("method", &self.sender.info.method)
            .field("shape", &self.sender.info.shape)
            .field("role", &self.sender.info.role)
            .field("id", &self.sender.info.id)
            .finish_non_exhaustive()
    }
}

/// Sending half of a [`CallStream`].
pub struct CallSender<C: Codec> {
    info: Arc<CallInfo>,
    codec: C,
    writer: SharedWriter,
    guard: CallGuard,
    sent: usize,
    closed: bool,
}

impl<C: Codec> CallSender<C> {
    /// Encode and send one message.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Protocol`] when a direction that carries a single
    /// message is used twice or after [`close`](Self::close), with a codec
    /// error if the value cannot be encoded, and with the errors of
    /// [`FrameWriter::send_message`].
    pub async fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        if self.closed {
            return Err(self
                .info
                .wrap(Error::Protocol("send after close".to_string())));
        }
        if self.sent > 0 && !self.info.sends_many() {
            return Err(self.info.wrap(Error::Protocol(format!(
                "{} call allows a single message in this direction",
                self.info.shape
            ))));
        }

        let payload = self
            .codec
            .encode(message)
            .map_err(|e| self.info.wrap(e.into()))?;
        self.writer
            .lock()
            .await
            .send_message(payload)
            .await
            .map_err(|e| self.info.wrap(e))?;

        self.sent += 1;
        Ok(())
    }

    /// Close the send direction.
    ///
    /// On the client this half-closes the stream, telling the server no
    /// more requests follow. On the server it only stops further sends: the
    /// runtime half-closes with the call's status once the handler returns.
    ///
    /// # Errors
    ///
    /// Fails if the stream was aborted.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.info.role {
            Role::Client => self
                .writer
                .lock()
                .await
                .close_send(Bytes::new())
                .await
                .map_err(|e| self.info.wrap(e)),
            Role::Server => Ok(()),
        }
    }

    /// Resolves once the call is cancelled, aborted or out of time.
    pub fn cancelled(&self) -> impl Future<Output = Error> + Send + 'static {
        let guard = self.guard.clone();
        async move { guard.interrupted().await }
    }

    /// Number of messages sent so far.
    #[must_use]
    pub const fn sent(&self) -> usize {
        self.sent
    }
}

/// Receiving half of a [`CallStream`].
pub struct CallReceiver<C: Codec> {
    info: Arc<CallInfo>,
    codec: C,
    reader: FrameReader,
    received: usize,
    done: bool,
}

impl<C: Codec> CallReceiver<C> {
    /// Receive and decode one message.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::EndOfStream`] once the peer has closed its send
    /// direction and all messages were delivered; every later call fails the
    /// same way. On the client, a non-OK status from the server surfaces here
    /// instead, as [`Error::Remote`], [`Error::NotFound`] or
    /// [`Error::Cancelled`]. Other failures carry the errors of
    /// [`FrameReader::receive_message`], a decode error, or
    /// [`Error::Protocol`] if the peer sent more messages than the shape
    /// allows.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let frame = match self.reader.receive_message().await {
            Ok(frame) => frame,
            Err(Error::EndOfStream) => return Err(self.end_of_stream()),
            Err(e) => return Err(self.fail(e)),
        };

        if self.received > 0 && !self.info.receives_many() {
            return Err(self.fail(Error::Protocol(format!(
                "peer sent more than one message on a {} call",
                self.info.shape
            ))));
        }
        self.received += 1;

        self.codec.decode(&frame).map_err(|e| self.fail(e.into()))
    }

    /// Number of messages received so far.
    #[must_use]
    pub const fn received(&self) -> usize {
        self.received
    }

    /// Whether the receive direction has reached its terminal state.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Abort the call in both directions.
    pub fn cancel(&self) {
        self.reader.abort();
    }

    /// Resolves once the call is cancelled, aborted or out of time.
    pub fn cancelled(&self) -> impl Future<Output = Error> + Send + 'static {
        let guard = self.reader.guard().clone();
        async move { guard.interrupted().await }
    }

    /// Read to the end of the stream, expecting no further messages.
    ///
    /// # Errors
    ///
    /// See [`CallStream::expect_end`].
    pub async fn expect_end(&mut self) -> Result<()> {
        match self.recv::<IgnoredAny>().await {
            Ok(_) => Err(self.fail(Error::Protocol(
                "unexpected message after the last one".to_string(),
            ))),
            Err(e) if e.is_end_of_stream() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Terminal result once the peer half-closed.
    fn end_of_stream(&mut self) -> Error {
        self.done = true;

        if self.info.role == Role::Server {
            return Error::EndOfStream;
        }

        let status = self
            .reader
            .trailer()
            .map_or_else(|| Ok(Status::ok()), |t| Status::from_trailer(t));
        match status {
            Ok(status) => match status.into_result(&self.info.method) {
                Ok(()) => Error::EndOfStream,
                Err(e) => e,
            },
            Err(e) => self.info.wrap(e),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        if self.info.role == Role::Client && !self.done {
            debug!("Aborting {} after receive failure: {}", self.info.method, err);
            self.done = true;
            self.reader.abort();
        }
        self.info.wrap(err)
    }
}

impl<C: Codec> Drop for CallReceiver<C> {
    fn drop(&mut self) {
        // The server still has work in flight for an abandoned client call
        if self.info.role == Role::Client && !self.done {
            self.reader.abort();
        }
    }
}
