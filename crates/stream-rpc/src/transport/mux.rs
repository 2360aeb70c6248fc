//! Multiplexes many call streams over one connection.
//!
//! Wire format of a packet: 4 bytes stream id, 1 byte packet kind, 4 bytes
//! payload length, then the payload. Clients open odd stream ids.
//!
//! A single writer task owns the write half of the connection, so packets of
//! concurrent streams are never interleaved. A single reader task routes
//! inbound packets to their stream.
//!
//! Every stream direction has a receive window of [`STREAM_WINDOW`] bytes.
//! A sender spends credit for each data packet and suspends once it runs
//! out; the receiver hands credit back with window updates as its reader
//! consumes data. A peer that overruns the window gets the stream reset.
//! Trailers are not flow controlled and may span several packets, up to
//! [`MAX_TRAILER_SIZE`].

use super::{Abort, Acceptor, Chunk, Connector, RawStream, RecvHalf, SendHalf};
use crate::error::{FramingError, TransportError};

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Maximum packet payload size (64KB by default).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

/// Packet header size (4 bytes stream id + 1 byte kind + 4 bytes length).
pub const PACKET_HEADER_SIZE: usize = 9;

/// Unacknowledged data bytes a stream direction may have in flight.
pub const STREAM_WINDOW: usize = 256 * 1024;

/// Largest trailer a stream can be half-closed with.
pub const MAX_TRAILER_SIZE: usize = 1024 * 1024;

/// Consumed bytes a receiver collects before granting them back.
const WINDOW_UPDATE_THRESHOLD: usize = STREAM_WINDOW / 4;

/// Configuration for a multiplexed session.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest packet payload; longer writes are split.
    pub max_packet_size: usize,
    /// Outbound packets buffered before senders suspend.
    pub outbound_queue: usize,
    /// Opened streams buffered before the acceptor picks them up.
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            outbound_queue: 64,
            accept_backlog: 128,
        }
    }
}

/// Type of packet being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Opens a stream.
    Open = 0x01,
    /// Stream bytes.
    Data = 0x02,
    /// Half-close with trailer.
    Fin = 0x03,
    /// Abort in both directions.
    Reset = 0x04,
    /// Grants the peer more send credit; the payload is a 4 byte increment.
    WindowUpdate = 0x05,
    /// Leading part of a trailer too long for one packet. The rest follows
    /// in further trailer packets and a final Fin.
    Trailer = 0x06,
}

impl TryFrom<u8> for PacketKind {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, FramingError> {
        match value {
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::Fin),
            0x04 => Ok(Self::Reset),
            0x05 => Ok(Self::WindowUpdate),
            0x06 => Ok(Self::Trailer),
            _ => Err(FramingError::InvalidPacket(format!(
                "Unknown packet kind: {value:#x}"
            ))),
        }
    }
}

/// A packet in the multiplexer wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Stream this packet belongs to.
    pub stream_id: u32,
    /// Type of this packet.
    pub kind: PacketKind,
    /// Packet payload.
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet.
    #[must_use]
    pub const fn new(stream_id: u32, kind: PacketKind, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind,
            payload,
        }
    }

    const fn control(stream_id: u32, kind: PacketKind) -> Self {
        Self::new(stream_id, kind, Bytes::new())
    }

    fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self::new(stream_id, PacketKind::WindowUpdate, payload.freeze())
    }
}

/// Codec for encoding/decoding packets.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    /// Create a codec with the given max payload size.
    #[must_use]
    pub const fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    fn too_large(&self, size: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            FramingError::FrameTooLarge {
                size,
                max: self.max_packet_size,
            },
        )
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        let mut header = &buf[..PACKET_HEADER_SIZE];
        let stream_id = header.get_u32();
        let kind_byte = header.get_u8();
        let payload_len = header.get_u32() as usize;

        if payload_len > self.max_packet_size {
            return Err(self.too_large(payload_len));
        }

        let packet_len = PACKET_HEADER_SIZE + payload_len;
        if buf.len() < packet_len {
            buf.reserve(packet_len - buf.len());
            return Ok(None);
        }

        let kind = PacketKind::try_from(kind_byte)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        buf.advance(PACKET_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Packet::new(stream_id, kind, payload)))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = packet.payload.len();
        if payload_len > self.max_packet_size {
            return Err(self.too_large(payload_len));
        }
        let len = u32::try_from(payload_len).map_err(|_| self.too_large(payload_len))?;

        buf.reserve(PACKET_HEADER_SIZE + payload_len);
        buf.put_u32(packet.stream_id);
        buf.put_u8(packet.kind as u8);
        buf.put_u32(len);
        buf.put(packet.payload);

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// What the reader task hands to a stream's receive half.
#[derive(Debug)]
enum Inbound {
    Data(Bytes),
    TrailerPart(Bytes),
    Fin(Bytes),
}

struct StreamEntry {
    inbound: mpsc::UnboundedSender<Inbound>,
    aborted: CancellationToken,
    /// Send credit granted by the peer.
    credit: Arc<Semaphore>,
    /// Data bytes delivered but not yet consumed by the local reader.
    buffered: Arc<AtomicUsize>,
    /// Trailer bytes received so far.
    trailer_len: usize,
}

struct Shared {
    role: Role,
    config: MuxConfig,
    streams: DashMap<u32, StreamEntry>,
    outbound: mpsc::Sender<Packet>,
    control: mpsc::UnboundedSender<Packet>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

impl Shared {
    fn register(self: &Arc<Self>, id: u32) -> RawStream {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        // Losing the connection aborts every stream on it
        let aborted = self.closed.child_token();
        let credit = Arc::new(Semaphore::new(STREAM_WINDOW));
        let buffered = Arc::new(AtomicUsize::new(0));

        self.streams.insert(
            id,
            StreamEntry {
                inbound: inbound_tx,
                aborted: aborted.clone(),
                credit: Arc::clone(&credit),
                buffered: Arc::clone(&buffered),
                trailer_len: 0,
            },
        );

        let guard = Arc::new(StreamGuard {
            id,
            shared: Arc::downgrade(self),
        });
        let abort = Arc::new(MuxAbort {
            id,
            shared: Arc::downgrade(self),
            control: self.control.clone(),
            aborted: aborted.clone(),
            fired: AtomicBool::new(false),
        });

        RawStream {
            id,
            send: Box::new(MuxSendHalf {
                id,
                shared: Arc::clone(self),
                abort: Arc::clone(&abort),
                credit,
                finished: false,
                _guard: Arc::clone(&guard),
            }),
            recv: Box::new(MuxRecvHalf {
                id,
                inbound: inbound_rx,
                control: self.control.clone(),
                buffered,
                unacked: 0,
                trailer: BytesMut::new(),
                fin: None,
                _guard: guard,
            }),
            abort,
            aborted,
            closed: self.closed.clone(),
        }
    }

    /// Route one inbound packet. Never blocks the reader.
    fn dispatch(self: &Arc<Self>, packet: Packet, incoming: &mpsc::Sender<RawStream>) {
        let id = packet.stream_id;

        match packet.kind {
            PacketKind::Open => {
                if self.role == Role::Client || self.streams.contains_key(&id) {
                    warn!("Rejecting stream {} opened by peer", id);
                    let _ = self.control.send(Packet::control(id, PacketKind::Reset));
                    return;
                }

                let raw = self.register(id);
                if incoming.try_send(raw).is_err() {
                    // Dropping the unfinished stream resets it
                    warn!("Accept backlog full, resetting stream {}", id);
                }
            }
            PacketKind::Data | PacketKind::Trailer | PacketKind::Fin => {
                let Some(mut entry) = self.streams.get_mut(&id) else {
                    trace!("Dropping {:?} for unknown stream {}", packet.kind, id);
                    return;
                };

                let len = packet.payload.len();
                let overrun = if packet.kind == PacketKind::Data {
                    entry.buffered.fetch_add(len, Ordering::AcqRel) + len > STREAM_WINDOW
                } else {
                    entry.trailer_len += len;
                    entry.trailer_len > MAX_TRAILER_SIZE
                };
                if overrun {
                    drop(entry);
                    warn!("Stream {} overran its receive limit, resetting", id);
                    self.reset(id);
                    return;
                }

                let kind = packet.kind;
                let inbound = match kind {
                    PacketKind::Data => Inbound::Data(packet.payload),
                    PacketKind::Trailer => Inbound::TrailerPart(packet.payload),
                    _ => Inbound::Fin(packet.payload),
                };
                if entry.inbound.send(inbound).is_err() && kind == PacketKind::Data {
                    // Nobody reads this direction any more
                    entry.buffered.fetch_sub(len, Ordering::AcqRel);
                    if let Ok(increment) = u32::try_from(len) {
                        let _ = self.control.send(Packet::window_update(id, increment));
                    }
                }
            }
            PacketKind::WindowUpdate => {
                let mut payload = packet.payload;
                if payload.len() != 4 {
                    warn!("Ignoring malformed window update for stream {}", id);
                    return;
                }
                let increment = payload.get_u32() as usize;

                if let Some(entry) = self.streams.get(&id) {
                    if entry.credit.available_permits() + increment > STREAM_WINDOW {
                        warn!("Ignoring window update beyond the window for stream {}", id);
                    } else {
                        entry.credit.add_permits(increment);
                    }
                }
            }
            PacketKind::Reset => {
                if let Some((_, entry)) = self.streams.remove(&id) {
                    debug!("Stream {} reset by peer", id);
                    entry.aborted.cancel();
                }
            }
        }
    }

    /// Abort a stream from this side without going through its handles.
    fn reset(&self, id: u32) {
        if let Some((_, entry)) = self.streams.remove(&id) {
            entry.aborted.cancel();
        }
        let _ = self.control.send(Packet::control(id, PacketKind::Reset));
    }
}

/// Removes the stream entry once both halves are gone.
struct StreamGuard {
    id: u32,
    shared: Weak<Shared>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.streams.remove(&self.id);
        }
    }
}

struct MuxAbort {
    id: u32,
    shared: Weak<Shared>,
    control: mpsc::UnboundedSender<Packet>,
    aborted: CancellationToken,
    fired: AtomicBool,
}

impl Abort for MuxAbort {
    fn abort(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("Aborting stream {}", self.id);
        if let Some(shared) = self.shared.upgrade() {
            shared.streams.remove(&self.id);
        }
        let _ = self
            .control
            .send(Packet::control(self.id, PacketKind::Reset));
        self.aborted.cancel();
    }

    fn is_aborted(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

struct MuxSendHalf {
    id: u32,
    shared: Arc<Shared>,
    abort: Arc<MuxAbort>,
    credit: Arc<Semaphore>,
    finished: bool,
    _guard: Arc<StreamGuard>,
}

impl MuxSendHalf {
    fn closed_error(&self) -> TransportError {
        if self.shared.closed.is_cancelled() {
            TransportError::ConnectionClosed
        } else {
            TransportError::SendClosed(self.id)
        }
    }

    /// Wait until the peer has granted `len` bytes of credit, and spend it.
    async fn reserve(&self, len: usize) -> Result<(), TransportError> {
        let permits = u32::try_from(len).map_err(|_| TransportError::SendClosed(self.id))?;

        tokio::select! {
            biased;
            () = self.abort.aborted.cancelled() => Err(self.closed_error()),
            permit = self.credit.acquire_many(permits) => {
                permit.map_err(|_| self.closed_error())?.forget();
                Ok(())
            }
        }
    }

    async fn push(&self, kind: PacketKind, payload: Bytes) -> Result<(), TransportError> {
        self.shared
            .outbound
            .send(Packet::new(self.id, kind, payload))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl SendHalf for MuxSendHalf {
    async fn send(&mut self, mut data: Bytes) -> Result<(), TransportError> {
        if self.finished || self.abort.aborted.is_cancelled() {
            return Err(self.closed_error());
        }

        // Never ask for more credit than a single update returns
        let max = self
            .shared
            .config
            .max_packet_size
            .min(WINDOW_UPDATE_THRESHOLD)
            .max(1);
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(max));
            self.reserve(chunk.len()).await?;
            self.push(PacketKind::Data, chunk).await?;
        }

        Ok(())
    }

    async fn finish(&mut self, mut trailer: Bytes) -> Result<(), TransportError> {
        if self.finished || self.abort.aborted.is_cancelled() {
            return Err(self.closed_error());
        }
        if trailer.len() > MAX_TRAILER_SIZE {
            return Err(TransportError::TrailerTooLarge {
                size: trailer.len(),
                max: MAX_TRAILER_SIZE,
            });
        }

        let max = self.shared.config.max_packet_size.max(1);
        while trailer.len() > max {
            let part = trailer.split_to(max);
            self.push(PacketKind::Trailer, part).await?;
        }
        self.push(PacketKind::Fin, trailer).await?;
        self.finished = true;

        Ok(())
    }
}

impl Drop for MuxSendHalf {
    fn drop(&mut self) {
        if !self.finished {
            self.abort.abort();
        }
    }
}

struct MuxRecvHalf {
    id: u32,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    control: mpsc::UnboundedSender<Packet>,
    buffered: Arc<AtomicUsize>,
    unacked: usize,
    trailer: BytesMut,
    fin: Option<Bytes>,
    _guard: Arc<StreamGuard>,
}

impl MuxRecvHalf {
    /// Account for data handed to the reader and grant it back in batches.
    fn consumed(&mut self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::AcqRel);
        self.unacked += len;
        if self.unacked < WINDOW_UPDATE_THRESHOLD {
            return;
        }

        let increment = u32::try_from(self.unacked).unwrap_or(u32::MAX);
        self.unacked -= increment as usize;
        let _ = self.control.send(Packet::window_update(self.id, increment));
    }
}

#[async_trait]
impl RecvHalf for MuxRecvHalf {
    async fn recv(&mut self) -> Result<Chunk, TransportError> {
        loop {
            if let Some(trailer) = &self.fin {
                return Ok(Chunk::Fin(trailer.clone()));
            }

            match self.inbound.recv().await {
                Some(Inbound::Data(data)) => {
                    self.consumed(data.len());
                    return Ok(Chunk::Data(data));
                }
                Some(Inbound::TrailerPart(part)) => self.trailer.extend_from_slice(&part),
                Some(Inbound::Fin(last)) => {
                    let trailer = if self.trailer.is_empty() {
                        last
                    } else {
                        self.trailer.extend_from_slice(&last);
                        self.trailer.split().freeze()
                    };
                    self.fin = Some(trailer);
                }
                None => return Err(TransportError::ConnectionClosed),
            }
        }
    }
}

/// Client end of a multiplexed connection.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
}

impl MuxSession {
    /// Start the client end of a session over `io`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn client<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (shared, _incoming) = spawn(io, Role::Client, config);
        Self { shared }
    }

    /// Start the server end of a session over `io`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn server<T>(io: T, config: MuxConfig) -> MuxAcceptor
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (shared, incoming) = spawn(io, Role::Server, config);
        MuxAcceptor { shared, incoming }
    }

    /// Whether the underlying connection is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Number of streams currently open on this connection.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.shared.streams.len()
    }
}

#[async_trait]
impl Connector for MuxSession {
    async fn open(&self) -> Result<RawStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let raw = self.shared.register(id);

        self.shared
            .outbound
            .send(Packet::control(id, PacketKind::Open))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        trace!("Opened stream {}", id);
        Ok(raw)
    }
}

/// Server end of a multiplexed connection.
pub struct MuxAcceptor {
    shared: Arc<Shared>,
    incoming: mpsc::Receiver<RawStream>,
}

impl MuxAcceptor {
    /// Whether the underlying connection is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

#[async_trait]
impl Acceptor for MuxAcceptor {
    async fn accept(&mut self) -> Result<Option<RawStream>, TransportError> {
        Ok(self.incoming.recv().await)
    }
}

/// Create a connected in-process client/server session pair.
///
/// Must be called within a Tokio runtime.
#[must_use]
pub fn pair(config: MuxConfig) -> (MuxSession, MuxAcceptor) {
    let (client_io, server_io) = tokio::io::duplex(config.max_packet_size * 4);
    let client = MuxSession::client(client_io, config.clone());
    let server = MuxSession::server(server_io, config);
    (client, server)
}

fn spawn<T>(io: T, role: Role, config: MuxConfig) -> (Arc<Shared>, mpsc::Receiver<RawStream>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let codec = PacketCodec::new(config.max_packet_size);

    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog);
    let closed = CancellationToken::new();

    let first_id = match role {
        Role::Client => 1,
        Role::Server => 2,
    };

    let shared = Arc::new(Shared {
        role,
        config,
        streams: DashMap::new(),
        outbound: outbound_tx,
        control: control_tx,
        next_id: AtomicU32::new(first_id),
        closed: closed.clone(),
    });

    tokio::spawn(write_loop(
        FramedWrite::new(write_half, codec),
        outbound_rx,
        control_rx,
        closed.clone(),
    ));
    tokio::spawn(read_loop(
        FramedRead::new(read_half, codec),
        Arc::downgrade(&shared),
        incoming_tx,
        closed,
    ));

    (shared, incoming_rx)
}

/// Drains outbound packets to the connection until every sender is gone.
async fn write_loop<T>(
    mut sink: FramedWrite<WriteHalf<T>, PacketCodec>,
    mut outbound: mpsc::Receiver<Packet>,
    mut control: mpsc::UnboundedReceiver<Packet>,
    closed: CancellationToken,
) where
    T: AsyncWrite + Send + 'static,
{
    loop {
        let packet = tokio::select! {
            biased;
            Some(packet) = control.recv() => packet,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            () = closed.cancelled() => break,
        };

        if let Err(e) = sink.send(packet).await {
            warn!("Failed to write packet: {}", e);
            break;
        }
    }

    closed.cancel();
    let _ = sink.close().await;
    debug!("Mux writer stopped");
}

/// Routes inbound packets until the connection or the session goes away.
async fn read_loop<T>(
    mut stream: FramedRead<ReadHalf<T>, PacketCodec>,
    shared: Weak<Shared>,
    incoming: mpsc::Sender<RawStream>,
    closed: CancellationToken,
) where
    T: AsyncRead + Send + 'static,
{
    loop {
        let packet = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            packet = stream.next() => packet,
        };

        let packet = match packet {
            Some(Ok(packet)) => packet,
            Some(Err(e)) => {
                warn!("Failed to read packet: {}", e);
                break;
            }
            None => {
                debug!("Connection closed by peer");
                break;
            }
        };

        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.dispatch(packet, &incoming);
    }

    // Fires the abort token of every stream on the connection
    closed.cancel();
    if let Some(shared) = shared.upgrade() {
        // Pending receivers observe the closed connection
        shared.streams.clear();
    }
    debug!("Mux reader stopped");
}
