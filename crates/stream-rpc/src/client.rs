//! RPC client implementation.

use crate::call::{CallInfo, CallStream, Role};
use crate::error::{Error, Result, TransportError};
use crate::protocol::framing::DEFAULT_MAX_FRAME_SIZE;
use crate::protocol::{CallHeader, Codec, FrameCodec, StreamingShape};
use crate::stream::FrameStream;
use crate::transport::{Abort, Connector, MuxConfig, MuxSession};

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, instrument};

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for calls that do not set their own.
    pub default_timeout: Option<Duration>,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
    /// Maximum payload frame size, for frames sent and accepted alike.
    /// The call header is not subject to it.
    pub max_frame_size: usize,
    /// Multiplexer settings for the connection.
    pub mux: MuxConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            mux: MuxConfig::default(),
        }
    }
}

/// Call-scoped options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline for the whole call, overriding the client default.
    pub timeout: Option<Duration>,
    /// Token that cancels the call when fired.
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    /// Create options that use the client defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the call deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancel the call when `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Builder for creating RPC clients.
pub struct ClientBuilder<C: Codec> {
    addr: Option<SocketAddr>,
    codec: C,
    config: ClientConfig,
}

impl<C: Codec> ClientBuilder<C> {
    /// Set the server address to connect to.
    #[must_use]
    pub const fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Set the payload codec.
    #[must_use]
    pub fn codec(mut self, codec: C) -> Self {
        self.codec = codec;
        self
    }

    /// Set the default call timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the multiplexer configuration.
    #[must_use]
    pub fn mux_config(mut self, mux: MuxConfig) -> Self {
        self.config.mux = mux;
        self
    }

    /// Connect to the server over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if no address was set or the connection fails.
    #[instrument(skip(self), fields(addr = ?self.addr))]
    pub async fn connect(self) -> Result<RpcClient<C>> {
        let addr = self.addr.ok_or_else(|| {
            Error::from(io::Error::new(
                io::ErrorKind::InvalidInput,
                "server address not specified",
            ))
        })?;

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectFailed {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| TransportError::ConnectFailed { addr, source })?;
        stream.set_nodelay(true)?;

        debug!("Connected to {}", addr);
        let session = MuxSession::client(stream, self.config.mux.clone());
        Ok(RpcClient::new(session, self.codec, self.config))
    }
}

/// RPC client for making calls.
pub struct RpcClient<C: Codec> {
    connector: Arc<dyn Connector>,
    codec: C,
    config: ClientConfig,
}

impl<C: Codec> Clone for RpcClient<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            codec: self.codec.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C: Codec> fmt::Debug for RpcClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("codec", &self.codec.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: Codec + Default> RpcClient<C> {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder<C> {
        ClientBuilder {
            addr: None,
            codec: C::default(),
            config: ClientConfig::default(),
        }
    }
}

impl<C: Codec> RpcClient<C> {
    /// Create a client over any transport.
    pub fn new(connector: impl Connector, codec: C, config: ClientConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            codec,
            config,
        }
    }

    /// Codec used for payloads.
    #[must_use]
    pub const fn codec(&self) -> &C {
        &self.codec
    }

    /// Open a call and send its header.
    ///
    /// The returned stream is driven by the caller; the typed helpers below
    /// cover the common shapes.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    #[instrument(skip(self, options), fields(codec = self.codec.name()))]
    pub async fn open(
        &self,
        method: &str,
        shape: StreamingShape,
        options: CallOptions,
    ) -> Result<CallStream<C>> {
        let deadline = options.timeout.or(self.config.default_timeout);

        let raw = self
            .connector
            .open()
            .await
            .map_err(|e| Error::from(e).in_call(method))?;
        let watch = options
            .cancellation
            .as_ref()
            .map(|token| watch_cancellation(token.clone(), Arc::clone(&raw.abort), raw.aborted.clone()));
        let cancel = options.cancellation.unwrap_or_default();
        let frames = FrameStream::new(
            raw,
            FrameCodec::new().with_max_frame_size(self.config.max_frame_size),
            cancel,
        )
        .with_timeout(deadline);
        let id = frames.id();
        let (mut writer, reader) = frames.split();

        let header = CallHeader {
            method: method.to_string(),
            codec: self.codec.name().to_string(),
            shape,
            timeout_ms: deadline.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        };
        writer
            .send_control(header.to_bytes()?)
            .await
            .map_err(|e| e.in_call(method))?;

        debug!("Opened stream {}", id);
        Ok(CallStream::new(
            CallInfo {
                method: method.to_string(),
                shape,
                role: Role::Client,
                id,
                watch,
            },
            self.codec.clone(),
            Arc::new(Mutex::new(writer)),
            reader,
        ))
    }

    /// Make a unary call.
    ///
    /// # Errors
    ///
    /// Returns the call's failure, carrying the method identifier.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut call = self.open(method, StreamingShape::Unary, options).await?;
        call.send(request).await?;
        call.close().await?;

        let response = call.recv().await.map_err(|e| missing(e, method, "response"))?;
        call.expect_end().await?;
        Ok(response)
    }

    /// Make a server-streaming call answered with one header and then rows.
    ///
    /// Returns the header and a stream of the rows.
    ///
    /// # Errors
    ///
    /// Returns the call's failure, carrying the method identifier.
    pub async fn server_streaming<Req, H, R>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<(H, RowStream<C, R>)>
    where
        Req: Serialize + ?Sized,
        H: DeserializeOwned,
        R: DeserializeOwned,
    {
        let mut call = self
            .open(method, StreamingShape::ServerStreaming, options)
            .await?;
        call.send(request).await?;
        call.close().await?;

        let header = call.recv().await.map_err(|e| missing(e, method, "header"))?;
        Ok((
            header,
            RowStream {
                call,
                _marker: PhantomData,
            },
        ))
    }

    /// Start a client-streaming call.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be opened.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<ClientStreamingCall<C, Req, Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let call = self
            .open(method, StreamingShape::ClientStreaming, options)
            .await?;
        Ok(ClientStreamingCall {
            call,
            _marker: PhantomData,
        })
    }

    /// Start a bidirectional call.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be opened.
    pub async fn bidirectional(&self, method: &str, options: CallOptions) -> Result<CallStream<C>> {
        self.open(method, StreamingShape::Bidirectional, options).await
    }
}

/// Abort the stream when `token` fires, so the server stops even while the
/// caller is not blocked on the call.
fn watch_cancellation(
    token: CancellationToken,
    abort: Arc<dyn Abort>,
    aborted: CancellationToken,
) -> DropGuard {
    let done = CancellationToken::new();
    let guard = done.clone().drop_guard();

    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => abort.abort(),
            () = aborted.cancelled() => {}
            () = done.cancelled() => {}
        }
    });

    guard
}

/// A successful end of stream where a message was required is a protocol
/// violation.
fn missing(err: Error, method: &str, what: &str) -> Error {
    if err.is_end_of_stream() {
        Error::Protocol(format!("stream ended before the {what}")).in_call(method)
    } else {
        err
    }
}

/// Rows of a header-then-rows call.
pub struct RowStream<C: Codec, R> {
    call: CallStream<C>,
    _marker: PhantomData<fn() -> R>,
}

impl<C: Codec, R> fmt::Debug for RowStream<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

impl<C: Codec, R: DeserializeOwned> RowStream<C, R> {
    /// Receive the next row.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::EndOfStream`] once the server finished successfully,
    /// and keeps failing that way on every later call. Any other error is a
    /// failure of the call.
    pub async fn next_row(&mut self) -> Result<R> {
        self.call.recv().await
    }

    /// Receive the next row, or `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns the call's failure.
    pub async fn try_next(&mut self) -> Result<Option<R>> {
        match self.call.recv().await {
            Ok(row) => Ok(Some(row)),
            Err(e) if e.is_end_of_stream() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Adapt into a [`Stream`] that ends after the last row or the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<R>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut rows = state?;
            match rows.try_next().await {
                Ok(Some(row)) => Some((Ok(row), Some(rows))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Abort the call.
    pub fn cancel(&self) {
        self.call.cancel();
    }

    /// Method identifier of the call.
    #[must_use]
    pub fn method(&self) -> &str {
        self.call.method()
    }
}

/// An in-progress client-streaming call.
pub struct ClientStreamingCall<C: Codec, Req, Resp> {
    call: CallStream<C>,
    _marker: PhantomData<fn(&Req) -> Resp>,
}

impl<C: Codec, Req, Resp> fmt::Debug for ClientStreamingCall<C, Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStreamingCall")
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

impl<C: Codec, Req: Serialize, Resp: DeserializeOwned> ClientStreamingCall<C, Req, Resp> {
    /// Send one request.
    ///
    /// # Errors
    ///
    /// Returns the call's failure.
    pub async fn send(&mut self, request: &Req) -> Result<()> {
        self.call.send(request).await
    }

    /// Close the request stream and wait for the response.
    ///
    /// # Errors
    ///
    /// Returns the call's failure.
    pub async fn finish(mut self) -> Result<Resp> {
        self.call.close().await?;
        let method = self.call.method().to_string();
        let response = self
            .call
            .recv()
            .await
            .map_err(|e| missing(e, &method, "response"))?;
        self.call.expect_end().await?;
        Ok(response)
    }

    /// Abort the call.
    pub fn cancel(&self) {
        self.call.cancel();
    }
}
