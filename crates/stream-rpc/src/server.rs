//! RPC server implementation.

use crate::call::{CallInfo, CallStream, Role};
use crate::error::{Error, Result, TransportError};
use crate::protocol::{CallHeader, Codec, FrameCodec, Status, StatusCode};
use crate::protocol::framing::DEFAULT_MAX_FRAME_SIZE;
use crate::registry::{MethodDescriptor, ServiceRegistry};
use crate::stream::{FrameStream, FrameWriter};
use crate::transport::{Acceptor, MuxConfig, MuxSession, RawStream};

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum frame size accepted from clients.
    pub max_frame_size: usize,
    /// How long to wait for the call header of a new stream.
    pub handshake_timeout: Duration,
    /// Upper bound for every call, applied on top of the client deadline.
    pub call_timeout: Option<Duration>,
    /// Multiplexer settings for each connection.
    pub mux: MuxConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(10),
            call_timeout: None,
            mux: MuxConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the server-side call deadline.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Lifecycle of a call on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Waiting for the call header.
    AwaitingMethod,
    /// Header read, resolving the handler.
    Dispatched,
    /// Handler running.
    Running,
    /// Handler returned successfully.
    Completed,
    /// The call ended with a failure status.
    Failed,
    /// The call was aborted by the client, the deadline or shutdown.
    Cancelled,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Inner<C: Codec> {
    registry: Arc<ServiceRegistry<C>>,
    codec: C,
    config: ServerConfig,
    shutdown: CancellationToken,
}

/// RPC server dispatching calls to a [`ServiceRegistry`].
pub struct RpcServer<C: Codec> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Clone for RpcServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> RpcServer<C> {
    /// Create a new RPC server.
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry<C>>, codec: C, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                codec,
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Token that stops the server when cancelled.
    ///
    /// In-flight calls end with an `UNAVAILABLE` status.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Stop accepting connections and end in-flight calls.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Registry the server dispatches to.
    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry<C> {
        &self.inner.registry
    }

    /// Accept TCP connections until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's address cannot be read.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("RPC server listening on {}", listener.local_addr()?);

        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_connections));

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                warn!("Max connections reached, rejecting connection from {}", addr);
                                continue;
                            };

                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let server = self.clone();
                            tokio::spawn(
                                async move {
                                    debug!("New connection");
                                    server.serve_connection(stream).await;
                                    debug!("Connection closed");
                                    drop(permit);
                                }
                                .instrument(info_span!("connection", %addr)),
                            );
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                () = self.inner.shutdown.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Serve calls arriving on one connection until it closes.
    pub async fn serve_connection<T>(&self, io: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let acceptor = MuxSession::server(io, self.inner.config.mux.clone());
        if let Err(e) = self.serve_acceptor(acceptor).await {
            warn!("Connection failed: {}", e);
        }
    }

    /// Serve calls from any transport until it runs dry or the server
    /// shuts down. Waits for in-flight calls before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting a call stream fails.
    pub async fn serve_acceptor<A: Acceptor>(&self, mut acceptor: A) -> Result<()> {
        let shutdown = self.inner.shutdown.clone();
        let mut calls = JoinSet::new();

        let result = loop {
            let raw = tokio::select! {
                biased;
                () = shutdown.cancelled() => break Ok(()),
                Some(_) = calls.join_next(), if !calls.is_empty() => continue,
                raw = acceptor.accept() => raw,
            };

            match raw {
                Ok(Some(raw)) => {
                    let inner = Arc::clone(&self.inner);
                    let span = info_span!("call", stream = raw.id);
                    calls.spawn(inner.handle_call(raw).instrument(span));
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };

        while calls.join_next().await.is_some() {}
        result
    }
}

enum Outcome {
    Completed,
    Failed(Status),
    Aborted,
    Shutdown,
    DeadlineExceeded(Duration),
}

impl<C: Codec> Inner<C> {
    fn call_deadline(&self, header: &CallHeader) -> Option<Duration> {
        match (header.timeout(), self.config.call_timeout) {
            (Some(client), Some(server)) => Some(client.min(server)),
            (client, server) => client.or(server),
        }
    }

    async fn handle_call(self: Arc<Self>, raw: RawStream) {
        let aborted = raw.aborted.clone();
        let frames = FrameStream::new(
            raw,
            FrameCodec::new().with_max_frame_size(self.config.max_frame_size),
            self.shutdown.child_token(),
        );
        let id = frames.id();
        let (writer, mut reader) = frames.split();
        let writer = Arc::new(Mutex::new(writer));

        let mut state = CallState::AwaitingMethod;
        debug!("Call {}", state);

        let header = match timeout(self.config.handshake_timeout, reader.receive_message()).await {
            Ok(Ok(frame)) => CallHeader::from_bytes(&frame),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(self.config.handshake_timeout)),
        };
        let header = match header {
            Ok(header) => header,
            Err(e) if e.is_cancellation() => {
                debug!("Call abandoned before its header: {}", e);
                writer.lock().await.abort();
                return;
            }
            Err(e) => {
                warn!("Rejecting call with bad header: {}", e);
                let status = Status::invalid_argument(format!("bad call header: {e}"));
                finish(&writer, &status).await;
                return;
            }
        };

        state = CallState::Dispatched;
        debug!(method = %header.method, "Call {}", state);

        let handler = match self.check(&header) {
            Ok(descriptor) => descriptor.handler(),
            Err(status) => {
                info!(method = %header.method, "Rejecting call: {}", status);
                finish(&writer, &status).await;
                return;
            }
        };

        let deadline = self.call_deadline(&header);
        reader.set_timeout(deadline);
        writer.lock().await.set_timeout(deadline);

        let call = CallStream::new(
            CallInfo {
                method: header.method.clone(),
                shape: header.shape,
                role: Role::Server,
                id,
                watch: None,
            },
            self.codec.clone(),
            Arc::clone(&writer),
            reader,
        );

        state = CallState::Running;
        debug!(method = %header.method, "Call {}", state);

        let expired = async {
            match deadline {
                Some(d) => {
                    tokio::time::sleep(d).await;
                    d
                }
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Outcome::Shutdown,
            () = aborted.cancelled() => Outcome::Aborted,
            d = expired => Outcome::DeadlineExceeded(d),
            result = AssertUnwindSafe(handler.call(call)).catch_unwind() => match result {
                Ok(Ok(())) => Outcome::Completed,
                Ok(Err(e)) if aborted.is_cancelled() => {
                    debug!("Handler observed the abort: {}", e);
                    Outcome::Aborted
                }
                Ok(Err(e)) => Outcome::Failed(Status::from(&e)),
                Err(panic) => Outcome::Failed(Status::internal(format!(
                    "handler panicked: {}",
                    panic_message(&*panic)
                ))),
            },
        };

        match outcome {
            Outcome::Completed => {
                state = CallState::Completed;
                finish(&writer, &Status::ok()).await;
            }
            Outcome::Failed(status) => {
                state = if status.code == StatusCode::Cancelled {
                    CallState::Cancelled
                } else {
                    CallState::Failed
                };
                warn!(method = %header.method, "Call failed: {}", status);
                finish(&writer, &status).await;
            }
            Outcome::DeadlineExceeded(d) => {
                state = CallState::Cancelled;
                let status = Status::new(
                    StatusCode::DeadlineExceeded,
                    format!("deadline of {d:?} exceeded"),
                );
                finish(&writer, &status).await;
            }
            Outcome::Shutdown => {
                state = CallState::Cancelled;
                finish(&writer, &Status::new(StatusCode::Unavailable, "server shutting down"))
                    .await;
            }
            Outcome::Aborted => {
                state = CallState::Cancelled;
            }
        }

        debug!(method = %header.method, "Call {}", state);
    }

    /// Validate the header against the registry.
    fn check(&self, header: &CallHeader) -> std::result::Result<&MethodDescriptor<C>, Status> {
        let descriptor = self
            .registry
            .lookup(&header.method)
            .map_err(|e| Status::from(&e))?;

        if header.codec != self.codec.name() {
            return Err(Status::new(
                StatusCode::Unimplemented,
                format!(
                    "codec {:?} not supported, server speaks {:?}",
                    header.codec,
                    self.codec.name()
                ),
            ));
        }

        if header.shape != descriptor.shape() {
            return Err(Status::invalid_argument(format!(
                "{} is {}, called as {}",
                header.method,
                descriptor.shape(),
                header.shape
            )));
        }

        Ok(descriptor)
    }
}

/// Half-close the call with its terminal status.
///
/// A status too large for the transport is delivered truncated.
async fn finish(writer: &Mutex<FrameWriter>, status: &Status) {
    let mut writer = writer.lock().await;
    let mut result = writer.close_send(status.to_trailer()).await;
    if let Err(Error::Transport(TransportError::TrailerTooLarge { size, max })) = &result {
        warn!("Status trailer of {} bytes exceeds {}, truncating", size, max);
        let truncated = status.clone().truncated(*max);
        result = writer.close_send(truncated.to_trailer()).await;
    }

    if let Err(e) = result {
        debug!("Could not deliver status {}: {}", status.code, e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
