//! Service registry.
//!
//! Maps method identifiers to handlers. The registry is assembled once with
//! a [`ServiceRegistryBuilder`] and is immutable afterwards, so the server
//! reads it from every call without synchronization.

use crate::call::{CallReceiver, CallSender, CallStream};
use crate::error::{Error, Result};
use crate::protocol::{Codec, StreamingShape, validate_method_id};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Handles calls to one method.
///
/// The handler owns the call stream and drives the method's message
/// sequence. Returning `Ok` completes the call; an error is reported to the
/// client as the call's terminal status.
#[async_trait]
pub trait Handler<C: Codec>: Send + Sync + 'static {
    /// Handle one call.
    async fn call(&self, call: CallStream<C>) -> Result<()>;
}

#[async_trait]
impl<C, F, Fut> Handler<C> for F
where
    C: Codec,
    F: Fn(CallStream<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, call: CallStream<C>) -> Result<()> {
        (self)(call).await
    }
}

/// Sequence of messages a method sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLayout {
    /// Exactly one response message.
    Single,
    /// One header message, then zero or more rows of a second type.
    HeaderThenRows,
    /// A handler-defined sequence.
    Stream,
}

/// Registered method.
pub struct MethodDescriptor<C: Codec> {
    id: String,
    shape: StreamingShape,
    layout: ResponseLayout,
    handler: Arc<dyn Handler<C>>,
}

impl<C: Codec> MethodDescriptor<C> {
    /// Method identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared streaming shape.
    #[must_use]
    pub const fn shape(&self) -> StreamingShape {
        self.shape
    }

    /// Declared response sequence.
    #[must_use]
    pub const fn layout(&self) -> ResponseLayout {
        self.layout
    }

    pub(crate) fn handler(&self) -> Arc<dyn Handler<C>> {
        Arc::clone(&self.handler)
    }
}

impl<C: Codec> fmt::Debug for MethodDescriptor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Immutable map from method identifier to handler.
pub struct ServiceRegistry<C: Codec> {
    methods: HashMap<String, MethodDescriptor<C>>,
}

impl<C: Codec> ServiceRegistry<C> {
    /// Create a new registry builder.
    #[must_use]
    pub fn builder() -> ServiceRegistryBuilder<C> {
        ServiceRegistryBuilder {
            methods: HashMap::new(),
        }
    }

    /// Find the descriptor for `method`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no handler is registered.
    pub fn lookup(&self, method: &str) -> Result<&MethodDescriptor<C>> {
        self.methods
            .get(method)
            .ok_or_else(|| Error::NotFound(method.to_string()))
    }

    /// All registered methods, sorted by identifier.
    #[must_use]
    pub fn methods(&self) -> Vec<&MethodDescriptor<C>> {
        let mut methods: Vec<_> = self.methods.values().collect();
        methods.sort_by(|a, b| a.id.cmp(&b.id));
        methods
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no method is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<C: Codec> fmt::Debug for ServiceRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.methods()).finish()
    }
}

/// Builder for a [`ServiceRegistry`].
pub struct ServiceRegistryBuilder<C: Codec> {
    methods: HashMap<String, MethodDescriptor<C>>,
}

impl<C: Codec> ServiceRegistryBuilder<C> {
    /// Register a handler that drives the call stream itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMethod`] if `method` is not of the form
    /// `/<Service>/<Method>`, and [`Error::DuplicateMethod`] if it is
    /// already registered.
    pub fn register<H: Handler<C>>(
        &mut self,
        method: &str,
        shape: StreamingShape,
        handler: H,
    ) -> Result<&mut Self> {
        let layout = if shape.server_streams() {
            ResponseLayout::Stream
        } else {
            ResponseLayout::Single
        };
        self.insert(method, shape, layout, Arc::new(handler))
    }

    /// Register a unary method: one request in, one response out.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn unary<Req, Resp, F, Fut>(&mut self, method: &str, handler: F) -> Result<&mut Self>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            StreamingShape::Unary,
            ResponseLayout::Single,
            Arc::new(move |mut call: CallStream<C>| {
                let handler = Arc::clone(&handler);
                async move {
                    let request: Req = call.recv().await?;
                    call.expect_end().await?;
                    let response = handler(request).await?;
                    call.send(&response).await
                }
            }),
        )
    }

    /// Register a server-streaming method answering with one header and then
    /// rows.
    ///
    /// The handler gets the request and a [`HeaderRowSink`]; returning
    /// without having sent the header fails the call.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn server_streaming<Req, H, R, F, Fut>(
        &mut self,
        method: &str,
        handler: F,
    ) -> Result<&mut Self>
    where
        Req: DeserializeOwned + Send + 'static,
        H: Serialize + Send + Sync + 'static,
        R: Serialize + Send + Sync + 'static,
        F: Fn(Req, HeaderRowSink<C, H, R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            StreamingShape::ServerStreaming,
            ResponseLayout::HeaderThenRows,
            Arc::new(move |mut call: CallStream<C>| {
                let handler = Arc::clone(&handler);
                async move {
                    let request: Req = call.recv().await?;
                    call.expect_end().await?;

                    let (sender, _receiver) = call.split();
                    let sink = HeaderRowSink::new(sender);
                    let progress = Arc::clone(&sink.progress);
                    handler(request, sink).await?;

                    if !progress.header_sent.load(Ordering::Acquire) {
                        return Err(Error::Protocol(
                            "handler finished without sending a header".to_string(),
                        ));
                    }
                    debug!("Streamed {} rows", progress.rows.load(Ordering::Acquire));
                    Ok(())
                }
            }),
        )
    }

    /// Register a client-streaming method: many requests in, one response
    /// out.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn client_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &str,
        handler: F,
    ) -> Result<&mut Self>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(RequestStream<C, Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            StreamingShape::ClientStreaming,
            ResponseLayout::Single,
            Arc::new(move |call: CallStream<C>| {
                let handler = Arc::clone(&handler);
                async move {
                    let (mut sender, receiver) = call.split();
                    let response = handler(RequestStream::new(receiver)).await?;
                    sender.send(&response).await
                }
            }),
        )
    }

    /// Register a bidirectional method. The handler drives the stream.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn bidirectional<H: Handler<C>>(&mut self, method: &str, handler: H) -> Result<&mut Self> {
        self.register(method, StreamingShape::Bidirectional, handler)
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(&mut self) -> Arc<ServiceRegistry<C>> {
        Arc::new(ServiceRegistry {
            methods: std::mem::take(&mut self.methods),
        })
    }

    fn insert(
        &mut self,
        method: &str,
        shape: StreamingShape,
        layout: ResponseLayout,
        handler: Arc<dyn Handler<C>>,
    ) -> Result<&mut Self> {
        validate_method_id(method)?;
        if self.methods.contains_key(method) {
            return Err(Error::DuplicateMethod(method.to_string()));
        }

        debug!("Registered {} ({})", method, shape);
        self.methods.insert(
            method.to_string(),
            MethodDescriptor {
                id: method.to_string(),
                shape,
                layout,
                handler,
            },
        );
        Ok(self)
    }
}

/// Response writer of a header-then-rows method.
///
/// Exactly one header of type `H` must be sent before any row of type `R`.
pub struct HeaderRowSink<C: Codec, H, R> {
    sender: CallSender<C>,
    progress: Arc<SinkProgress>,
    _marker: PhantomData<fn(&H, &R)>,
}

#[derive(Default)]
struct SinkProgress {
    header_sent: AtomicBool,
    rows: AtomicUsize,
}

impl<C: Codec, H: Serialize, R: Serialize> HeaderRowSink<C, H, R> {
    fn new(sender: CallSender<C>) -> Self {
        Self {
            sender,
            progress: Arc::default(),
            _marker: PhantomData,
        }
    }

    /// Send the header.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Protocol`] if the header was already sent, and
    /// with the errors of [`CallSender::send`].
    pub async fn send_header(&mut self, header: &H) -> Result<()> {
        if self.progress.header_sent.load(Ordering::Acquire) {
            return Err(Error::Protocol("header already sent".to_string()));
        }
        self.sender.send(header).await?;
        self.progress.header_sent.store(true, Ordering::Release);
        Ok(())
    }

    /// Send one row.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Protocol`] if no header was sent yet, and with the
    /// errors of [`CallSender::send`].
    pub async fn send_row(&mut self, row: &R) -> Result<()> {
        if !self.progress.header_sent.load(Ordering::Acquire) {
            return Err(Error::Protocol("row sent before the header".to_string()));
        }
        self.sender.send(row).await?;
        self.progress.rows.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Number of rows sent so far.
    #[must_use]
    pub fn rows_sent(&self) -> usize {
        self.progress.rows.load(Ordering::Acquire)
    }

    /// Resolves once the call is cancelled, aborted or out of time.
    pub fn cancelled(&self) -> impl Future<Output = Error> + Send + 'static {
        self.sender.cancelled()
    }
}

/// Typed request reader of a client-streaming method.
pub struct RequestStream<C: Codec, Req> {
    receiver: CallReceiver<C>,
    _marker: PhantomData<fn() -> Req>,
}

impl<C: Codec, Req: DeserializeOwned> RequestStream<C, Req> {
    const fn new(receiver: CallReceiver<C>) -> Self {
        Self {
            receiver,
            _marker: PhantomData,
        }
    }

    /// Next request, or `None` once the client closed its side.
    ///
    /// # Errors
    ///
    /// See [`CallReceiver::recv`].
    pub async fn next(&mut self) -> Result<Option<Req>> {
        match self.receiver.recv().await {
            Ok(request) => Ok(Some(request)),
            Err(e) if e.is_end_of_stream() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Number of requests received so far.
    #[must_use]
    pub const fn received(&self) -> usize {
        self.receiver.received()
    }

    /// Resolves once the call is cancelled, aborted or out of time.
    pub fn cancelled(&self) -> impl Future<Output = Error> + Send + 'static {
        self.receiver.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonCodec;

    async fn noop(_call: CallStream<JsonCodec>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ServiceRegistry::<JsonCodec>::builder()
            .register("/Demo/Raw", StreamingShape::Bidirectional, noop)
            .unwrap()
            .unary("/Demo/Echo", |s: String| async move { Ok::<_, Error>(s) })
            .unwrap()
            .build();

        assert_eq!(registry.len(), 2);
        let echo = registry.lookup("/Demo/Echo").unwrap();
        assert_eq!(echo.shape(), StreamingShape::Unary);
        assert_eq!(echo.layout(), ResponseLayout::Single);
        assert_eq!(
            registry.lookup("/Demo/Raw").unwrap().layout(),
            ResponseLayout::Stream
        );
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        let registry = ServiceRegistry::<JsonCodec>::builder()
            .register("/Demo/Stream", StreamingShape::ServerStreaming, noop)
            .unwrap()
            .build();

        assert!(matches!(
            registry.lookup("/demo/stream"),
            Err(Error::NotFound(ref m)) if m == "/demo/stream"
        ));
        assert!(matches!(registry.lookup("/Foo/Bar"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut builder = ServiceRegistry::<JsonCodec>::builder();
        builder
            .register("/Demo/Stream", StreamingShape::ServerStreaming, noop)
            .unwrap();

        let err = builder
            .register("/Demo/Stream", StreamingShape::Unary, noop)
            .err()
            .unwrap();
        assert!(matches!(err, Error::DuplicateMethod(ref m) if m == "/Demo/Stream"));

        // The first registration is untouched
        let registry = builder.build();
        assert_eq!(
            registry.lookup("/Demo/Stream").unwrap().shape(),
            StreamingShape::ServerStreaming
        );
    }

    #[test]
    fn test_invalid_method_rejected() {
        let mut builder = ServiceRegistry::<JsonCodec>::builder();
        assert!(matches!(
            builder.register("Demo.Stream", StreamingShape::Unary, noop),
            Err(Error::InvalidMethod(_))
        ));
        assert!(builder.build().is_empty());
    }

    #[test]
    fn test_methods_are_sorted() {
        let registry = ServiceRegistry::<JsonCodec>::builder()
            .register("/B/Two", StreamingShape::Unary, noop)
            .unwrap()
            .register("/A/One", StreamingShape::Unary, noop)
            .unwrap()
            .register("/B/One", StreamingShape::Unary, noop)
            .unwrap()
            .build();

        let ids: Vec<_> = registry.methods().iter().map(|m| m.id().to_string()).collect();
        assert_eq!(ids, ["/A/One", "/B/One", "/B/Two"]);
    }
}
