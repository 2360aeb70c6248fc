//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use proven_stream_rpc::transport::mux;
use proven_stream_rpc::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long a released handler may take to notice.
pub const BOUND: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub i: u32,
}

/// `/Demo/Stream`: one summary, then `limit` rows.
pub async fn demo_stream<C: Codec>(
    query: Query,
    mut sink: HeaderRowSink<C, Summary, Row>,
) -> Result<()> {
    sink.send_header(&Summary { count: query.limit }).await?;
    for i in 0..query.limit {
        sink.send_row(&Row { i }).await?;
    }
    Ok(())
}

/// `/Demo/Sum`: adds up every request.
pub async fn demo_sum<C: Codec>(mut requests: RequestStream<C, i64>) -> Result<i64> {
    let mut total = 0;
    while let Some(n) = requests.next().await? {
        total += n;
    }
    Ok(total)
}

/// `/Demo/Upper`: answers every message with its upper-case form.
pub async fn demo_upper<C: Codec>(mut call: CallStream<C>) -> Result<()> {
    loop {
        match call.recv::<String>().await {
            Ok(text) => call.send(&text.to_uppercase()).await?,
            Err(e) if e.is_end_of_stream() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

pub async fn demo_echo(text: String) -> Result<String> {
    Ok(text)
}

/// Registry with the demo methods, counting handler invocations.
pub fn demo_registry<C: Codec>(invocations: &Arc<AtomicUsize>) -> ServiceRegistryBuilder<C> {
    let mut builder = ServiceRegistry::builder();

    let counter = Arc::clone(invocations);
    builder
        .server_streaming("/Demo/Stream", move |query: Query, sink| {
            counter.fetch_add(1, Ordering::SeqCst);
            demo_stream::<C>(query, sink)
        })
        .unwrap();

    let counter = Arc::clone(invocations);
    builder
        .unary("/Demo/Echo", move |text: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            demo_echo(text)
        })
        .unwrap()
        .client_streaming("/Demo/Sum", demo_sum::<C>)
        .unwrap()
        .bidirectional("/Demo/Upper", demo_upper::<C>)
        .unwrap();

    builder
}

/// Handed to handlers; every call takes a token that lives as long as the
/// handler future does.
#[derive(Clone)]
pub struct Liveness {
    calls: mpsc::UnboundedSender<oneshot::Receiver<()>>,
}

impl Liveness {
    /// Register a starting call. Hold the token for the life of the handler.
    pub fn enter(&self) -> oneshot::Sender<()> {
        let (token, released) = oneshot::channel();
        let _ = self.calls.send(released);
        token
    }
}

/// Test side of [`Liveness`].
pub struct Calls {
    started: mpsc::UnboundedReceiver<oneshot::Receiver<()>>,
}

impl Calls {
    /// Wait for the next handler to start.
    pub async fn started(&mut self) -> CallLife {
        let released = timeout(BOUND, self.started.recv())
            .await
            .expect("handler should start within the bound")
            .expect("registry dropped");
        CallLife { released }
    }
}

/// Lifetime of one handler invocation.
pub struct CallLife {
    released: oneshot::Receiver<()>,
}

impl CallLife {
    /// Wait for the handler future to be dropped.
    pub async fn released(self) {
        // The token is never sent, so the receiver resolves only on drop
        let _ = timeout(BOUND, self.released)
            .await
            .expect("handler should be released within the bound");
    }
}

pub fn liveness() -> (Liveness, Calls) {
    let (calls, started) = mpsc::unbounded_channel();
    (Liveness { calls }, Calls { started })
}

/// A server and a client talking over an in-process connection.
pub struct Harness<C: Codec> {
    pub server: RpcServer<C>,
    pub client: RpcClient<C>,
    pub session: MuxSession,
    pub serving: JoinHandle<Result<()>>,
}

impl<C: Codec> Harness<C> {
    pub fn start(registry: Arc<ServiceRegistry<C>>, codec: C, config: ServerConfig) -> Self {
        Self::start_with(registry, codec, config, ClientConfig::default())
    }

    pub fn start_with(
        registry: Arc<ServiceRegistry<C>>,
        codec: C,
        config: ServerConfig,
        client_config: ClientConfig,
    ) -> Self {
        init_tracing();

        let (session, acceptor) = mux::pair(config.mux.clone());
        let server = RpcServer::new(registry, codec.clone(), config);
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve_acceptor(acceptor).await }
        });
        let client = RpcClient::new(session.clone(), codec, client_config);

        Self {
            server,
            client,
            session,
            serving,
        }
    }

    /// A client using another codec on the same connection.
    pub fn client_with<D: Codec>(&self, codec: D) -> RpcClient<D> {
        RpcClient::new(self.session.clone(), codec, ClientConfig::default())
    }
}
