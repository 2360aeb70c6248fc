//! Streaming RPC runtime with pluggable payload codecs.
//!
//! This crate separates how calls are carried from how messages are encoded.
//! Any [`Codec`] can be plugged into the same multiplexed transport, and a
//! single call stream may carry messages of different types, such as a
//! header summarizing a result set followed by its rows.
//!
//! # Features
//!
//! - **Pluggable codecs**: JSON, CBOR and bincode out of the box
//! - **Length-prefixed framing**: `[u32 BE length][payload]` with a size bound
//! - **All streaming shapes**: unary, server-, client- and bidirectional
//! - **Multiplexing**: many concurrent calls over one connection
//! - **Cancellation**: deadlines and tokens unblock pending sends and receives
//!
//! # Example
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use proven_stream_rpc::{
//!     CallOptions, CborCodec, HeaderRowSink, RpcClient, RpcServer, ServerConfig,
//!     ServiceRegistry,
//! };
//!
//! #[derive(Serialize, Deserialize)]
//! struct Query {
//!     limit: u32,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct Summary {
//!     count: u32,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct Row {
//!     i: u32,
//! }
//!
//! async fn stream(
//!     query: Query,
//!     mut sink: HeaderRowSink<CborCodec, Summary, Row>,
//! ) -> proven_stream_rpc::Result<()> {
//!     sink.send_header(&Summary { count: query.limit }).await?;
//!     for i in 0..query.limit {
//!         sink.send_row(&Row { i }).await?;
//!     }
//!     Ok(())
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ServiceRegistry::builder()
//!         .server_streaming("/Demo/Stream", stream)?
//!         .build();
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!     let server = RpcServer::new(registry, CborCodec, ServerConfig::default());
//!     tokio::spawn(async move { server.serve(listener).await });
//!
//!     let client = RpcClient::<CborCodec>::builder().addr(addr).connect().await?;
//!     let (summary, mut rows) = client
//!         .server_streaming::<_, Summary, Row>("/Demo/Stream", &Query { limit: 3 }, CallOptions::new())
//!         .await?;
//!
//!     assert_eq!(summary.count, 3);
//!     while let Some(row) = rows.try_next().await? {
//!         println!("row {}", row.i);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod call;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use call::{CallReceiver, CallSender, CallStream, Role};
pub use client::{CallOptions, ClientBuilder, ClientConfig, ClientStreamingCall, RowStream, RpcClient};
pub use error::{CodecError, Error, FramingError, Result, TransportError};
pub use protocol::{
    BincodeCodec, CborCodec, Codec, JsonCodec, Status, StatusCode, StreamingShape, method_id,
};
pub use registry::{
    Handler, HeaderRowSink, MethodDescriptor, RequestStream, ResponseLayout, ServiceRegistry,
    ServiceRegistryBuilder,
};
pub use server::{CallState, RpcServer, ServerConfig};
pub use transport::{MuxAcceptor, MuxConfig, MuxSession};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
