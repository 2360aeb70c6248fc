//! Serves `/Demo/Stream` over TCP with CBOR and queries it.
//!
//! Run with `cargo run --example row_stream`.

use proven_stream_rpc::{
    CallOptions, CborCodec, HeaderRowSink, RpcClient, RpcServer, ServerConfig, ServiceRegistry,
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct Query {
    limit: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Summary {
    count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    i: u32,
    square: u64,
}

async fn stream(
    query: Query,
    mut sink: HeaderRowSink<CborCodec, Summary, Row>,
) -> proven_stream_rpc::Result<()> {
    sink.send_header(&Summary { count: query.limit }).await?;
    for i in 0..query.limit {
        sink.send_row(&Row {
            i,
            square: u64::from(i) * u64::from(i),
        })
        .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let registry = ServiceRegistry::builder()
        .server_streaming("/Demo/Stream", stream)?
        .build();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = RpcServer::new(registry, CborCodec, ServerConfig::default());
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });
    info!("Serving on {}", addr);

    let client = RpcClient::<CborCodec>::builder().addr(addr).connect().await?;
    let (summary, rows) = client
        .server_streaming::<_, Summary, Row>("/Demo/Stream", &Query { limit: 5 }, CallOptions::new())
        .await?;
    info!("Expecting {} rows", summary.count);

    let mut rows = Box::pin(rows.into_stream());
    while let Some(row) = rows.next().await {
        let row = row?;
        info!("Row {}: {}", row.i, row.square);
    }

    server.shutdown();
    serving.await??;
    Ok(())
}
