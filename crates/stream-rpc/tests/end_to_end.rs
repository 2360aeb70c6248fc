//! End-to-end calls of every streaming shape.

mod common;

use common::*;
use proven_stream_rpc::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};

#[tokio::test]
async fn test_demo_stream_header_then_rows() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<JsonCodec>(&invocations).build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    let (header, mut rows) = harness
        .client
        .server_streaming::<_, Value, Value>("/Demo/Stream", &json!({ "limit": 3 }), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(header, json!({ "count": 3 }));

    for i in 0..3 {
        assert_eq!(rows.next_row().await.unwrap(), json!({ "i": i }));
    }
    assert!(matches!(rows.next_row().await, Err(Error::EndOfStream)));
    // The terminal state is sticky
    assert!(matches!(rows.next_row().await, Err(Error::EndOfStream)));
    assert!(rows.try_next().await.unwrap().is_none());

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_row_stream_adapter() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<BincodeCodec>(&invocations).build();
    let harness = Harness::start(registry, BincodeCodec, ServerConfig::default());

    let (summary, rows) = harness
        .client
        .server_streaming::<_, Summary, Row>("/Demo/Stream", &Query { limit: 50 }, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(summary, Summary { count: 50 });

    let rows: Vec<Row> = rows
        .into_stream()
        .map(|row| row.unwrap())
        .collect()
        .await;
    assert_eq!(rows, (0..50).map(|i| Row { i }).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_empty_row_set() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<CborCodec>(&invocations).build();
    let harness = Harness::start(registry, CborCodec, ServerConfig::default());

    let (summary, mut rows) = harness
        .client
        .server_streaming::<_, Summary, Row>("/Demo/Stream", &Query { limit: 0 }, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(summary.count, 0);
    assert!(rows.next_row().await.unwrap_err().is_end_of_stream());
}

#[tokio::test]
async fn test_unary() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<JsonCodec>(&invocations).build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    let reply: String = harness
        .client
        .unary("/Demo/Echo", "hello", CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply, "hello");
}

#[tokio::test]
async fn test_client_streaming() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<CborCodec>(&invocations).build();
    let harness = Harness::start(registry, CborCodec, ServerConfig::default());

    let mut call = harness
        .client
        .client_streaming::<i64, i64>("/Demo/Sum", CallOptions::new())
        .await
        .unwrap();
    for n in 1..=10 {
        call.send(&n).await.unwrap();
    }
    assert_eq!(call.finish().await.unwrap(), 55);

    let call = harness
        .client
        .client_streaming::<i64, i64>("/Demo/Sum", CallOptions::new())
        .await
        .unwrap();
    assert_eq!(call.finish().await.unwrap(), 0);
}

#[tokio::test]
async fn test_bidirectional() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<JsonCodec>(&invocations).build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    let mut call = harness
        .client
        .bidirectional("/Demo/Upper", CallOptions::new())
        .await
        .unwrap();

    // Interleaved: each reply arrives before the next message is sent
    for word in ["alpha", "beta", "gamma"] {
        call.send(word).await.unwrap();
        assert_eq!(call.recv::<String>().await.unwrap(), word.to_uppercase());
    }
    call.close().await.unwrap();
    assert!(call.recv::<String>().await.unwrap_err().is_end_of_stream());
}

#[tokio::test]
async fn test_bidirectional_split() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<JsonCodec>(&invocations).build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    let call = harness
        .client
        .bidirectional("/Demo/Upper", CallOptions::new())
        .await
        .unwrap();
    let (mut sender, mut receiver) = call.split();

    let writer = tokio::spawn(async move {
        for i in 0..100 {
            sender.send(&format!("msg-{i}")).await.unwrap();
        }
        sender.close().await.unwrap();
    });

    let mut received = Vec::new();
    loop {
        match receiver.recv::<String>().await {
            Ok(text) => received.push(text),
            Err(e) if e.is_end_of_stream() => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    writer.await.unwrap();

    assert_eq!(received.len(), 100);
    assert_eq!(received[42], "MSG-42");
}

#[tokio::test]
async fn test_unknown_method_never_invokes_a_handler() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<JsonCodec>(&invocations).build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    let err = harness
        .client
        .unary::<_, String>("/Foo/Bar", "hello", CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(ref m) if m == "/Foo/Bar"));

    let err = harness
        .client
        .server_streaming::<_, Summary, Row>("/demo/stream", &Query { limit: 1 }, CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_codec_mismatch_rejected() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<JsonCodec>(&invocations).build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    let err = harness
        .client_with(CborCodec)
        .unary::<_, String>("/Demo/Echo", "hello", CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Remote { ref status, .. } if status.code == StatusCode::Unimplemented
    ));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shape_mismatch_rejected() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<JsonCodec>(&invocations).build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    let err = harness
        .client
        .unary::<_, Value>("/Demo/Stream", &Query { limit: 1 }, CallOptions::new())
        .await
        .unwrap_err();
    match err {
        Error::Remote { method, status } => {
            assert_eq!(method, "/Demo/Stream");
            assert_eq!(status.code, StatusCode::InvalidArgument);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_decode_error_reported() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<JsonCodec>(&invocations).build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    // The handler expects a string
    let err = harness
        .client
        .unary::<_, String>("/Demo/Echo", &42, CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Remote { ref status, .. } if status.code == StatusCode::Decode
    ));
}

#[tokio::test]
async fn test_handler_status_and_panic() {
    let registry = ServiceRegistry::<JsonCodec>::builder()
        .unary("/Demo/Validate", |limit: i64| async move {
            if limit <= 0 {
                return Err(Error::Status(
                    Status::invalid_argument("limit must be positive")
                        .with_details(json!({ "field": "limit" })),
                ));
            }
            Ok(limit)
        })
        .unwrap()
        .unary("/Demo/Panic", |_: ()| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, Error>(())
        })
        .unwrap()
        .build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    let err = harness
        .client
        .unary::<_, i64>("/Demo/Validate", &-1, CallOptions::new())
        .await
        .unwrap_err();
    match err {
        Error::Remote { status, .. } => {
            assert_eq!(status.code, StatusCode::InvalidArgument);
            assert_eq!(status.message, "limit must be positive");
            assert_eq!(status.details, Some(json!({ "field": "limit" })));
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = harness
        .client
        .unary::<_, ()>("/Demo/Panic", &(), CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Remote { ref status, .. }
            if status.code == StatusCode::Internal && status.message.contains("boom")
    ));

    // The server survived the panic
    let ok: i64 = harness
        .client
        .unary("/Demo/Validate", &5, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(ok, 5);
}

async fn rows_without_header(
    _query: Query,
    mut sink: HeaderRowSink<JsonCodec, Summary, Row>,
) -> Result<()> {
    sink.send_row(&Row { i: 0 }).await
}

async fn no_header(_query: Query, _sink: HeaderRowSink<JsonCodec, Summary, Row>) -> Result<()> {
    Ok(())
}

#[tokio::test]
async fn test_header_row_contract_enforced() {
    let registry = ServiceRegistry::<JsonCodec>::builder()
        .server_streaming("/Demo/RowFirst", rows_without_header)
        .unwrap()
        .server_streaming("/Demo/NoHeader", no_header)
        .unwrap()
        .build();
    let harness = Harness::start(registry, JsonCodec, ServerConfig::default());

    for method in ["/Demo/RowFirst", "/Demo/NoHeader"] {
        let err = harness
            .client
            .server_streaming::<_, Summary, Row>(method, &Query { limit: 1 }, CallOptions::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Remote { ref status, .. } if status.code == StatusCode::InvalidArgument),
            "{method}: {err}"
        );
    }
}

#[tokio::test]
async fn test_concurrent_calls_do_not_interleave() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<JsonCodec>(&invocations).build();
    let config = ServerConfig {
        mux: MuxConfig {
            max_packet_size: 1024,
            ..MuxConfig::default()
        },
        ..ServerConfig::default()
    };
    let harness = Harness::start(registry, JsonCodec, config);

    let calls = (0..16).map(|n| {
        let client = harness.client.clone();
        tokio::spawn(async move {
            // Larger than a packet, so calls are split and multiplexed
            let payload = format!("{n}:").repeat(20_000);
            let reply: String = client
                .unary("/Demo/Echo", &payload, CallOptions::new())
                .await
                .unwrap();
            assert_eq!(reply, payload);

            let (summary, mut rows) = client
                .server_streaming::<_, Summary, Row>(
                    "/Demo/Stream",
                    &Query { limit: n },
                    CallOptions::new(),
                )
                .await
                .unwrap();
            assert_eq!(summary.count, n);
            let mut seen = 0;
            while let Some(row) = rows.try_next().await.unwrap() {
                assert_eq!(row.i, seen);
                seen += 1;
            }
            assert_eq!(seen, n);
        })
    });

    for call in futures::future::join_all(calls).await {
        call.unwrap();
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 32);
}

#[tokio::test]
async fn test_calls_over_tcp() {
    init_tracing();

    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = demo_registry::<CborCodec>(&invocations).build();
    let server = RpcServer::new(registry, CborCodec, ServerConfig::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let client = RpcClient::<CborCodec>::builder()
        .addr(addr)
        .connect_timeout(Duration::from_secs(2))
        .connect()
        .await
        .unwrap();

    let (summary, mut rows) = client
        .server_streaming::<_, Summary, Row>("/Demo/Stream", &Query { limit: 3 }, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(summary.count, 3);
    for i in 0..3 {
        assert_eq!(rows.next_row().await.unwrap(), Row { i });
    }
    assert!(rows.next_row().await.unwrap_err().is_end_of_stream());

    server.shutdown();
    serving.await.unwrap().unwrap();
}
