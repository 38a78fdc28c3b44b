//! Wires two in-process connections together over `tokio::io::duplex` and
//! exercises the handshake, request/response, cancellation, timeout, and
//! close paths the way two real peers would see them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::duplex;

use duplex_rpc::{
    CancellationSource, ConnectionBuilder, ConnectionFault, ConnectionState, FramingVariant,
    Handler, HandlerError, RequestFault, RequestOptions, Responder,
};

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, payload: Value, _responder: Responder, _cancel: CancellationSource) -> Result<Value, HandlerError> {
        Ok(payload)
    }
}

struct AlwaysFails;

#[async_trait]
impl Handler for AlwaysFails {
    async fn handle(&self, _payload: Value, _responder: Responder, _cancel: CancellationSource) -> Result<Value, HandlerError> {
        Err(HandlerError("deliberately broken".to_string()))
    }
}

/// Sends one keep-alive `ProgressResponse` then hangs until cancelled, so
/// tests can drive the keep-alive and cancellation paths deterministically.
struct HangsUntilCancelled;

#[async_trait]
impl Handler for HangsUntilCancelled {
    async fn handle(&self, _payload: Value, responder: Responder, cancel: CancellationSource) -> Result<Value, HandlerError> {
        responder.send_progress().ok();
        cancel.cancelled().await;
        Err(HandlerError("cancelled".to_string()))
    }
}

fn wire_pair(variant: FramingVariant) -> (duplex::DuplexStream, duplex::DuplexStream) {
    let _ = variant;
    duplex(64 * 1024)
}

#[tokio::test]
async fn handshake_then_request_round_trips() {
    let (client_stream, server_stream) = wire_pair(FramingVariant::JsonStream);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let client = ConnectionBuilder::new().build(client_read, client_write);
    let server = ConnectionBuilder::new().handler("Echo", Arc::new(Echo)).build(server_read, server_write);

    tokio::try_join!(client.connect(), server.connect()).unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.state(), ConnectionState::Connected);

    let handle = client
        .send_request::<_, Value>("Echo", json!({"hello": "world"}), RequestOptions::default())
        .await
        .unwrap();
    let response = handle.wait().await.unwrap();
    assert_eq!(response, json!({"hello": "world"}));

    client.close().await;
    server.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn unknown_method_is_a_remote_fault() {
    let (client_stream, server_stream) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let client = ConnectionBuilder::new().build(client_read, client_write);
    let server = ConnectionBuilder::new().build(server_read, server_write);
    tokio::try_join!(client.connect(), server.connect()).unwrap();

    let handle = client
        .send_request::<_, Value>("NoSuchMethod", json!({}), RequestOptions::default())
        .await
        .unwrap();
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, RequestFault::Remote { code, .. } if code == "UnknownMethod"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn handler_failure_is_a_remote_fault() {
    let (client_stream, server_stream) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let client = ConnectionBuilder::new().build(client_read, client_write);
    let server = ConnectionBuilder::new().handler("Break", Arc::new(AlwaysFails)).build(server_read, server_write);
    tokio::try_join!(client.connect(), server.connect()).unwrap();

    let handle = client
        .send_request::<_, Value>("Break", json!({}), RequestOptions::default())
        .await
        .unwrap();
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, RequestFault::Remote { code, .. } if code == "HandlerFault"));

    client.close().await;
    server.close().await;
}

#[tokio::test(start_paused = true)]
async fn timeout_without_keep_alive_cancels_the_request() {
    let (client_stream, server_stream) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let client = ConnectionBuilder::new().build(client_read, client_write);
    let server = ConnectionBuilder::new().handler("Hang", Arc::new(HangsUntilCancelled)).build(server_read, server_write);
    tokio::try_join!(client.connect(), server.connect()).unwrap();

    let handle = client
        .send_request::<_, Value>(
            "Hang",
            json!({}),
            RequestOptions { timeout: Some(Duration::from_millis(50)), keep_alive: false },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, RequestFault::Cancelled(_)));

    client.close().await;
    server.close().await;
}

/// Sends keep-alive `ProgressResponse`s for longer than the caller's initial
/// timeout window before finally answering, so a `keep_alive: true` caller
/// must be resetting its deadline on each one to ever see the result.
struct SlowButKeepsAlive;

#[async_trait]
impl Handler for SlowButKeepsAlive {
    async fn handle(&self, payload: Value, responder: Responder, _cancel: CancellationSource) -> Result<Value, HandlerError> {
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            responder.send_progress().ok();
        }
        Ok(payload)
    }
}

#[tokio::test(start_paused = true)]
async fn keep_alive_progress_postpones_the_timeout() {
    let (client_stream, server_stream) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let client = ConnectionBuilder::new().build(client_read, client_write);
    let server = ConnectionBuilder::new().handler("Slow", Arc::new(SlowButKeepsAlive)).build(server_read, server_write);
    tokio::try_join!(client.connect(), server.connect()).unwrap();

    // Total handler runtime (~160ms) exceeds the 50ms initial timeout, but
    // each of its four progress pings resets the deadline before it expires.
    let handle = client
        .send_request::<_, Value>(
            "Slow",
            json!({"nonce": 1}),
            RequestOptions { timeout: Some(Duration::from_millis(50)), keep_alive: true },
        )
        .await
        .unwrap();

    let response = handle.wait().await.unwrap();
    assert_eq!(response, json!({"nonce": 1}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn cancelling_a_request_tells_the_peer_to_stop_working() {
    let (client_stream, server_stream) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let client = ConnectionBuilder::new().build(client_read, client_write);
    let server = ConnectionBuilder::new().handler("Hang", Arc::new(HangsUntilCancelled)).build(server_read, server_write);
    tokio::try_join!(client.connect(), server.connect()).unwrap();

    let handle = client
        .send_request::<_, Value>("Hang", json!({}), RequestOptions::default())
        .await
        .unwrap();

    // Give the server's handler a moment to register its progress sink
    // before the client cancels.
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel().await;
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, RequestFault::Cancelled(_)));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn closing_the_connection_drops_the_peer_cleanly() {
    let (client_stream, server_stream) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let client = ConnectionBuilder::new().build(client_read, client_write);
    let server = ConnectionBuilder::new().build(server_read, server_write);
    tokio::try_join!(client.connect(), server.connect()).unwrap();

    client.close().await;
    server.wait_for_close().await;
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn line_delimited_framing_round_trips_too() {
    let (client_stream, server_stream) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let client = ConnectionBuilder::new().framing(FramingVariant::LineDelimited).build(client_read, client_write);
    let server = ConnectionBuilder::new()
        .framing(FramingVariant::LineDelimited)
        .handler("Echo", Arc::new(Echo))
        .build(server_read, server_write);
    tokio::try_join!(client.connect(), server.connect()).unwrap();

    let handle = client
        .send_request::<_, Value>("Echo", json!([1, 2, 3]), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), json!([1, 2, 3]));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn orphan_response_is_reported_as_a_connection_fault() {
    // Drive a raw frame exchange rather than two `Connection`s, so a
    // `SuccessResponse` can be sent for a request id the client never sent.
    use duplex_rpc::{Header, Message, MessageType, RequestId};

    let (client_stream, mut server_stream) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);

    let client = ConnectionBuilder::new().build(client_read, client_write);

    // Hand-roll the server side of the handshake directly on the raw stream
    // so the client reaches `Connected` without a second `Connection`. The
    // client's own handshake only completes once it has BOTH sent its
    // request and serviced an inbound `Handshake` request from the peer
    // (connection.rs's `perform_handshake` joins on both), so the fake
    // server must emit one of its own, not just answer the client's.
    let connect_fut = client.connect();
    let server_task = tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut buf = vec![0u8; 4096];
        let n = server_stream.read(&mut buf).await.unwrap();
        let mut de = serde_json::Deserializer::from_slice(&buf[..n]).into_iter::<serde_json::Value>();
        let header_value = de.next().unwrap().unwrap();
        let request_id: RequestId =
            serde_json::from_value(header_value.get("RequestId").unwrap().clone()).unwrap();

        let response = Message::success(request_id, json!({"protocolVersion": 1}));
        let mut out = serde_json::to_vec(&response.header).unwrap();
        out.push(b'\n');
        out.extend_from_slice(&serde_json::to_vec(&response.payload).unwrap());
        out.push(b'\n');

        let server_request_id = RequestId::new_v4();
        let handshake_request = Message::request(
            server_request_id,
            "Handshake",
            json!({"ProtocolVersion": 1, "MinProtocolVersion": 1, "Methods": []}),
        );
        out.extend_from_slice(&serde_json::to_vec(&handshake_request.header).unwrap());
        out.push(b'\n');
        out.extend_from_slice(&serde_json::to_vec(&handshake_request.payload).unwrap());
        out.push(b'\n');

        server_stream.write_all(&out).await.unwrap();
        server_stream.flush().await.unwrap();

        // Drain the client's `SuccessResponse` to our handshake request so
        // it doesn't sit unread.
        let mut reply_buf = vec![0u8; 4096];
        let _ = server_stream.read(&mut reply_buf).await.unwrap();

        server_stream
    });

    connect_fut.await.unwrap();
    let mut server_stream = server_task.await.unwrap();

    let mut faults = client.subscribe_faults().await;

    let orphan_id = RequestId::new_v4();
    let orphan = Message::new(Header::new(MessageType::SuccessResponse, orphan_id), json!("surprise"));
    use tokio::io::AsyncWriteExt;
    let mut out = serde_json::to_vec(&orphan.header).unwrap();
    out.push(b'\n');
    out.extend_from_slice(&serde_json::to_vec(&orphan.payload).unwrap());
    out.push(b'\n');
    server_stream.write_all(&out).await.unwrap();
    server_stream.flush().await.unwrap();

    let fault = faults.recv().await.unwrap();
    assert!(matches!(fault, ConnectionFault::OrphanResponse { request_id } if request_id == orphan_id));

    client.close().await;
}
