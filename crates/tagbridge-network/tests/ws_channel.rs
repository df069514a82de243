//! WebSocket event channel over a real loopback listener.

mod common;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr, origin: Option<&str>) -> Client {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_str(origin).unwrap());
    }
    let (client, _) = connect_async(request).await.unwrap();
    client
}

async fn send(client: &mut Client, message: Value) {
    client
        .send(Message::Text(message.to_string().into()))
        .await
        .unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Skip messages until one of type `kind` arrives.
async fn recv_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let message = recv(client).await;
        if message["type"] == kind {
            return message;
        }
    }
}

#[tokio::test]
async fn test_snapshot_on_connect() {
    let stack = common::stack().await;
    let addr = stack.serve().await;

    let mut client = connect(addr, None).await;
    let snapshot = recv(&mut client).await;
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["readerConnected"], false);
    assert_eq!(snapshot["isScanning"], false);
}

#[tokio::test]
async fn test_control_failures_go_to_the_caller() {
    let stack = common::stack().await;
    let addr = stack.serve().await;
    let mut client = connect(addr, None).await;
    recv(&mut client).await;

    send(&mut client, json!({"type": "start-scan"})).await;
    let reply = recv(&mut client).await;
    assert_eq!(
        reply,
        json!({"type": "scan-result", "success": false, "error": "no reader available"})
    );

    send(&mut client, json!({"type": "get-status"})).await;
    let status = recv(&mut client).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["isScanning"], false);
}

#[tokio::test]
async fn test_invalid_message_answered_privately() {
    let stack = common::stack().await;
    let addr = stack.serve().await;
    let mut sender = connect(addr, None).await;
    let mut bystander = connect(addr, None).await;
    recv(&mut sender).await;
    recv(&mut bystander).await;

    send(&mut sender, json!({"type": "launch-rocket"})).await;
    assert_eq!(
        recv(&mut sender).await,
        json!({"type": "error", "message": "invalid message"})
    );
    sender
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    assert_eq!(recv(&mut sender).await["message"], "invalid message");

    // The next thing the bystander sees is a broadcast, not the error.
    stack.service().connect_reader().await.unwrap();
    assert_eq!(recv(&mut bystander).await["type"], "reader-connected");
}

#[tokio::test]
async fn test_proximity_read_reaches_every_subscriber() {
    let stack = common::stack().await;
    let addr = stack.serve().await;
    let mut page = connect(addr, Some(common::ORIGIN)).await;
    let mut till = connect(addr, None).await;
    recv(&mut page).await;
    recv(&mut till).await;

    send(&mut till, json!({"type": "connect-reader"})).await;
    let reply = recv_type(&mut till, "scan-result").await;
    assert_eq!(reply["success"], true);

    send(&mut till, json!({"type": "start-scan"})).await;
    assert_eq!(recv_type(&mut till, "scan-result").await["success"], true);
    assert_eq!(recv_type(&mut page, "scan-started").await["timeoutMs"], 30_000);

    send(
        &mut page,
        json!({"type": "proximity-read", "serialNumber": "04:A1:B2:C3"}),
    )
    .await;

    for client in [&mut page, &mut till] {
        let read = recv_type(client, "card-detected").await;
        assert_eq!(read["tagId"], "04a1b2c3");
        assert_eq!(read["transport"], "proximity");
        assert_eq!(recv(client).await["type"], "scan-stopped");
    }
}

#[tokio::test]
async fn test_untrusted_origin_cannot_forward_reads() {
    let stack = common::stack().await;
    let addr = stack.serve().await;
    stack.service().connect_reader().await.unwrap();
    stack.service().start_scan().await.unwrap();

    let mut client = connect(addr, Some("https://evil.example.com")).await;
    assert_eq!(recv(&mut client).await["type"], "snapshot");

    send(
        &mut client,
        json!({"type": "proximity-read", "serialNumber": "04:a1:b2:c3"}),
    )
    .await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(
        reply["message"],
        "proximity reads are not accepted from this origin"
    );
    assert!(stack.service().status().await.unwrap().is_scanning);
}

#[tokio::test]
async fn test_disconnect_unsubscribes() {
    let stack = common::stack().await;
    let addr = stack.serve().await;
    let mut client = connect(addr, None).await;
    recv(&mut client).await;
    assert_eq!(stack.state.distributor.subscriber_count().await.unwrap(), 1);

    client.close(None).await.unwrap();
    let mut remaining = 1;
    for _ in 0..50 {
        remaining = stack.state.distributor.subscriber_count().await.unwrap();
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(remaining, 0);
}
