mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use common::Harness;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(h: &Harness) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = h.app();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (mut client, _) = connect_async(format!("ws://{addr}/api/ws")).await.unwrap();
    let hello = next_json(&mut client).await;
    assert_eq!(hello["type"], "connected");
    client
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

async fn send(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_join_receives_snapshot_and_updates() {
    let h = Harness::new().await;
    let started = h.demo.start_session("demo-app", "alice").await.unwrap();
    let addr = serve(&h).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({ "type": "join", "sessionId": started.session_id })).await;
    let joined = next_json(&mut client).await;
    assert_eq!(joined["type"], "joined");
    assert_eq!(joined["sessionId"], started.session_id.as_str());

    let snapshot = next_json(&mut client).await;
    assert_eq!(snapshot["type"], "sessionUpdate");
    assert_eq!(snapshot["state"], "running");
    assert_eq!(snapshot["hostPort"], started.host_port);

    h.demo.terminate_session(&started.session_id).await.unwrap();

    let mut saw_stopping = false;
    loop {
        let event = next_json(&mut client).await;
        assert_eq!(event["sessionId"], started.session_id.as_str());
        if event["type"] == "containerStatus" && event["status"] == "stopping" {
            saw_stopping = true;
        }
        if event["type"] == "sessionUpdate" && event["state"] == "terminated" {
            break;
        }
    }
    assert!(saw_stopping);
}

#[tokio::test]
async fn test_join_unknown_session_errors() {
    let h = Harness::new().await;
    let addr = serve(&h).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({ "type": "join", "sessionId": "missing" })).await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["sessionId"], "missing");
}

#[tokio::test]
async fn test_join_finished_session_leaves_no_channel() {
    let h = Harness::new().await;
    let started = h.demo.start_session("gallery", "guest").await.unwrap();
    h.demo.terminate_session(&started.session_id).await.unwrap();
    let addr = serve(&h).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({ "type": "join", "sessionId": started.session_id })).await;
    assert_eq!(next_json(&mut client).await["type"], "joined");
    let snapshot = next_json(&mut client).await;
    assert_eq!(snapshot["state"], "terminated");
    assert_eq!(h.demo.broadcaster().channel_count(), 0);

    send(&mut client, json!({ "type": "join", "sessionId": "missing" })).await;
    assert_eq!(next_json(&mut client).await["type"], "error");
    assert_eq!(h.demo.broadcaster().channel_count(), 0);
}

#[tokio::test]
async fn test_join_live_session_holds_subscription() {
    let h = Harness::new().await;
    let started = h.demo.start_session("gallery", "guest").await.unwrap();
    let addr = serve(&h).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({ "type": "join", "sessionId": started.session_id })).await;
    assert_eq!(next_json(&mut client).await["type"], "joined");
    assert_eq!(next_json(&mut client).await["state"], "running");
    assert_eq!(h.demo.broadcaster().subscriber_count(&started.session_id), 1);

    // Joining again does not stack a second subscription.
    send(&mut client, json!({ "type": "join", "sessionId": started.session_id })).await;
    assert_eq!(next_json(&mut client).await["type"], "joined");
    assert_eq!(next_json(&mut client).await["state"], "running");
    assert_eq!(h.demo.broadcaster().subscriber_count(&started.session_id), 1);
}

#[tokio::test]
async fn test_invalid_command_errors() {
    let h = Harness::new().await;
    let addr = serve(&h).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({ "type": "dance" })).await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().starts_with("invalid command"));
}

#[tokio::test]
async fn test_leave_acknowledged() {
    let h = Harness::new().await;
    let started = h.demo.start_session("gallery", "guest").await.unwrap();
    let addr = serve(&h).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({ "type": "join", "sessionId": started.session_id })).await;
    assert_eq!(next_json(&mut client).await["type"], "joined");
    assert_eq!(next_json(&mut client).await["type"], "sessionUpdate");

    send(&mut client, json!({ "type": "leave", "sessionId": started.session_id })).await;
    let left = next_json(&mut client).await;
    assert_eq!(left["type"], "left");
}
