//! Radio link behaviour against a local relay server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use edgelink_bridge_framework::SessionState;
use edgelink_gateway::frame::RequestFrame;
use edgelink_gateway::transport::{OutboundFrame, Priority, TransportQueue};

use common::{FakeRelay, WAIT, lora_config, recv_json, send_reply, start_link};

#[tokio::test]
async fn test_commands_overtake_polls_and_frames_are_paced() {
    let mut relay = FakeRelay::start().await;
    let queue = Arc::new(TransportQueue::new());
    queue.enqueue(OutboundFrame::new("7076e841", &RequestFrame::read(1, 0, 10), Priority::Normal));
    queue.enqueue(OutboundFrame::new("7076e841", &RequestFrame::read(2, 0, 10), Priority::Normal));
    queue.enqueue(OutboundFrame::new("7076e842", &RequestFrame::write(1, 5, 1), Priority::High));

    let harness = start_link(&lora_config(&relay.url, 200), queue);
    let mut ws = relay.accept().await;

    let mut received = Vec::new();
    for _ in 0..3 {
        let json = recv_json(&mut ws).await;
        received.push((Instant::now(), json));
    }

    let first = &received[0].1;
    assert_eq!(first["devaddr"], "7076e842");
    assert_eq!(first["data"], RequestFrame::write(1, 5, 1).encode_hex());
    assert_eq!(first["port"], 2);
    assert_eq!(first["time"], "immediately");
    assert_eq!(received[1].1["data"], "01030000000AC5CD");
    assert_eq!(received[2].1["data"], RequestFrame::read(2, 0, 10).encode_hex());

    for pair in received.windows(2) {
        let gap = pair[1].0 - pair[0].0;
        assert!(gap >= Duration::from_millis(150), "frames only {:?} apart", gap);
    }

    harness.trigger.trigger();
    tokio::time::timeout(WAIT, harness.task).await.unwrap().unwrap();
    assert_eq!(harness.health.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_replies_are_forwarded() {
    let mut relay = FakeRelay::start().await;
    let mut harness = start_link(&lora_config(&relay.url, 10), Arc::new(TransportQueue::new()));
    let mut ws = relay.accept().await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    send_reply(&mut ws, "7076e841", "01030400075801").await;

    let reply = tokio::time::timeout(WAIT, harness.replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.devaddr, "7076e841");
    assert_eq!(reply.data, "01030400075801");
    assert_eq!(reply.port, 2);

    harness.trigger.trigger();
    tokio::time::timeout(WAIT, harness.task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_link_reconnects_after_relay_drop() {
    let mut relay = FakeRelay::start().await;
    let queue = Arc::new(TransportQueue::new());
    let harness = start_link(&lora_config(&relay.url, 10), queue.clone());

    let first = relay.accept().await;
    drop(first);

    let mut second = relay.accept().await;
    queue.enqueue(OutboundFrame::new("7076e841", &RequestFrame::read(1, 0, 4), Priority::Normal));
    let json = recv_json(&mut second).await;
    assert_eq!(json["data"], RequestFrame::read(1, 0, 4).encode_hex());

    let snapshot = harness.health.snapshot();
    assert_eq!(snapshot.connects, 2);
    assert!(snapshot.failures >= 1);
    assert!(snapshot.last_error.is_none());

    harness.trigger.trigger();
    tokio::time::timeout(WAIT, harness.task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_while_relay_unreachable() {
    // Nothing listens on this port once the listener is dropped.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let harness = start_link(&lora_config(&url, 10), Arc::new(TransportQueue::new()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.health.snapshot().failures >= 1);

    harness.trigger.trigger();
    tokio::time::timeout(WAIT, harness.task).await.unwrap().unwrap();
    assert_eq!(harness.health.state(), SessionState::Disconnected);
}
