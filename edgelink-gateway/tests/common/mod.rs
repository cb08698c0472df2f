//! Shared fixtures for the gateway integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use edgelink_bridge_framework::{SessionHealth, Shutdown, ShutdownTrigger, shutdown_channel};
use edgelink_gateway::config::LoraConfig;
use edgelink_gateway::link::{RadioLink, RelayMessage};
use edgelink_gateway::transport::TransportQueue;

pub const WAIT: Duration = Duration::from_secs(5);

/// A local relay server handing out accepted WebSocket sessions.
pub struct FakeRelay {
    pub url: String,
    sessions: mpsc::Receiver<WebSocketStream<TcpStream>>,
}

impl FakeRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let (tx, sessions) = mpsc::channel(4);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(stream).await {
                    if tx.send(ws).await.is_err() {
                        break;
                    }
                }
            }
        });

        Self { url, sessions }
    }

    /// Next session opened by the link.
    pub async fn accept(&mut self) -> WebSocketStream<TcpStream> {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("link did not connect")
            .expect("relay stopped")
    }
}

/// Next text frame sent by the link, parsed.
pub async fn recv_json(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("no frame from link")
            .expect("session ended")
            .expect("receive failed");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("link sent invalid JSON");
        }
    }
}

/// Send a reply to the link as the relay would.
pub async fn send_reply(ws: &mut WebSocketStream<TcpStream>, devaddr: &str, data: &str) {
    let text = serde_json::json!({ "devaddr": devaddr, "data": data, "port": 2 }).to_string();
    ws.send(Message::Text(text)).await.expect("send reply");
}

pub fn lora_config(url: &str, pacing_ms: u64) -> LoraConfig {
    LoraConfig {
        nodes: vec!["7076e841".to_string()],
        websocket_url: url.to_string(),
        port: 2,
        pacing_ms,
        reconnect_delay_ms: 50,
        verify_reply_crc: true,
    }
}

/// A running link and the handles around it.
pub struct LinkHarness {
    pub queue: Arc<TransportQueue>,
    pub replies: mpsc::Receiver<RelayMessage>,
    pub health: Arc<SessionHealth>,
    pub trigger: ShutdownTrigger,
    pub task: tokio::task::JoinHandle<()>,
}

pub fn start_link(config: &LoraConfig, queue: Arc<TransportQueue>) -> LinkHarness {
    let (reply_tx, replies) = mpsc::channel(16);
    let health = Arc::new(SessionHealth::new("lora"));
    let (trigger, shutdown): (ShutdownTrigger, Shutdown) = shutdown_channel();
    let link = RadioLink::new(config, queue.clone(), reply_tx, health.clone());
    let task = tokio::spawn(link.run(shutdown));

    LinkHarness {
        queue,
        replies,
        health,
        trigger,
        task,
    }
}
