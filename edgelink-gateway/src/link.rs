//! Radio-relay link.
//!
//! A single WebSocket session to the relay server carries every frame to
//! and from the field. The link task owns that session: it reconnects
//! whenever it drops, drains the [`TransportQueue`] one frame per pacing
//! slot, and forwards every reply to the bridge.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use edgelink_bridge_framework::{SessionHealth, Shutdown};

use crate::config::LoraConfig;
use crate::transport::{OutboundFrame, Pacer, TransportQueue};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Send-time value asking the relay to transmit straight away.
pub const SEND_IMMEDIATELY: &str = "immediately";

/// Error type for the relay link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Receive failed: {0}")]
    Receive(String),
    #[error("Relay closed the connection")]
    Closed,
    #[error("Failed to encode relay message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A message exchanged with the relay server, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Hex-encoded frame.
    pub data: String,
    /// Field node device address.
    pub devaddr: String,
    #[serde(default)]
    pub port: u8,
    #[serde(default = "default_time")]
    pub time: String,
}

fn default_time() -> String {
    SEND_IMMEDIATELY.to_string()
}

impl RelayMessage {
    pub fn outbound(frame: &OutboundFrame, port: u8) -> Self {
        Self {
            data: frame.data.clone(),
            devaddr: frame.devaddr.clone(),
            port,
            time: default_time(),
        }
    }
}

/// The relay link task.
pub struct RadioLink {
    url: String,
    port: u8,
    pacing: Duration,
    reconnect_delay: Duration,
    queue: Arc<TransportQueue>,
    replies: mpsc::Sender<RelayMessage>,
    health: Arc<SessionHealth>,
}

impl RadioLink {
    pub fn new(
        config: &LoraConfig,
        queue: Arc<TransportQueue>,
        replies: mpsc::Sender<RelayMessage>,
        health: Arc<SessionHealth>,
    ) -> Self {
        Self {
            url: config.websocket_url.clone(),
            port: config.port,
            pacing: config.pacing(),
            reconnect_delay: config.reconnect_delay(),
            queue,
            replies,
            health,
        }
    }

    /// Keep the link up until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) {
        // Shared across reconnects.
        let mut pacer = Pacer::new(self.pacing);

        loop {
            self.health.set_connecting();
            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = shutdown.triggered() => break,
            };

            let failure = match connected {
                Ok((socket, _)) => {
                    self.health.set_connected();
                    info!("Relay link up: {} ({} frame(s) waiting)", self.url, self.queue.len());
                    match self.serve(socket, &mut pacer, &mut shutdown).await {
                        Ok(()) => break,
                        Err(e) => e,
                    }
                }
                Err(e) => LinkError::Connect {
                    url: self.url.clone(),
                    message: e.to_string(),
                },
            };

            warn!("Relay link down: {}", failure);
            self.health.record_failure(&failure.to_string());

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown.triggered() => break,
            }
        }

        self.health.set_disconnected();
        info!("Relay link closed");
    }

    /// Serve one connected session. `Ok` means shutdown was requested.
    async fn serve(
        &self,
        socket: RelaySocket,
        pacer: &mut Pacer,
        shutdown: &mut Shutdown,
    ) -> Result<(), LinkError> {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.receive(&text),
                    Some(Ok(Message::Close(_))) | None => return Err(LinkError::Closed),
                    Some(Ok(other)) => trace!("Ignoring relay message {:?}", other),
                    Some(Err(e)) => return Err(LinkError::Receive(e.to_string())),
                },
                frame = async {
                    pacer.ready().await;
                    self.queue.next().await
                } => {
                    let text = serde_json::to_string(&RelayMessage::outbound(&frame, self.port))?;
                    debug!("Relay send ({:?}): {}", frame.priority, text);
                    // A frame that fails to go out is lost with the session.
                    sink.send(Message::Text(text))
                        .await
                        .map_err(|e| LinkError::Send(e.to_string()))?;
                    pacer.sent();
                }
            }
        }
    }

    fn receive(&self, text: &str) {
        debug!("Relay receive: {}", text);
        let message: RelayMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed relay message: {}", e);
                return;
            }
        };

        if let Err(e) = self.replies.try_send(message) {
            warn!("Field reply dropped: {}", e);
        }
    }
}
