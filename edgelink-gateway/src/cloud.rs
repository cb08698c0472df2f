//! Cloud (IoT hub) session.
//!
//! The session is a small state machine driven by [`CloudSession::run`]:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!       ^              |            |
//!       +--------------+------------+   (connect, subscribe or poll failure)
//! ```
//!
//! Once connected it subscribes to the property-set topic and forwards
//! every command payload into a bounded FIFO drained by the bridge.
//! Telemetry is handed over through a [`TelemetryPublisher`] and published
//! at most once: events produced while the session is down are dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, SubscribeReasonCode,
    Transport,
};
use serde_json::{Map, Value};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use edgelink_bridge_framework::{SessionHealth, Shutdown};
use edgelink_common::{MessageIds, ThingMessage, ThingTopics};

use crate::config::CloudConfig;

type HmacSha256 = Hmac<Sha256>;

/// Timestamp baked into the device signature.
const SIGN_TIMESTAMP: &str = "2524608000000";

/// Capacity of the client's request channel and event forwarder.
const CLIENT_CAPACITY: usize = 64;

/// How long the event loop gets to flush a disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Capacity of the telemetry hand-over channel.
const PUBLISH_QUEUE: usize = 256;

/// Error type for cloud operations.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Failed to sign device credentials: {0}")]
    Signing(String),
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Subscribe to '{topic}' failed: {message}")]
    Subscribe { topic: String, message: String },
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("Connection lost: {0}")]
    Connection(String),
    #[error("Not connected")]
    NotConnected,
}

/// MQTT credentials derived from the device triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSignature {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// Sign the device credentials for an MQTT connect.
pub fn sign_device(cloud: &CloudConfig) -> Result<DeviceSignature, CloudError> {
    let pk = &cloud.product_key;
    let dn = &cloud.device_name;
    let secure_mode = if cloud.tls { 2 } else { 3 };

    let client_id = format!(
        "{pk}.{dn}|timestamp={SIGN_TIMESTAMP},_v=sdk-c-1.0.0,securemode={secure_mode},signmethod=hmacsha256,lan=C|"
    );
    let content =
        format!("clientId{pk}.{dn}deviceName{dn}productKey{pk}timestamp{SIGN_TIMESTAMP}");

    let mut mac = HmacSha256::new_from_slice(cloud.device_secret.as_bytes())
        .map_err(|e| CloudError::Signing(e.to_string()))?;
    mac.update(content.as_bytes());
    let password = hex::encode_upper(mac.finalize().into_bytes());

    Ok(DeviceSignature {
        client_id,
        username: format!("{dn}&{pk}"),
        password,
    })
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Narrow MQTT client contract the session needs.
pub trait CloudClient: Send + 'static {
    /// Open a session; resolves once the broker accepted it.
    fn connect(&mut self) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Subscribe with QoS 1; resolves once acknowledged.
    fn subscribe(&mut self, topic: &str) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Publish with QoS 0.
    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Next inbound message. An error means the session is gone.
    ///
    /// Must be cancel safe.
    fn poll(&mut self) -> impl Future<Output = Result<InboundMessage, CloudError>> + Send;

    /// Tear the session down. Safe to call when not connected.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// [`CloudClient`] backed by `rumqttc`.
pub struct MqttCloudClient {
    host: String,
    port: u16,
    tls: bool,
    keep_alive: Duration,
    signature: DeviceSignature,
    client: Option<AsyncClient>,
    events: Option<mpsc::Receiver<Result<Event, String>>>,
    driver: Option<JoinHandle<()>>,
    pending: VecDeque<InboundMessage>,
}

impl MqttCloudClient {
    pub fn new(cloud: &CloudConfig) -> Result<Self, CloudError> {
        Ok(Self {
            host: cloud.broker_host(),
            port: cloud.port,
            tls: cloud.tls,
            keep_alive: Duration::from_secs(cloud.keep_alive_secs),
            signature: sign_device(cloud)?,
            client: None,
            events: None,
            driver: None,
            pending: VecDeque::new(),
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.signature.client_id, &self.host, self.port);
        options.set_credentials(&self.signature.username, &self.signature.password);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    async fn next_event(&mut self) -> Result<Event, CloudError> {
        let events = self.events.as_mut().ok_or(CloudError::NotConnected)?;
        match events.recv().await {
            Some(Ok(event)) => Ok(event),
            Some(Err(e)) => Err(CloudError::Connection(e)),
            None => Err(CloudError::Connection("event loop stopped".to_string())),
        }
    }

    fn client(&self) -> Result<&AsyncClient, CloudError> {
        self.client.as_ref().ok_or(CloudError::NotConnected)
    }
}

impl CloudClient for MqttCloudClient {
    async fn connect(&mut self) -> Result<(), CloudError> {
        self.disconnect().await;

        info!("Connecting to {}:{}", self.host, self.port);
        let (client, mut eventloop) = AsyncClient::new(self.options(), CLIENT_CAPACITY);
        let (tx, rx) = mpsc::channel(CLIENT_CAPACITY);

        // The event loop must be polled continuously for keep-alives and
        // outgoing requests to make progress.
        let driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.to_string())).await;
                        break;
                    }
                }
            }
        });

        self.client = Some(client);
        self.events = Some(rx);
        self.driver = Some(driver);

        loop {
            match self.next_event().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(CloudError::Connect(format!("{:?}", ack.code)));
                }
                Ok(other) => trace!("Before ConnAck: {:?}", other),
                Err(e) => return Err(CloudError::Connect(e.to_string())),
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), CloudError> {
        let failed = |message: String| CloudError::Subscribe {
            topic: topic.to_string(),
            message,
        };

        self.client()?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| failed(e.to_string()))?;

        loop {
            match self.next_event().await.map_err(|e| failed(e.to_string()))? {
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(failed("rejected by broker".to_string()));
                    }
                    return Ok(());
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    self.pending.push_back(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                other => trace!("Before SubAck: {:?}", other),
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), CloudError> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| CloudError::Publish(e.to_string()))
    }

    async fn poll(&mut self) -> Result<InboundMessage, CloudError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }

        loop {
            match self.next_event().await? {
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(CloudError::Connection("broker sent disconnect".to_string()));
                }
                other => trace!("MQTT event: {:?}", other),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        self.events = None;
        self.pending.clear();
        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }
    }
}

/// Hands telemetry events to the cloud session.
#[derive(Clone)]
pub struct TelemetryPublisher {
    ids: Arc<MessageIds>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl TelemetryPublisher {
    /// A publisher feeding `tx`, with message ids starting at zero.
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            ids: Arc::new(MessageIds::new()),
            tx,
        }
    }

    /// Publish a property-post event. Returns the message id used, or
    /// `None` if the event was dropped.
    pub fn publish(&self, params: Map<String, Value>) -> Option<u64> {
        let id = self.ids.next_id();
        let payload = match ThingMessage::property_post(id, params).to_vec() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode event {}: {}", id, e);
                return None;
            }
        };

        match self.tx.try_send(payload) {
            Ok(()) => Some(id),
            Err(e) => {
                error!("Event {} dropped: {}", id, e);
                None
            }
        }
    }
}

/// The reconnecting cloud session.
pub struct CloudSession<C: CloudClient> {
    client: C,
    topics: ThingTopics,
    health: Arc<SessionHealth>,
    reconnect_delay: Duration,
    inbound: mpsc::Sender<Vec<u8>>,
    outbound: mpsc::Receiver<Vec<u8>>,
}

impl<C: CloudClient> CloudSession<C> {
    /// Create the session along with its telemetry publisher and the
    /// receiving end of the command FIFO.
    pub fn new(
        client: C,
        config: &CloudConfig,
        health: Arc<SessionHealth>,
    ) -> (Self, TelemetryPublisher, mpsc::Receiver<Vec<u8>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
        let (outbound_tx, outbound_rx) = mpsc::channel(PUBLISH_QUEUE);

        let session = Self {
            client,
            topics: ThingTopics::new(&config.product_key, &config.device_name),
            health,
            reconnect_delay: config.reconnect_delay(),
            inbound: inbound_tx,
            outbound: outbound_rx,
        };
        let publisher = TelemetryPublisher::new(outbound_tx);

        (session, publisher, inbound_rx)
    }

    /// Keep the session up until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        loop {
            self.health.set_connecting();

            let established = {
                let connecting = Self::establish(&mut self.client, &self.topics.set);
                tokio::pin!(connecting);

                loop {
                    tokio::select! {
                        result = &mut connecting => break Some(result),
                        _ = shutdown.triggered() => break None,
                        Some(_) = self.outbound.recv() => {
                            warn!("Cloud session connecting, event dropped");
                        }
                    }
                }
            };
            let Some(established) = established else {
                break;
            };

            let failure = match established {
                Ok(()) => {
                    self.health.set_connected();
                    info!("Cloud session established, subscribed to {}", self.topics.set);

                    match self.serve(&mut shutdown).await {
                        Some(e) => e,
                        None => break,
                    }
                }
                Err(e) => e,
            };

            warn!("Cloud session down: {}", failure);
            self.health.record_failure(&failure.to_string());
            self.client.disconnect().await;

            if !self.wait_reconnect(&mut shutdown).await {
                break;
            }
        }

        self.client.disconnect().await;
        self.health.set_disconnected();
        info!("Cloud session closed");
    }

    async fn establish(client: &mut C, set_topic: &str) -> Result<(), CloudError> {
        client.connect().await?;
        client.subscribe(set_topic).await
    }

    /// Serve a live session. Returns the failure that ended it, or `None`
    /// on shutdown.
    async fn serve(&mut self, shutdown: &mut Shutdown) -> Option<CloudError> {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => return None,
                message = self.client.poll() => match message {
                    Ok(message) => self.deliver(message),
                    Err(e) => return Some(e),
                },
                Some(payload) = self.outbound.recv() => {
                    match self.client.publish(&self.topics.post, payload).await {
                        Ok(()) => debug!("Published event to {}", self.topics.post),
                        Err(e) => error!("Publish to {} failed: {}", self.topics.post, e),
                    }
                }
            }
        }
    }

    fn deliver(&self, message: InboundMessage) {
        if message.topic != self.topics.set {
            debug!("Ignoring message on {}", message.topic);
            return;
        }

        trace!("Command received: {}", String::from_utf8_lossy(&message.payload));
        if let Err(e) = self.inbound.try_send(message.payload) {
            warn!("Command dropped: {}", e);
        }
    }

    /// Wait out the reconnect delay, dropping telemetry meanwhile. Returns
    /// false on shutdown.
    async fn wait_reconnect(&mut self, shutdown: &mut Shutdown) -> bool {
        let delay = tokio::time::sleep(self.reconnect_delay);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                _ = &mut delay => return true,
                _ = shutdown.triggered() => return false,
                Some(_) = self.outbound.recv() => {
                    warn!("Cloud session down, event dropped");
                }
            }
        }
    }
}
