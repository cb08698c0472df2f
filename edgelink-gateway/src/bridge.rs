//! Bridge between cloud commands and field replies.
//!
//! Two workers share one [`Bridge`]:
//!
//! - the command worker drains the cloud FIFO, resolves each command
//!   through the [`Registry`] and queues one high-priority write per switch;
//! - the reply worker drains relay replies, decodes them (weather station
//!   or controller registers) and publishes telemetry events.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use edgelink_bridge_framework::Shutdown;
use edgelink_common::NODE_SERIAL_KEY;

use crate::cloud::TelemetryPublisher;
use crate::command::CloudCommand;
use crate::frame::{FrameError, ReplyFrame, decode_hex};
use crate::link::RelayMessage;
use crate::registry::{Registry, ValueKind};
use crate::transport::TransportQueue;
use crate::weather::{WeatherError, WeatherStation};

/// Error type for field reply handling.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Weather(#[from] WeatherError),
    #[error("Reply from unknown controller {0:#04x}")]
    UnknownController(u8),
}

/// Shared state of the two bridge workers.
pub struct Bridge {
    registry: Arc<Registry>,
    queue: Arc<TransportQueue>,
    publisher: TelemetryPublisher,
    weather: Option<WeatherStation>,
    verify_reply_crc: bool,
}

impl Bridge {
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<TransportQueue>,
        publisher: TelemetryPublisher,
        weather: Option<WeatherStation>,
        verify_reply_crc: bool,
    ) -> Self {
        Self {
            registry,
            queue,
            publisher,
            weather,
            verify_reply_crc,
        }
    }

    /// Handle one set-topic payload. Returns the number of writes queued.
    pub fn handle_command(&self, payload: &[u8]) -> usize {
        let command = match CloudCommand::parse(payload) {
            Ok(command) => command,
            Err(e) => {
                error!("Dropping cloud command: {}", e);
                return 0;
            }
        };

        let frames = command.resolve(&self.registry);
        let count = frames.len();
        for frame in frames {
            self.queue.enqueue(frame);
        }

        info!(
            "Command for node {}: {} of {} switch(es) queued",
            command.node,
            count,
            command.assignments.len()
        );
        count
    }

    /// Handle one relay reply. Returns the id of the published event.
    pub fn handle_reply(&self, message: &RelayMessage) -> Option<u64> {
        let params = match self.decode_reply(message) {
            Ok(Some(params)) => params,
            Ok(None) => return None,
            Err(e) => {
                warn!("Dropping reply from {}: {}", message.devaddr, e);
                return None;
            }
        };

        self.publisher.publish(params)
    }

    /// Decode a reply into event parameters.
    ///
    /// `Ok(None)` means there was nothing to report.
    pub fn decode_reply(
        &self,
        message: &RelayMessage,
    ) -> Result<Option<Map<String, Value>>, ReplyError> {
        let bytes = decode_hex(&message.data)?;

        if let Some(station) = self.weather.as_ref().filter(|s| s.matches(&message.devaddr)) {
            debug!("Weather station reply: {}", message.data);
            let reading = station.decode(&bytes, self.verify_reply_crc)?;
            return Ok(Some(reading.to_params(station.report_serial())));
        }

        debug!("Controller reply from {}: {}", message.devaddr, message.data);
        self.decode_switches(&message.devaddr, &bytes)
    }

    fn decode_switches(
        &self,
        devaddr: &str,
        bytes: &[u8],
    ) -> Result<Option<Map<String, Value>>, ReplyError> {
        let reply = ReplyFrame::parse(bytes, self.verify_reply_crc)?;
        let profile = self
            .registry
            .lookup_controller(reply.address)
            .ok_or(ReplyError::UnknownController(reply.address))?;

        let width = reply.width();
        if let Some(recorded) = profile.width_of(reply.start) {
            if recorded != width {
                warn!(
                    "plc={:#04x} channel {} is registered as {:?} but replies as {:?}",
                    reply.address, reply.start, recorded, width
                );
            }
        }

        let mut params = Map::new();
        params.insert(NODE_SERIAL_KEY.to_string(), Value::from(devaddr));

        let mut named = 0;
        for (channel, raw) in reply.values() {
            let Some(name) = profile.switch_name(channel) else {
                trace!("plc={:#04x} channel {} has no switch", reply.address, channel);
                continue;
            };
            let kind = self
                .registry
                .lookup_switch(name)
                .map_or(ValueKind::Integer, |s| s.kind);
            params.insert(name.to_string(), kind.to_cloud(raw));
            named += 1;
        }

        if named == 0 {
            debug!("plc={:#04x}: no named channels in reply", reply.address);
            return Ok(None);
        }
        Ok(Some(params))
    }

    /// Drain the cloud command FIFO until shutdown.
    pub async fn run_commands(self: Arc<Self>, mut commands: mpsc::Receiver<Vec<u8>>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                payload = commands.recv() => match payload {
                    Some(payload) => {
                        self.handle_command(&payload);
                    }
                    None => break,
                },
            }
        }
        debug!("Command worker stopped");
    }

    /// Drain field replies until shutdown.
    pub async fn run_replies(self: Arc<Self>, mut replies: mpsc::Receiver<RelayMessage>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                message = replies.recv() => match message {
                    Some(message) => {
                        self.handle_reply(&message);
                    }
                    None => break,
                },
            }
        }
        debug!("Reply worker stopped");
    }
}
