//! EdgeLink field gateway.
//!
//! Connects to the IoT hub over MQTT and to the LoRa relay over WebSocket,
//! turns cloud commands into controller writes, polls controller state and
//! reports every reply back as telemetry.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use edgelink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner, SessionHealth, SessionState};
use edgelink_gateway::bridge::Bridge;
use edgelink_gateway::cloud::{CloudSession, MqttCloudClient};
use edgelink_gateway::config::GatewayConfig;
use edgelink_gateway::link::RadioLink;
use edgelink_gateway::poller::PollingScheduler;
use edgelink_gateway::registry::Registry;
use edgelink_gateway::transport::TransportQueue;
use edgelink_gateway::weather::WeatherStation;

/// Relay replies waiting for the bridge.
const REPLY_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("edgelink.json5");
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut runner = BridgeRunner::new_with_args("edgelink-gateway", config, Some(&args))?;
    let config = runner.config().clone();
    info!("Loaded configuration from {:?}", args.config);

    let registry = Registry::load(&config.switches_file)
        .with_context(|| format!("Failed to load switches from {:?}", config.switches_file))?
        .with_field_nodes(config.lora.nodes.iter().cloned());
    let registry = Arc::new(registry);
    info!(
        "{} switch(es) on {} controller(s), {} field node(s)",
        registry.switch_count(),
        registry.controllers().count(),
        registry.field_nodes().len()
    );

    let queue = Arc::new(TransportQueue::new());
    let cloud_health = Arc::new(SessionHealth::new("cloud"));
    let lora_health = Arc::new(SessionHealth::new("lora"));

    // Cloud session
    let client = MqttCloudClient::new(&config.cloud).context("Failed to sign device")?;
    let (session, publisher, commands) = CloudSession::new(client, &config.cloud, cloud_health.clone());
    runner.spawn(session.run(runner.shutdown()));

    // Radio link
    let (reply_tx, replies) = mpsc::channel(REPLY_QUEUE);
    let link = RadioLink::new(&config.lora, queue.clone(), reply_tx, lora_health.clone());
    runner.spawn(link.run(runner.shutdown()));

    // Bridge workers
    let bridge = Arc::new(Bridge::new(
        registry.clone(),
        queue.clone(),
        publisher,
        config.weather_station.clone().map(WeatherStation::new),
        config.lora.verify_reply_crc,
    ));
    runner.spawn(bridge.clone().run_commands(commands, runner.shutdown()));
    runner.spawn(bridge.run_replies(replies, runner.shutdown()));

    // Status polling
    let scheduler = PollingScheduler::new(
        registry,
        queue,
        config.polling.clone(),
        config.weather_station.clone(),
    );
    runner.spawn(scheduler.run(runner.shutdown()));

    for health in [cloud_health, lora_health] {
        let name = format!("{}-session", health.name());
        runner.on_shutdown(name, async move {
            let mut state = health.subscribe();
            let _ = state.wait_for(|s| *s == SessionState::Disconnected).await;
            let snapshot = health.snapshot();
            info!(
                "Session '{}' closed: {} connect(s), {} failure(s)",
                snapshot.session, snapshot.connects, snapshot.failures
            );
        });
    }

    runner.run().await?;
    Ok(())
}
