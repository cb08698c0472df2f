//! Configuration for the field gateway.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use edgelink_bridge_framework::{BridgeConfig, BridgeError, LoggingConfig};

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// IoT hub connection and device credentials
    pub cloud: CloudConfig,

    /// Radio-relay (LoRa network server) settings
    pub lora: LoraConfig,

    /// Weather station attached to one of the field nodes
    #[serde(default)]
    pub weather_station: Option<WeatherStationConfig>,

    /// Status polling cadence
    #[serde(default)]
    pub polling: PollingConfig,

    /// Switch definition file
    #[serde(default = "default_switches_file")]
    pub switches_file: PathBuf,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_switches_file() -> PathBuf {
    PathBuf::from("switches.json")
}

/// IoT hub connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Product key of the gateway device
    #[serde(default)]
    pub product_key: String,

    /// Device name of the gateway
    #[serde(default)]
    pub device_name: String,

    /// Device secret used to sign the connection
    #[serde(default)]
    pub device_secret: String,

    /// Hub region (used to derive the host name)
    #[serde(default = "default_region")]
    pub region: String,

    /// Explicit broker host, overrides the derived one
    #[serde(default)]
    pub host: Option<String>,

    /// Broker port (default: 443)
    #[serde(default = "default_cloud_port")]
    pub port: u16,

    /// Use TLS (default: true)
    #[serde(default = "default_true")]
    pub tls: bool,

    /// MQTT keep-alive in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Fixed delay between reconnect attempts in milliseconds
    #[serde(default = "default_cloud_reconnect_ms")]
    pub reconnect_delay_ms: u64,

    /// Capacity of the inbound command FIFO
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

fn default_region() -> String {
    "cn-shanghai".to_string()
}

fn default_cloud_port() -> u16 {
    443
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    600
}

fn default_cloud_reconnect_ms() -> u64 {
    1000
}

fn default_inbound_queue() -> usize {
    256
}

impl CloudConfig {
    /// Broker host name.
    pub fn broker_host(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => format!("{}.iot-as-mqtt.{}.aliyuncs.com", self.product_key, self.region),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Radio-relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Device addresses of the field nodes
    #[serde(default)]
    pub nodes: Vec<String>,

    /// WebSocket URL of the relay server
    pub websocket_url: String,

    /// Relay port number carried in every frame
    #[serde(default = "default_relay_port")]
    pub port: u8,

    /// Quiet time after each transmission in milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Fixed delay between reconnect attempts in milliseconds
    #[serde(default = "default_lora_reconnect_ms")]
    pub reconnect_delay_ms: u64,

    /// Drop replies whose trailing CRC does not match
    #[serde(default = "default_true")]
    pub verify_reply_crc: bool,
}

fn default_relay_port() -> u8 {
    2
}

fn default_pacing_ms() -> u64 {
    3500
}

fn default_lora_reconnect_ms() -> u64 {
    2000
}

impl LoraConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Weather station sensors, all behind one field node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherStationConfig {
    /// Device address of the node the station hangs off
    pub devaddr: String,

    /// 485 address of the temperature/humidity sensor
    #[serde(default)]
    pub temp_humi_addr: Option<u8>,

    /// 485 address of the wind direction sensor
    #[serde(default)]
    pub wind_dir_addr: Option<u8>,

    /// 485 address of the wind speed sensor
    #[serde(default)]
    pub wind_speed_addr: Option<u8>,

    /// Serial reported as `loraNodeSerialNo` on weather events
    #[serde(default = "default_report_serial")]
    pub report_serial: String,
}

fn default_report_serial() -> String {
    "00000000".to_string()
}

impl WeatherStationConfig {
    /// Configured sensor addresses, in polling order.
    pub fn sensor_addresses(&self) -> Vec<u8> {
        [self.temp_humi_addr, self.wind_dir_addr, self.wind_speed_addr]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Modbus limit on registers in one read request.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Status polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Run the polling scheduler
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Most registers one read request may cover
    #[serde(default = "default_max_registers")]
    pub max_registers_per_read: u16,

    /// Wait between consecutive read requests in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Wait between controllers and weather sensors in milliseconds
    #[serde(default = "default_controller_gap_ms")]
    pub controller_gap_ms: u64,

    /// Wait between polling passes in seconds
    #[serde(default = "default_pass_interval")]
    pub pass_interval_secs: u64,

    /// Include weather sensors in each pass
    #[serde(default = "default_true")]
    pub poll_weather: bool,
}

fn default_max_registers() -> u16 {
    16
}

fn default_settle_ms() -> u64 {
    4000
}

fn default_controller_gap_ms() -> u64 {
    6000
}

fn default_pass_interval() -> u64 {
    6
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_registers_per_read: default_max_registers(),
            settle_ms: default_settle_ms(),
            controller_gap_ms: default_controller_gap_ms(),
            pass_interval_secs: default_pass_interval(),
            poll_weather: true,
        }
    }
}

impl PollingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn controller_gap(&self) -> Duration {
        Duration::from_millis(self.controller_gap_ms)
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }
}

impl BridgeConfig for GatewayConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.cloud.product_key.is_empty() {
            return Err(BridgeError::validation("cloud.product_key is required"));
        }

        if self.cloud.device_name.is_empty() {
            return Err(BridgeError::validation("cloud.device_name is required"));
        }

        if self.cloud.device_secret.is_empty() {
            return Err(BridgeError::validation("cloud.device_secret is required"));
        }

        if self.cloud.keep_alive_secs < 5 {
            return Err(BridgeError::validation(
                "cloud.keep_alive_secs must be at least 5",
            ));
        }

        if self.cloud.inbound_queue == 0 {
            return Err(BridgeError::validation(
                "cloud.inbound_queue must be at least 1",
            ));
        }

        if self.lora.websocket_url.is_empty() {
            return Err(BridgeError::validation("lora.websocket_url is required"));
        }

        if self.lora.nodes.iter().any(|n| n.trim().is_empty()) {
            return Err(BridgeError::validation(
                "lora.nodes must not contain empty device addresses",
            ));
        }

        if !(1..=MAX_REGISTERS_PER_READ).contains(&self.polling.max_registers_per_read) {
            return Err(BridgeError::validation(format!(
                "polling.max_registers_per_read must be between 1 and {}",
                MAX_REGISTERS_PER_READ
            )));
        }

        if let Some(station) = &self.weather_station {
            if station.devaddr.is_empty() {
                return Err(BridgeError::validation(
                    "weather_station.devaddr is required when a station is configured",
                ));
            }
        }

        Ok(())
    }
}
