//! EdgeLink field gateway.
//!
//! Bridges an MQTT IoT hub and a LoRa field network of Modbus-style
//! controllers reached through a WebSocket radio relay.
//!
//! # Data flow
//!
//! ```text
//! cloud set topic ──> CloudSession ──> Bridge::run_commands ──> TransportQueue (high)
//! PollingScheduler ─────────────────────────────────────────> TransportQueue (normal)
//! TransportQueue ──> RadioLink (paced) ──> relay ──> field node
//! field node ──> relay ──> RadioLink ──> Bridge::run_replies ──> CloudSession post topic
//! ```
//!
//! Commands always overtake polling reads; the link sends at most one frame
//! per pacing interval whatever its priority.

pub mod bridge;
pub mod cloud;
pub mod command;
pub mod config;
pub mod frame;
pub mod link;
pub mod poller;
pub mod registry;
pub mod transport;
pub mod weather;
