//! EdgeLink Bridge Framework
//!
//! Common abstractions for building long-running bridges between an IoT
//! cloud and field equipment.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`Shutdown`] for cooperative worker shutdown
//! - [`SessionHealth`] for tracking external session state
//! - [`BridgeArgs`] for common CLI argument parsing
//!
//! # Example
//!
//! ```ignore
//! use edgelink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))?;
//!
//!     // Spawn protocol-specific workers
//!     runner.spawn(my_worker(runner.shutdown()));
//!
//!     // Run until Ctrl+C / SIGTERM
//!     runner.run().await
//! }
//! ```

mod args;
mod config;
mod error;
mod health;
mod runner;
mod shutdown;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use health::{HealthSnapshot, SessionHealth, SessionState};
pub use runner::BridgeRunner;
pub use shutdown::{Shutdown, ShutdownTrigger, shutdown_channel};

// Re-export commonly used types from edgelink-common
pub use edgelink_common::{LogFormat, LoggingConfig};
