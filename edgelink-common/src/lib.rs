//! EdgeLink Common Library
//!
//! This crate provides shared types and utilities for the EdgeLink gateway:
//!
//! - [`thing`] - Cloud "thing" message model (`ThingMessage`, `ThingTopics`, `MessageIds`)
//! - [`config`] - Logging settings shared by every bridge configuration
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod thing;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use thing::{
    METHOD_PROPERTY_POST, MessageIds, NODE_SERIAL_KEY, ThingMessage, ThingTopics,
};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// Every event carries its source file and line. `RUST_LOG` takes
/// precedence over the configured level.
///
/// # Example
///
/// ```ignore
/// use edgelink_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "debug1".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_file(true).with_line_number(true))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_file(true).with_line_number(true))
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
