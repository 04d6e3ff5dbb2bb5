//! HEMS Common Library
//!
//! Shared types and utilities for the smart-meter collector:
//!
//! - [`measurement`] - The normalized `Measurement` record handed to outputs
//! - [`serialization`] - JSON/YAML/CSV rendering of records
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`session`] - Zenoh session management for the pub/sub output
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod measurement;
pub mod serialization;
pub mod session;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, ZenohConfig, parse_config};
pub use error::{Error, Result};
pub use measurement::Measurement;
pub use serialization::{OutputFormat, csv_header, encode};
pub use session::connect;

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG`, when set, takes precedence over `config.level`.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
