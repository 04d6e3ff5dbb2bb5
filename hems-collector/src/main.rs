//! Smart-meter collector.
//!
//! Joins the meter's Wi-SUN B-route through a serial adapter and forwards
//! scheduled ECHONET Lite readings to the configured outputs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hems_collector::config::{CollectorConfig, SinkConfig};
use hems_collector::dispatch::Dispatcher;
use hems_collector::meter::SmartMeter;
use hems_collector::scheduler::Scheduler;
use hems_collector::shutdown::Shutdown;
use hems_collector::sinks::build_sinks;
use hems_common::LoggingConfig;
use tracing::{info, warn};

/// Wi-SUN B-route smart-meter collector.
#[derive(Parser, Debug)]
#[command(name = "hems-collector")]
#[command(about = "Reads a smart meter over Wi-SUN and forwards measurements")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "hems.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Shorthand for `--log-level debug`.
    #[arg(long, conflicts_with = "log_level")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = CollectorConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let level = if args.debug {
        "debug".to_string()
    } else {
        args.log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone())
    };
    let log_config = LoggingConfig {
        level,
        format: config.logging.format,
    };
    hems_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting hems-collector");
    info!("Loaded configuration from {:?}", args.config);

    let needs_zenoh = config
        .outputs
        .iter()
        .any(|o| matches!(o, SinkConfig::Pubsub { .. }));
    let zenoh = if needs_zenoh {
        let session = hems_common::connect(&config.zenoh)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?;
        Some(Arc::new(session))
    } else {
        None
    };

    let sinks = build_sinks(&config.outputs, zenoh.clone()).context("Failed to build outputs")?;
    let dispatcher = Dispatcher::new(sinks);
    if dispatcher.is_empty() {
        warn!("No outputs configured, measurements will only be logged");
    } else {
        info!(outputs = dispatcher.len(), "Outputs ready");
    }

    let (trigger, shutdown) = Shutdown::channel();
    let meter = SmartMeter::serial(&config, shutdown.clone())?;
    let mut scheduler = Scheduler::new(meter, dispatcher, &config.scheduler, shutdown)?;

    let task = tokio::spawn(async move { scheduler.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    trigger.trigger();

    task.await.context("Scheduler task failed")?;

    if let Some(session) = zenoh {
        session
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    }
    info!("hems-collector stopped");

    Ok(())
}
