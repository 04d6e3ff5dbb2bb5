//! Fan-out of measurements to the configured outputs.
//!
//! Sinks are called in configuration order, each under its own timeout.
//! A failing sink never prevents the others from receiving the record.

use std::time::Duration;

use async_trait::async_trait;
use hems_common::Measurement;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by a single sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Formatting failed: {0}")]
    Format(#[from] hems_common::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Http(e.to_string())
    }
}

/// An output destination for measurements.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Upper bound on one delivery.
    fn timeout(&self) -> Duration;

    async fn deliver(&self, measurement: &Measurement) -> Result<(), SinkError>;
}

/// Per-sink outcome of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub results: Vec<(String, Result<(), SinkError>)>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.delivered()
    }

    /// True when at least one sink was attempted and every one failed.
    pub fn is_total_failure(&self) -> bool {
        !self.results.is_empty() && self.delivered() == 0
    }
}

/// Ordered set of sinks.
#[derive(Default)]
pub struct Dispatcher {
    sinks: Vec<Box<dyn Sink>>,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Hand `measurement` to every sink in order.
    pub async fn dispatch(&self, measurement: &Measurement) -> DispatchReport {
        if self.sinks.is_empty() {
            info!(?measurement, "No outputs configured");
            return DispatchReport::default();
        }

        let mut report = DispatchReport::default();
        for sink in &self.sinks {
            let limit = sink.timeout();
            let result = match tokio::time::timeout(limit, sink.deliver(measurement)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(limit)),
            };

            match &result {
                Ok(()) => debug!(sink = sink.name(), "Measurement delivered"),
                Err(e) => warn!(sink = sink.name(), error = %e, "Output failed"),
            }
            report.results.push((sink.name().to_string(), result));
        }

        if report.is_total_failure() {
            warn!(sinks = report.results.len(), "Every output failed");
        }
        report
    }
}
