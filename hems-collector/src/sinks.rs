//! Output sinks: stdout, append-only files, HTTP webhooks and Zenoh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hems_common::{Measurement, OutputFormat, csv_header, encode};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::config::SinkConfig;
use crate::dispatch::{Sink, SinkError};

/// Timeout for sinks without a configurable one.
const LOCAL_SINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Prints one formatted record per line.
#[derive(Debug)]
pub struct StdoutSink {
    format: OutputFormat,
}

impl StdoutSink {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    fn timeout(&self) -> Duration {
        LOCAL_SINK_TIMEOUT
    }

    async fn deliver(&self, measurement: &Measurement) -> Result<(), SinkError> {
        let line = format!("{}\n", encode(measurement, self.format)?);
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Appends records to a file, writing the CSV header into an empty file.
#[derive(Debug)]
pub struct FileSink {
    name: String,
    path: PathBuf,
    format: OutputFormat,
}

impl FileSink {
    /// `path` gets the format's extension unless it already ends in one of
    /// the output format extensions.
    pub fn new(path: &Path, format: OutputFormat) -> Self {
        let path = with_extension(path, format);
        Self {
            name: format!("file:{}", path.display()),
            path,
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Extensions taken as naming an output format already.
const FORMAT_EXTENSIONS: [&str; 3] = ["json", "yaml", "csv"];

fn with_extension(path: &Path, format: OutputFormat) -> PathBuf {
    let named = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| FORMAT_EXTENSIONS.contains(&ext));
    if named {
        return path.to_path_buf();
    }
    let mut name = path.as_os_str().to_owned();
    name.push(format.extension());
    PathBuf::from(name)
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        LOCAL_SINK_TIMEOUT
    }

    async fn deliver(&self, measurement: &Measurement) -> Result<(), SinkError> {
        let record = encode(measurement, self.format)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut text = String::new();
        if self.format == OutputFormat::Csv && file.metadata().await?.len() == 0 {
            text.push_str(&csv_header());
            text.push('\n');
        }
        text.push_str(&record);
        text.push('\n');

        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// POSTs the JSON record to an HTTP endpoint.
#[derive(Debug)]
pub struct WebhookSink {
    name: String,
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: format!("webhook:{}", url),
            url: url.to_string(),
            timeout,
            client,
        })
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn deliver(&self, measurement: &Measurement) -> Result<(), SinkError> {
        let body = encode(measurement, OutputFormat::Json)?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, OutputFormat::Json.mime_type())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Http(format!("{} responded {}", self.url, status)));
        }
        Ok(())
    }
}

/// Publishes the JSON record on a Zenoh key expression.
#[derive(Debug)]
pub struct PubsubSink {
    name: String,
    key: String,
    timeout: Duration,
    session: Arc<zenoh::Session>,
}

impl PubsubSink {
    pub fn new(session: Arc<zenoh::Session>, key: &str, timeout: Duration) -> Self {
        Self {
            name: format!("pubsub:{}", key),
            key: key.to_string(),
            timeout,
            session,
        }
    }
}

#[async_trait]
impl Sink for PubsubSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn deliver(&self, measurement: &Measurement) -> Result<(), SinkError> {
        let payload = encode(measurement, OutputFormat::Json)?;
        self.session
            .put(&self.key, payload)
            .await
            .map_err(|e| SinkError::Publish(e.to_string()))
    }
}

/// Build sinks in configuration order.
///
/// `zenoh` must be provided when any `pubsub` output is configured.
pub fn build_sinks(
    configs: &[SinkConfig],
    zenoh: Option<Arc<zenoh::Session>>,
) -> Result<Vec<Box<dyn Sink>>, SinkError> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::with_capacity(configs.len());

    for config in configs {
        let sink: Box<dyn Sink> = match config {
            SinkConfig::Stdout { format } => Box::new(StdoutSink::new(*format)),
            SinkConfig::File { format, path } => Box::new(FileSink::new(path, *format)),
            SinkConfig::Webhook { url, timeout_secs } => {
                Box::new(WebhookSink::new(url, Duration::from_secs(*timeout_secs))?)
            }
            SinkConfig::Pubsub { key, timeout_secs } => {
                let session = zenoh.clone().ok_or_else(|| {
                    SinkError::Publish(format!("No Zenoh session for output '{}'", key))
                })?;
                Box::new(PubsubSink::new(
                    session,
                    key,
                    Duration::from_secs(*timeout_secs),
                ))
            }
        };
        info!(sink = sink.name(), "Configured output");
        sinks.push(sink);
    }

    Ok(sinks)
}
