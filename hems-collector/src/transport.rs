//! Serial transport to the Wi-SUN adapter.
//!
//! A single reader task splits the byte stream into CRLF lines, classifies
//! them with [`LineDecoder`], and queues the resulting [`AdapterEvent`]s.
//! The owning component sends commands and waits for the events it needs;
//! everything else is discarded.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::adapter::{AdapterEvent, Command, LineDecoder};
use crate::config::SerialConfig;
use crate::shutdown::Shutdown;

/// Capacity of the reader-to-consumer event queue.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Errors raised by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Adapter stream closed")]
    Closed,

    #[error("Command {pending} is still awaiting completion")]
    Busy { pending: &'static str },

    #[error("{command} failed: {code}")]
    CommandFailed { command: &'static str, code: String },

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Cancelled by shutdown")]
    Cancelled,
}

/// An open session with the adapter.
pub struct Transport {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    events: mpsc::Receiver<AdapterEvent>,
    pending: Option<&'static str>,
    shutdown: Shutdown,
    reader: JoinHandle<()>,
}

impl Transport {
    /// Wrap any byte stream speaking the adapter protocol.
    pub fn new<S>(stream: S, shutdown: Shutdown) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_events(read_half, tx));

        Self {
            writer: Box::new(write_half),
            events: rx,
            pending: None,
            shutdown,
            reader,
        }
    }

    /// Open the adapter's serial port (8N1, no flow control).
    pub fn open_serial(config: &SerialConfig, shutdown: Shutdown) -> Result<Self, TransportError> {
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None);

        let stream = tokio_serial::SerialStream::open(&builder)?;

        tracing::info!(port = %config.port, baud_rate = config.baud_rate, "Opened serial port");

        Ok(Self::new(stream, shutdown))
    }

    /// Write a command. Fails with `Busy` while a previous command's
    /// `OK`/`FAIL` has not been observed.
    pub async fn send_command(&mut self, command: &Command) -> Result<(), TransportError> {
        if self.shutdown.is_triggered() {
            return Err(TransportError::Cancelled);
        }
        if let Some(pending) = self.pending {
            return Err(TransportError::Busy { pending });
        }

        self.writer.write_all(&command.encode()).await?;
        self.writer.flush().await?;

        if command.expects_status() {
            self.pending = Some(command.name());
        }
        debug!(command = %command, "Sent adapter command");
        Ok(())
    }

    /// Wait for the first event matching `predicate`, discarding others.
    pub async fn await_event<F>(
        &mut self,
        mut predicate: F,
        timeout: Duration,
    ) -> Result<AdapterEvent, TransportError>
    where
        F: FnMut(&AdapterEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let event = self.next_event(deadline, timeout).await?;
            if predicate(&event) {
                return Ok(event);
            }
            trace!(?event, "Discarding adapter event");
        }
    }

    /// Send `command` and collect events until it completes.
    ///
    /// Returns the events seen before `OK` (echoes excluded), or
    /// `CommandFailed` on `FAIL`.
    pub async fn execute(
        &mut self,
        command: &Command,
        timeout: Duration,
    ) -> Result<Vec<AdapterEvent>, TransportError> {
        self.send_command(command).await?;

        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        loop {
            match self.next_event(deadline, timeout).await? {
                AdapterEvent::Ok => return Ok(collected),
                AdapterEvent::Fail(code) => {
                    return Err(TransportError::CommandFailed {
                        command: command.name(),
                        code,
                    });
                }
                AdapterEvent::Echo(_) => {}
                other => collected.push(other),
            }
        }
    }

    /// Whether a command's completion is still outstanding.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    async fn next_event(
        &mut self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<AdapterEvent, TransportError> {
        let received = tokio::select! {
            _ = self.shutdown.wait() => return Err(TransportError::Cancelled),
            received = tokio::time::timeout_at(deadline, self.events.recv()) => received,
        };

        match received {
            Err(_) => {
                if let Some(pending) = self.pending.take() {
                    warn!(command = pending, "Abandoning completion after timeout");
                }
                Err(TransportError::Timeout(timeout))
            }
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(event)) => {
                if event.is_status() {
                    self.pending = None;
                }
                Ok(event)
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_events<R>(stream: R, tx: mpsc::Sender<AdapterEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut decoder = LineDecoder::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Adapter read failed");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        trace!(line, "Adapter line");

        for event in decoder.decode(line) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }

    if let Some(event) = decoder.finish() {
        let _ = tx.send(event).await;
    }
    debug!("Adapter reader stopped");
}
