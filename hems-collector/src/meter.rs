//! Connection to the smart meter as seen by the scheduler.

use async_trait::async_trait;
use chrono::Utc;
use hems_common::Measurement;
use tracing::{info, warn};

use crate::acquisition::{Acquirer, AcquisitionError};
use crate::config::{CollectorConfig, ConfigError};
use crate::join::{JoinError, JoinMachine, Session};
use crate::shutdown::Shutdown;
use crate::transport::{Transport, TransportError};

/// Joins on demand and reads measurements.
#[async_trait]
pub trait MeterLink: Send {
    fn is_connected(&self) -> bool;

    /// Join the meter's network unless a session is already up.
    async fn ensure_connected(&mut self) -> Result<(), JoinError>;

    async fn acquire(&mut self) -> Result<Measurement, AcquisitionError>;

    /// Drop the session and the adapter link; the next cycle starts over.
    fn invalidate(&mut self);
}

/// Opens a fresh link to the adapter.
pub type Opener = Box<dyn FnMut() -> Result<Transport, TransportError> + Send>;

/// The B-route meter behind a Wi-SUN adapter.
pub struct SmartMeter {
    open: Opener,
    transport: Option<Transport>,
    session: Option<Session>,
    join: JoinMachine,
    acquirer: Acquirer,
}

impl SmartMeter {
    pub fn new(
        config: &CollectorConfig,
        open: Opener,
        shutdown: Shutdown,
    ) -> Result<Self, ConfigError> {
        let join = JoinMachine::new(
            config.join.clone(),
            config.broute.clone(),
            config.meter.identity()?,
            shutdown,
        )?;
        let acquirer = Acquirer::new(
            config.acquisition.clone(),
            config.scheduler.source_offset()?,
        );

        Ok(Self {
            open,
            transport: None,
            session: None,
            join,
            acquirer,
        })
    }

    /// Meter reached through the configured serial port.
    pub fn serial(config: &CollectorConfig, shutdown: Shutdown) -> Result<Self, ConfigError> {
        let serial = config.serial.clone();
        let port_shutdown = shutdown.clone();
        let open: Opener = Box::new(move || Transport::open_serial(&serial, port_shutdown.clone()));
        Self::new(config, open, shutdown)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
}

#[async_trait]
impl MeterLink for SmartMeter {
    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn ensure_connected(&mut self) -> Result<(), JoinError> {
        if self.session.is_some() {
            return Ok(());
        }

        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => (self.open)()?,
        };
        let transport = self.transport.insert(transport);

        let mut machine = self.join.clone();
        match machine.run(transport).await {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                if matches!(e, JoinError::Transport(_)) {
                    self.transport = None;
                }
                Err(e)
            }
        }
    }

    async fn acquire(&mut self) -> Result<Measurement, AcquisitionError> {
        let (Some(transport), Some(session)) = (&mut self.transport, &mut self.session) else {
            return Err(AcquisitionError::Transport(TransportError::Closed));
        };

        let result = self.acquirer.acquire(transport, session).await;

        if let Err(e) = &result {
            if e.tears_down_session() {
                let age_secs = (Utc::now() - session.established_at()).num_seconds();
                warn!(error = %e, age_secs, "Dropping meter session");
                self.session = None;
                if matches!(e, AcquisitionError::Transport(_)) {
                    self.transport = None;
                }
            }
        }
        result
    }

    fn invalidate(&mut self) {
        if self.session.take().is_some() {
            info!("Meter session invalidated");
        }
        self.transport = None;
    }
}
