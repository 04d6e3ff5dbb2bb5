//! Network join state machine: active scan, then PANA authentication.
//!
//! ```text
//! Idle ──▶ Scanning ──▶ Authenticating ──▶ Connected
//!   │          │               │
//!   │          ▼               ▼
//!   └─(identity supplied)──▶ Failed (after bounded retries)
//! ```
//!
//! Scanning is skipped when the meter's channel, PAN ID and address are
//! configured. Authentication failures retry the whole phase with
//! exponential backoff.

use std::net::Ipv6Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterEvent, Command, PanDescriptor, event};
use crate::config::{BrouteConfig, ConfigError, JoinConfig};
use crate::properties::EnergyScale;
use crate::shutdown::Shutdown;
use crate::transport::{Transport, TransportError};

/// Longest scan duration the adapter accepts.
const MAX_SCAN_DURATION: u8 = 14;

/// Channel mask covering every channel.
const ALL_CHANNELS: u32 = 0xFFFF_FFFF;

/// Errors raised while joining the meter's network.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("No PAN found after {attempts} scan attempts")]
    NoNetworkFound { attempts: u32 },

    #[error("Authentication rejected by the meter")]
    Rejected,

    #[error("Timed out waiting for {phase}")]
    Timeout { phase: &'static str },

    #[error("Join failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<JoinError> },

    #[error("Join state machine already failed")]
    Terminal,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl From<TransportError> for JoinError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => JoinError::Cancelled,
            other => JoinError::Transport(other),
        }
    }
}

impl JoinError {
    fn waiting(phase: &'static str, e: TransportError) -> Self {
        match e {
            TransportError::Timeout(_) => JoinError::Timeout { phase },
            other => other.into(),
        }
    }

    /// Whether another authentication phase may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            JoinError::Rejected | JoinError::Timeout { .. } => true,
            JoinError::Transport(e) => matches!(
                e,
                TransportError::Timeout(_)
                    | TransportError::CommandFailed { .. }
                    | TransportError::Busy { .. }
            ),
            _ => false,
        }
    }
}

/// Where the meter lives on the radio network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub channel: u8,
    pub pan_id: u16,
    /// MAC address (16 hex digits), known only after a scan.
    pub mac: Option<String>,
    pub address: Ipv6Addr,
}

/// Join progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Authenticating,
    Connected,
    Failed,
}

/// An authenticated session with the meter.
///
/// Built once by the join machine and dropped on failure; caches live for
/// exactly as long as the session.
#[derive(Debug)]
pub struct Session {
    identity: NetworkIdentity,
    established_at: DateTime<Utc>,
    pub(crate) energy_scale: Option<EnergyScale>,
    pub(crate) history_day: Option<u8>,
    next_tid: u16,
}

impl Session {
    pub fn new(identity: NetworkIdentity) -> Self {
        Self {
            identity,
            established_at: Utc::now(),
            energy_scale: None,
            history_day: None,
            next_tid: 1,
        }
    }

    pub fn identity(&self) -> &NetworkIdentity {
        &self.identity
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub fn energy_scale(&self) -> Option<EnergyScale> {
        self.energy_scale
    }

    /// Transaction ID for the next ECHONET Lite request.
    pub fn next_tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }
}

/// Doubling delay between join phase attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Drives one join from `Idle` to `Connected` or `Failed`.
#[derive(Debug, Clone)]
pub struct JoinMachine {
    config: JoinConfig,
    channel_mask: u32,
    credentials: BrouteConfig,
    identity: Option<NetworkIdentity>,
    state: SessionState,
    shutdown: Shutdown,
}

impl JoinMachine {
    pub fn new(
        config: JoinConfig,
        credentials: BrouteConfig,
        identity: Option<NetworkIdentity>,
        shutdown: Shutdown,
    ) -> Result<Self, ConfigError> {
        let channel_mask = config.channel_mask()?;
        Ok(Self {
            config,
            channel_mask,
            credentials,
            identity,
            state: SessionState::Idle,
            shutdown,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the join to completion.
    pub async fn run(&mut self, transport: &mut Transport) -> Result<Session, JoinError> {
        if self.state == SessionState::Failed {
            return Err(JoinError::Terminal);
        }

        let result = self.join(transport).await;
        self.state = match &result {
            Ok(_) => SessionState::Connected,
            Err(_) => SessionState::Failed,
        };
        result
    }

    async fn join(&mut self, transport: &mut Transport) -> Result<Session, JoinError> {
        let version = transport
            .execute(&Command::Version, self.config.command_timeout())
            .await?;
        for reply in version {
            if let AdapterEvent::Version(v) = reply {
                info!(firmware = %v, "Wi-SUN adapter ready");
            }
        }

        let mut backoff = Backoff::new(self.config.initial_backoff(), self.config.max_backoff());
        let attempts = self.config.max_join_attempts;
        let mut last = None;

        for attempt in 1..=attempts {
            match self.attempt(transport).await {
                Ok(session) => {
                    info!(
                        attempt,
                        channel = %format!("{:02X}", session.identity.channel),
                        pan_id = %format!("{:04X}", session.identity.pan_id),
                        address = %session.identity.address,
                        "Joined smart meter network"
                    );
                    return Ok(session);
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, max_attempts = attempts, error = %e, "Join attempt failed");
                    if attempt < attempts {
                        let delay = backoff.next_delay();
                        debug!(?delay, "Backing off before next join attempt");
                        tokio::select! {
                            _ = self.shutdown.wait() => return Err(JoinError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(JoinError::Exhausted {
            attempts,
            last: Box::new(last.unwrap_or(JoinError::Rejected)),
        })
    }

    async fn attempt(&mut self, transport: &mut Transport) -> Result<Session, JoinError> {
        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None => {
                self.state = SessionState::Scanning;
                self.scan(transport).await?
            }
        };

        self.state = SessionState::Authenticating;
        self.authenticate(transport, &identity).await?;
        Ok(Session::new(identity))
    }

    async fn scan(&mut self, transport: &mut Transport) -> Result<NetworkIdentity, JoinError> {
        let mut mask = self.channel_mask;
        let mut duration = self.config.scan_duration;
        let attempts = self.config.max_scan_attempts;

        for attempt in 1..=attempts {
            if attempt > 1 {
                mask = ALL_CHANNELS;
                duration = (duration + 1).min(MAX_SCAN_DURATION);
            }

            info!(
                attempt,
                channel_mask = %format!("{:08X}", mask),
                duration,
                "Starting active scan"
            );

            let found = self.scan_once(transport, mask, duration).await?;
            match found.into_iter().max_by_key(|d| d.lqi) {
                Some(best) => {
                    info!(
                        channel = %format!("{:02X}", best.channel),
                        pan_id = %format!("{:04X}", best.pan_id),
                        mac = %best.mac,
                        lqi = best.lqi,
                        "Selected PAN"
                    );
                    return self.resolve(transport, best).await;
                }
                None => warn!(attempt, "Scan found no PAN"),
            }
        }

        Err(JoinError::NoNetworkFound { attempts })
    }

    /// One `SKSCAN`; a scan that does not finish in time yields what it saw.
    async fn scan_once(
        &mut self,
        transport: &mut Transport,
        channel_mask: u32,
        duration: u8,
    ) -> Result<Vec<PanDescriptor>, JoinError> {
        transport
            .send_command(&Command::ActiveScan {
                channel_mask,
                duration,
            })
            .await?;

        let deadline = Instant::now() + self.config.scan_timeout();
        let mut found = Vec::new();
        // Anything before this scan's OK belongs to an earlier scan.
        let mut acknowledged = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = transport
                .await_event(
                    |e| {
                        matches!(
                            e,
                            AdapterEvent::Ok
                                | AdapterEvent::PanDescriptor(_)
                                | AdapterEvent::Fail(_)
                        ) || e.event_code() == Some(event::SCAN_COMPLETE)
                    },
                    remaining,
                )
                .await;

            match next {
                Ok(AdapterEvent::Ok) => acknowledged = true,
                Ok(stale) if !acknowledged && !matches!(stale, AdapterEvent::Fail(_)) => {
                    debug!(event = ?stale, "Ignoring event from an earlier scan");
                }
                Ok(AdapterEvent::PanDescriptor(descriptor)) => {
                    debug!(?descriptor, "PAN descriptor");
                    found.push(descriptor);
                }
                Ok(AdapterEvent::Fail(code)) => {
                    return Err(JoinError::Transport(TransportError::CommandFailed {
                        command: "SKSCAN",
                        code,
                    }));
                }
                Ok(_) => return Ok(found),
                Err(TransportError::Timeout(_)) => {
                    warn!("Scan did not complete in time");
                    return Ok(found);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Convert the chosen PAN's MAC to its link-local address.
    async fn resolve(
        &mut self,
        transport: &mut Transport,
        pan: PanDescriptor,
    ) -> Result<NetworkIdentity, JoinError> {
        transport
            .send_command(&Command::LinkLocal(pan.mac.clone()))
            .await?;
        let event = transport
            .await_event(
                |e| matches!(e, AdapterEvent::Address(_)),
                self.config.command_timeout(),
            )
            .await
            .map_err(|e| JoinError::waiting("SKLL64 address", e))?;

        let AdapterEvent::Address(address) = event else {
            return Err(JoinError::Timeout {
                phase: "SKLL64 address",
            });
        };

        Ok(NetworkIdentity {
            channel: pan.channel,
            pan_id: pan.pan_id,
            mac: Some(pan.mac),
            address,
        })
    }

    async fn authenticate(
        &mut self,
        transport: &mut Transport,
        identity: &NetworkIdentity,
    ) -> Result<(), JoinError> {
        let timeout = self.config.command_timeout();

        transport
            .execute(&Command::SetRouteBId(self.credentials.id.clone()), timeout)
            .await?;
        transport
            .execute(&Command::SetPassword(self.credentials.password.clone()), timeout)
            .await?;
        transport
            .execute(&Command::set_channel(identity.channel), timeout)
            .await?;
        transport
            .execute(&Command::set_pan_id(identity.pan_id), timeout)
            .await?;
        transport
            .execute(&Command::Join(identity.address), timeout)
            .await?;

        info!(address = %identity.address, "Waiting for PANA authentication");

        let outcome = transport
            .await_event(
                |e| {
                    matches!(
                        e.event_code(),
                        Some(event::JOIN_SUCCEEDED | event::JOIN_FAILED)
                    )
                },
                self.config.join_timeout(),
            )
            .await
            .map_err(|e| JoinError::waiting("PANA authentication", e))?;

        match outcome.event_code() {
            Some(event::JOIN_SUCCEEDED) => Ok(()),
            _ => Err(JoinError::Rejected),
        }
    }
}
