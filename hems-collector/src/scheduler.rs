//! Acquisition scheduling.
//!
//! A single task fires cycles either on a fixed interval (first fire
//! immediately) or on a cron expression evaluated in the meter's UTC
//! offset. Each cycle joins on demand, acquires with bounded retries and
//! dispatches the measurement. Errors never escape a cycle.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::acquisition::AcquisitionError;
use crate::config::{ConfigError, ScheduleMode, SchedulerConfig};
use crate::cron::Schedule;
use crate::dispatch::Dispatcher;
use crate::join::JoinError;
use crate::meter::MeterLink;
use crate::shutdown::Shutdown;
use hems_common::Measurement;

/// When cycles fire.
#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(Duration),
    Cron {
        schedule: Schedule,
        offset: FixedOffset,
    },
}

impl Trigger {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, ConfigError> {
        match config.mode {
            ScheduleMode::Interval => Ok(Trigger::Interval(config.interval())),
            ScheduleMode::Schedule => Ok(Trigger::Cron {
                schedule: config.schedule()?,
                offset: config.source_offset()?,
            }),
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Dispatched,
    JoinFailed,
    AcquisitionFailed,
    TimedOut,
    Cancelled,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Dispatched => "dispatched",
            CycleOutcome::JoinFailed => "join_failed",
            CycleOutcome::AcquisitionFailed => "acquisition_failed",
            CycleOutcome::TimedOut => "timed_out",
            CycleOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next cron fire strictly after both `now` and the previous fire.
///
/// Returns the fire time and how long to sleep until it.
pub fn next_fire(
    schedule: &Schedule,
    offset: FixedOffset,
    now: DateTime<Utc>,
    last: Option<DateTime<FixedOffset>>,
) -> Option<(DateTime<FixedOffset>, Duration)> {
    let now = now.with_timezone(&offset);
    let from = match last {
        Some(last) if last > now => last,
        _ => now,
    };
    let next = schedule.next_after(&from)?;
    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
    Some((next, wait))
}

/// Drives acquisition cycles until shutdown.
pub struct Scheduler<M> {
    meter: M,
    dispatcher: Dispatcher,
    trigger: Trigger,
    max_attempts: u32,
    cycle_timeout: Duration,
    shutdown: Shutdown,
}

impl<M: MeterLink> Scheduler<M> {
    pub fn new(
        meter: M,
        dispatcher: Dispatcher,
        config: &SchedulerConfig,
        shutdown: Shutdown,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            meter,
            dispatcher,
            trigger: Trigger::from_config(config)?,
            max_attempts: config.max_retries_per_cycle.max(1),
            cycle_timeout: config.per_cycle_timeout(),
            shutdown,
        })
    }

    pub fn meter(&self) -> &M {
        &self.meter
    }

    /// Run cycles until shutdown is requested.
    pub async fn run(&mut self) {
        match self.trigger.clone() {
            Trigger::Interval(period) => self.run_interval(period).await,
            Trigger::Cron { schedule, offset } => self.run_cron(&schedule, offset).await,
        }
        info!("Scheduler stopped");
    }

    async fn run_interval(&mut self, period: Duration) {
        info!(interval_secs = period.as_secs(), "Scheduler running in interval mode");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = ticker.tick() => {}
            }

            if self.run_cycle().await == CycleOutcome::Cancelled {
                return;
            }
        }
    }

    async fn run_cron(&mut self, schedule: &Schedule, offset: FixedOffset) {
        info!(cron = %schedule, %offset, "Scheduler running in schedule mode");

        let shutdown = self.shutdown.clone();
        let mut last = None;
        loop {
            let Some((next, wait)) = next_fire(schedule, offset, Utc::now(), last) else {
                error!(cron = %schedule, "Schedule has no future fire time");
                return;
            };
            debug!(next = %next, "Waiting for next scheduled cycle");

            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            last = Some(next);

            if self.run_cycle().await == CycleOutcome::Cancelled {
                return;
            }
        }
    }

    /// One cycle: join if needed, acquire, dispatch.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let started = Instant::now();
        let outcome = self.cycle().await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            CycleOutcome::Dispatched => info!(outcome = %outcome, elapsed_ms, "Cycle finished"),
            CycleOutcome::Cancelled => debug!(outcome = %outcome, elapsed_ms, "Cycle finished"),
            _ => warn!(outcome = %outcome, elapsed_ms, "Cycle finished"),
        }
        outcome
    }

    async fn cycle(&mut self) -> CycleOutcome {
        if self.shutdown.is_triggered() {
            return CycleOutcome::Cancelled;
        }

        let shutdown = self.shutdown.clone();

        let joined = tokio::select! {
            _ = shutdown.wait() => return CycleOutcome::Cancelled,
            joined = self.meter.ensure_connected() => joined,
        };
        match joined {
            Ok(()) => {}
            Err(JoinError::Cancelled) => return CycleOutcome::Cancelled,
            Err(e) => {
                error!(phase = "join", error = %e, "Meter unavailable, skipping cycle");
                return CycleOutcome::JoinFailed;
            }
        }

        let limit = self.cycle_timeout;
        let acquired = tokio::select! {
            _ = shutdown.wait() => return CycleOutcome::Cancelled,
            acquired = tokio::time::timeout(limit, self.acquire_with_retries()) => acquired,
        };

        let measurement = match acquired {
            Ok(Ok(measurement)) => measurement,
            Ok(Err(AcquisitionError::Cancelled)) => return CycleOutcome::Cancelled,
            Ok(Err(e)) => {
                error!(phase = "acquisition", kind = e.kind(), error = %e, "Acquisition failed");
                return CycleOutcome::AcquisitionFailed;
            }
            Err(_) => {
                error!(phase = "acquisition", timeout = ?limit, "Cycle timed out");
                // A reply may still be in flight.
                self.meter.invalidate();
                return CycleOutcome::TimedOut;
            }
        };

        let report = self.dispatcher.dispatch(&measurement).await;
        if report.is_total_failure() {
            error!(phase = "dispatch", sinks = report.results.len(), "Measurement was not delivered");
        } else {
            debug!(delivered = report.delivered(), failed = report.failed(), "Dispatched");
        }
        CycleOutcome::Dispatched
    }

    async fn acquire_with_retries(&mut self) -> Result<Measurement, AcquisitionError> {
        let mut attempt = 1;
        loop {
            match self.meter.acquire().await {
                Ok(measurement) => return Ok(measurement),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        kind = e.kind(),
                        error = %e,
                        "Acquisition attempt failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
