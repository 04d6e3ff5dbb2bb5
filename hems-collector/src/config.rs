//! Configuration for the smart-meter collector.

use chrono::{FixedOffset, Offset, Utc};
use hems_common::config::{LoggingConfig, ZenohConfig};
use hems_common::serialization::OutputFormat;
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cron::Schedule;
use crate::join::NetworkIdentity;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Serial port of the Wi-SUN adapter
    #[serde(default)]
    pub serial: SerialConfig,

    /// B-route credentials issued by the utility
    pub broute: BrouteConfig,

    /// Known meter identity; skips the active scan when complete
    #[serde(default)]
    pub meter: MeterConfig,

    /// Network join parameters
    #[serde(default)]
    pub join: JoinConfig,

    /// Property acquisition parameters
    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    /// When to take measurements
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Output sinks, in dispatch order
    #[serde(default)]
    pub outputs: Vec<SinkConfig>,

    /// Zenoh connection settings (used by `pubsub` outputs)
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial link to the radio adapter (8N1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3")
    #[serde(default = "default_serial_port")]
    pub port: String,

    /// Baud rate (default: 115200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115200
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
        }
    }
}

/// B-route authentication.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct BrouteConfig {
    /// Authentication ID (32 characters)
    #[serde(default)]
    pub id: String,

    /// Password (12 characters)
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for BrouteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrouteConfig")
            .field("id", &"********")
            .field("password", &"********")
            .finish()
    }
}

/// Meter network identity. Either all three fields or none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Radio channel as hex (e.g., "21")
    pub channel: Option<String>,

    /// PAN ID as hex (e.g., "8888")
    pub pan_id: Option<String>,

    /// Link-local IPv6 address of the meter
    pub address: Option<String>,
}

impl MeterConfig {
    /// The configured identity, if one was supplied.
    pub fn identity(&self) -> Result<Option<NetworkIdentity>, ConfigError> {
        match (&self.channel, &self.pan_id, &self.address) {
            (None, None, None) => Ok(None),
            (Some(channel), Some(pan_id), Some(address)) => {
                let channel = u8::from_str_radix(channel, 16).map_err(|_| {
                    ConfigError::Validation(format!("meter.channel: invalid hex '{}'", channel))
                })?;
                let pan_id = u16::from_str_radix(pan_id, 16).map_err(|_| {
                    ConfigError::Validation(format!("meter.pan_id: invalid hex '{}'", pan_id))
                })?;
                let address: Ipv6Addr = address.parse().map_err(|_| {
                    ConfigError::Validation(format!("meter.address: invalid IPv6 '{}'", address))
                })?;
                Ok(Some(NetworkIdentity {
                    channel,
                    pan_id,
                    mac: None,
                    address,
                }))
            }
            _ => Err(ConfigError::Validation(
                "meter.channel, meter.pan_id and meter.address must be set together".to_string(),
            )),
        }
    }
}

/// Network discovery and authentication parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Active scan attempts per join phase
    #[serde(default = "default_attempts")]
    pub max_scan_attempts: u32,

    /// Scan duration exponent for the first attempt (1-14)
    #[serde(default = "default_scan_duration")]
    pub scan_duration: u8,

    /// Channel mask for the first attempt, as hex
    #[serde(default = "default_channel_mask")]
    pub scan_channel_mask: String,

    /// Time allowed for one scan to complete
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    /// Time allowed for PANA authentication
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,

    /// Whole-phase attempts before giving up
    #[serde(default = "default_attempts")]
    pub max_join_attempts: u32,

    /// Backoff before the second phase attempt
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    /// Upper bound for the doubling backoff
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Time allowed for a configuration command to answer OK
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_scan_duration() -> u8 {
    6
}

fn default_channel_mask() -> String {
    "FFFFFFFF".to_string()
}

fn default_scan_timeout() -> u64 {
    60
}

fn default_join_timeout() -> u64 {
    30
}

fn default_initial_backoff() -> u64 {
    2
}

fn default_max_backoff() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    10
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            max_scan_attempts: default_attempts(),
            scan_duration: default_scan_duration(),
            scan_channel_mask: default_channel_mask(),
            scan_timeout_secs: default_scan_timeout(),
            join_timeout_secs: default_join_timeout(),
            max_join_attempts: default_attempts(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl JoinConfig {
    pub fn channel_mask(&self) -> Result<u32, ConfigError> {
        u32::from_str_radix(&self.scan_channel_mask, 16).map_err(|_| {
            ConfigError::Validation(format!(
                "join.scan_channel_mask: invalid hex '{}'",
                self.scan_channel_mask
            ))
        })
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// Property acquisition parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Time allowed for the meter's ECHONET Lite response
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Time allowed for `SKSENDTO` to answer OK
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_response_timeout() -> u64 {
    20
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl AcquisitionConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Scheduler mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// Fire on a cron expression (default)
    #[default]
    Schedule,
    /// Fire every `interval_secs`, starting immediately
    Interval,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub mode: ScheduleMode,

    /// Cron expression for `schedule` mode (default: every 5 minutes)
    #[serde(default = "default_cron")]
    pub cron: String,

    /// Period for `interval` mode
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Acquisition attempts per cycle
    #[serde(default = "default_attempts")]
    pub max_retries_per_cycle: u32,

    /// Upper bound for one whole cycle
    #[serde(default = "default_cycle_timeout")]
    pub per_cycle_timeout_secs: u64,

    /// UTC offset of the meter's clock and of cron evaluation (e.g., "+09:00")
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_cron() -> String {
    "*/5 * * * *".to_string()
}

fn default_interval() -> u64 {
    300
}

fn default_cycle_timeout() -> u64 {
    60
}

fn default_timezone() -> String {
    "+09:00".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::default(),
            cron: default_cron(),
            interval_secs: default_interval(),
            max_retries_per_cycle: default_attempts(),
            per_cycle_timeout_secs: default_cycle_timeout(),
            timezone: default_timezone(),
        }
    }
}

impl SchedulerConfig {
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Schedule::parse(&self.cron)
            .map_err(|e| ConfigError::Validation(format!("scheduler.cron: {}", e)))
    }

    /// Parse `timezone` as a fixed UTC offset ("UTC", "Z" or "+HH:MM").
    pub fn source_offset(&self) -> Result<FixedOffset, ConfigError> {
        match self.timezone.as_str() {
            "UTC" | "utc" | "Z" => Ok(Utc.fix()),
            other => other.parse::<FixedOffset>().map_err(|_| {
                ConfigError::Validation(format!(
                    "scheduler.timezone: expected a UTC offset like '+09:00', got '{}'",
                    other
                ))
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn per_cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.per_cycle_timeout_secs)
    }
}

/// One output destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// One record per line on standard output
    Stdout {
        #[serde(default)]
        format: OutputFormat,
    },
    /// Append records to a local file
    File {
        #[serde(default)]
        format: OutputFormat,
        /// Extension is added from the format when missing
        #[serde(default = "default_file_path")]
        path: PathBuf,
    },
    /// HTTP POST of the JSON record
    Webhook {
        url: String,
        #[serde(default = "default_sink_timeout")]
        timeout_secs: u64,
    },
    /// Zenoh put of the JSON record
    Pubsub {
        #[serde(default = "default_pubsub_key")]
        key: String,
        #[serde(default = "default_sink_timeout")]
        timeout_secs: u64,
    },
}

fn default_file_path() -> PathBuf {
    PathBuf::from("hems_data")
}

fn default_sink_timeout() -> u64 {
    10
}

fn default_pubsub_key() -> String {
    "hems/meter".to_string()
}

impl CollectorConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CollectorConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broute.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broute.id must be set".to_string(),
            ));
        }

        if self.broute.password.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broute.password must be set".to_string(),
            ));
        }

        if !self
            .broute
            .id
            .chars()
            .chain(self.broute.password.chars())
            .all(|c| c.is_ascii_graphic())
        {
            return Err(ConfigError::Validation(
                "broute credentials must be printable ASCII without spaces".to_string(),
            ));
        }

        if self.serial.port.is_empty() {
            return Err(ConfigError::Validation(
                "serial.port cannot be empty".to_string(),
            ));
        }

        self.meter.identity()?;
        self.join.channel_mask()?;

        if !(1..=14).contains(&self.join.scan_duration) {
            return Err(ConfigError::Validation(format!(
                "join.scan_duration must be 1-14, got {}",
                self.join.scan_duration
            )));
        }

        if self.join.max_scan_attempts == 0 || self.join.max_join_attempts == 0 {
            return Err(ConfigError::Validation(
                "join attempt counts must be at least 1".to_string(),
            ));
        }

        if self.scheduler.max_retries_per_cycle == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_retries_per_cycle must be at least 1".to_string(),
            ));
        }

        self.scheduler.source_offset()?;
        match self.scheduler.mode {
            ScheduleMode::Schedule => {
                self.scheduler.schedule()?;
            }
            ScheduleMode::Interval if self.scheduler.interval_secs == 0 => {
                return Err(ConfigError::Validation(
                    "scheduler.interval_secs must be greater than 0".to_string(),
                ));
            }
            ScheduleMode::Interval => {}
        }

        for output in &self.outputs {
            match output {
                SinkConfig::Webhook { url, .. } if url.is_empty() => {
                    return Err(ConfigError::Validation(
                        "webhook output requires a url".to_string(),
                    ));
                }
                SinkConfig::Pubsub { key, .. } if key.is_empty() => {
                    return Err(ConfigError::Validation(
                        "pubsub output requires a key".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }
}
