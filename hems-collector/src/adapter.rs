//! SKSTACK-IP line protocol spoken by the Wi-SUN radio adapter.
//!
//! Commands are ASCII lines terminated by CRLF (except `SKSENDTO`, whose
//! binary payload follows the command text directly). The adapter answers
//! with `OK`/`FAIL` lines and emits asynchronous notifications (`EVENT`,
//! `ERXUDP`, `EPANDESC` blocks) at any time.

use std::net::Ipv6Addr;

/// ECHONET Lite UDP port.
pub const ECHONET_PORT: u16 = 0x0E1A;

/// `EVENT` codes the collector reacts to.
pub mod event {
    pub const BEACON_RECEIVED: u8 = 0x20;
    pub const UDP_SENT: u8 = 0x21;
    pub const SCAN_COMPLETE: u8 = 0x22;
    pub const JOIN_FAILED: u8 = 0x24;
    pub const JOIN_SUCCEEDED: u8 = 0x25;
    pub const SESSION_TERMINATE_REQUESTED: u8 = 0x26;
    pub const SESSION_TERMINATED: u8 = 0x27;
    pub const SESSION_TERMINATE_TIMEOUT: u8 = 0x28;
    pub const SESSION_EXPIRED: u8 = 0x29;
    pub const TX_LIMIT: u8 = 0x32;
    pub const TX_LIMIT_RELEASED: u8 = 0x33;
}

/// Render an address the way the adapter expects it: eight uppercase,
/// zero-padded groups without `::` compression.
pub fn format_ipv6(addr: &Ipv6Addr) -> String {
    addr.segments()
        .iter()
        .map(|s| format!("{:04X}", s))
        .collect::<Vec<_>>()
        .join(":")
}

/// A command sent to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `SKVER`: firmware version.
    Version,
    /// `SKSETRBID`: B-route authentication ID.
    SetRouteBId(String),
    /// `SKSETPWD`: B-route password.
    SetPassword(String),
    /// `SKSCAN 2`: active scan with information element.
    ActiveScan { channel_mask: u32, duration: u8 },
    /// `SKLL64`: MAC address to link-local IPv6 address.
    LinkLocal(String),
    /// `SKSREG`: write a virtual register (S2 channel, S3 PAN ID).
    SetRegister { register: String, value: String },
    /// `SKJOIN`: start PANA authentication with the meter.
    Join(Ipv6Addr),
    /// `SKSENDTO`: send a UDP datagram over the secured session.
    SendTo { address: Ipv6Addr, payload: Vec<u8> },
    /// `SKTERM`: terminate the PANA session.
    Terminate,
}

impl Command {
    pub fn set_channel(channel: u8) -> Self {
        Command::SetRegister {
            register: "S2".to_string(),
            value: format!("{:02X}", channel),
        }
    }

    pub fn set_pan_id(pan_id: u16) -> Self {
        Command::SetRegister {
            register: "S3".to_string(),
            value: format!("{:04X}", pan_id),
        }
    }

    /// Command keyword, for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "SKVER",
            Command::SetRouteBId(_) => "SKSETRBID",
            Command::SetPassword(_) => "SKSETPWD",
            Command::ActiveScan { .. } => "SKSCAN",
            Command::LinkLocal(_) => "SKLL64",
            Command::SetRegister { .. } => "SKSREG",
            Command::Join(_) => "SKJOIN",
            Command::SendTo { .. } => "SKSENDTO",
            Command::Terminate => "SKTERM",
        }
    }

    /// Whether the adapter terminates this command with `OK`/`FAIL`.
    ///
    /// `SKLL64` only prints the converted address.
    pub fn expects_status(&self) -> bool {
        !matches!(self, Command::LinkLocal(_))
    }

    /// Wire bytes for this command.
    pub fn encode(&self) -> Vec<u8> {
        let text = match self {
            Command::Version => "SKVER".to_string(),
            Command::SetRouteBId(id) => format!("SKSETRBID {}", id),
            Command::SetPassword(password) => {
                format!("SKSETPWD {:X} {}", password.len(), password)
            }
            Command::ActiveScan {
                channel_mask,
                duration,
            } => format!("SKSCAN 2 {:08X} {:X}", channel_mask, duration),
            Command::LinkLocal(mac) => format!("SKLL64 {}", mac),
            Command::SetRegister { register, value } => format!("SKSREG {} {}", register, value),
            Command::Join(addr) => format!("SKJOIN {}", format_ipv6(addr)),
            Command::SendTo { address, payload } => {
                let mut bytes = format!(
                    "SKSENDTO 1 {} {:04X} 1 {:04X} ",
                    format_ipv6(address),
                    ECHONET_PORT,
                    payload.len()
                )
                .into_bytes();
                bytes.extend_from_slice(payload);
                return bytes;
            }
            Command::Terminate => "SKTERM".to_string(),
        };

        let mut bytes = text.into_bytes();
        bytes.extend_from_slice(b"\r\n");
        bytes
    }
}

impl std::fmt::Display for Command {
    /// Log-safe rendering: credentials are masked, payloads shown as length.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SetRouteBId(_) => write!(f, "SKSETRBID ********"),
            Command::SetPassword(p) => write!(f, "SKSETPWD {:X} ********", p.len()),
            Command::SendTo { address, payload } => write!(
                f,
                "SKSENDTO 1 {} {:04X} 1 {:04X} <{} bytes>",
                format_ipv6(address),
                ECHONET_PORT,
                payload.len(),
                payload.len()
            ),
            other => {
                let bytes = other.encode();
                write!(f, "{}", String::from_utf8_lossy(&bytes).trim_end())
            }
        }
    }
}

/// An `EVENT` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotice {
    pub code: u8,
    pub sender: Option<Ipv6Addr>,
    pub param: Option<String>,
}

/// A PAN descriptor reported during an active scan (`EPANDESC` block).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanDescriptor {
    pub channel: u8,
    pub channel_page: u8,
    pub pan_id: u16,
    /// 64-bit MAC address as 16 hex digits.
    pub mac: String,
    /// Link quality indicator, higher is better.
    pub lqi: u8,
    pub pair_id: Option<String>,
}

/// A UDP datagram received over the radio link (`ERXUDP`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub sender: Ipv6Addr,
    pub remote_port: u16,
    pub local_port: u16,
    pub payload: Vec<u8>,
}

/// One classified unit of adapter output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// Command echo.
    Echo(String),
    /// Command completed.
    Ok,
    /// Command failed, with the adapter's error code (e.g. `ER04`).
    Fail(String),
    /// `EVER` firmware version.
    Version(String),
    /// A bare IPv6 address (answer to `SKLL64`).
    Address(Ipv6Addr),
    Event(EventNotice),
    PanDescriptor(PanDescriptor),
    Udp(UdpDatagram),
    Unrecognized(String),
}

impl AdapterEvent {
    /// `OK` or `FAIL`.
    pub fn is_status(&self) -> bool {
        matches!(self, AdapterEvent::Ok | AdapterEvent::Fail(_))
    }

    /// The `EVENT` code, if this is an event notification.
    pub fn event_code(&self) -> Option<u8> {
        match self {
            AdapterEvent::Event(notice) => Some(notice.code),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct PanBuilder {
    channel: Option<u8>,
    channel_page: Option<u8>,
    pan_id: Option<u16>,
    mac: Option<String>,
    lqi: Option<u8>,
    pair_id: Option<String>,
}

impl PanBuilder {
    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "Channel" => self.channel = u8::from_str_radix(value, 16).ok(),
            "Channel Page" => self.channel_page = u8::from_str_radix(value, 16).ok(),
            "Pan ID" => self.pan_id = u16::from_str_radix(value, 16).ok(),
            "Addr" => self.mac = Some(value.to_uppercase()),
            "LQI" => self.lqi = u8::from_str_radix(value, 16).ok(),
            "PairID" => self.pair_id = Some(value.to_string()),
            other => tracing::trace!(key = other, "Ignoring EPANDESC field"),
        }
    }

    fn build(self) -> AdapterEvent {
        match (self.channel, self.pan_id, self.mac) {
            (Some(channel), Some(pan_id), Some(mac)) => {
                AdapterEvent::PanDescriptor(PanDescriptor {
                    channel,
                    channel_page: self.channel_page.unwrap_or(0),
                    pan_id,
                    mac,
                    lqi: self.lqi.unwrap_or(0),
                    pair_id: self.pair_id,
                })
            }
            _ => AdapterEvent::Unrecognized("incomplete EPANDESC block".to_string()),
        }
    }
}

/// Turns adapter output lines into [`AdapterEvent`]s.
///
/// Stateful because `EPANDESC` spans several indented lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pan: Option<PanBuilder>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line (without the trailing CRLF).
    pub fn decode(&mut self, line: &str) -> Vec<AdapterEvent> {
        let mut events = Vec::new();
        let line = line.trim_end();

        if let Some(pan) = self.pan.as_mut() {
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((key, value)) = line.trim().split_once(':') {
                    let key = key.trim();
                    pan.apply(key, value.trim());
                    if key == "PairID" {
                        events.extend(self.finish());
                    }
                }
                return events;
            }
            events.extend(self.finish());
        }

        if line.is_empty() {
            return events;
        }

        if line == "EPANDESC" {
            self.pan = Some(PanBuilder::default());
            return events;
        }

        events.push(classify(line));
        events
    }

    /// Flush a pending multi-line block.
    pub fn finish(&mut self) -> Option<AdapterEvent> {
        self.pan.take().map(PanBuilder::build)
    }
}

fn classify(line: &str) -> AdapterEvent {
    let mut tokens = line.split_whitespace();
    let head = tokens.next().unwrap_or_default();

    match head {
        "OK" => AdapterEvent::Ok,
        "FAIL" => AdapterEvent::Fail(tokens.next().unwrap_or_default().to_string()),
        "EVER" => AdapterEvent::Version(tokens.collect::<Vec<_>>().join(" ")),
        "EVENT" => parse_event(tokens).unwrap_or_else(|| AdapterEvent::Unrecognized(line.to_string())),
        "ERXUDP" => parse_erxudp(line).unwrap_or_else(|| {
            tracing::warn!(line, "Malformed ERXUDP notification");
            AdapterEvent::Unrecognized(line.to_string())
        }),
        _ if head.starts_with("SK") => AdapterEvent::Echo(line.to_string()),
        _ => match line.parse::<Ipv6Addr>() {
            Ok(addr) => AdapterEvent::Address(addr),
            Err(_) => AdapterEvent::Unrecognized(line.to_string()),
        },
    }
}

fn parse_event<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Option<AdapterEvent> {
    let code = u8::from_str_radix(tokens.next()?, 16).ok()?;
    let sender = tokens.next().and_then(|s| s.parse().ok());
    let rest: Vec<&str> = tokens.collect();
    let param = (!rest.is_empty()).then(|| rest.join(" "));

    Some(AdapterEvent::Event(EventNotice {
        code,
        sender,
        param,
    }))
}

/// `ERXUDP <sender> <dest> <rport> <lport> <senderlla> [<secured>] <datalen> <data>`
fn parse_erxudp(line: &str) -> Option<AdapterEvent> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 8 {
        return None;
    }

    let sender = tokens[1].parse().ok()?;
    let remote_port = u16::from_str_radix(tokens[3], 16).ok()?;
    let local_port = u16::from_str_radix(tokens[4], 16).ok()?;
    let data = tokens[tokens.len() - 1];
    let declared = usize::from_str_radix(tokens[tokens.len() - 2], 16).ok()?;
    let payload = hex::decode(data).ok()?;

    if payload.len() != declared {
        return None;
    }

    Some(AdapterEvent::Udp(UdpDatagram {
        sender,
        remote_port,
        local_port,
        payload,
    }))
}
