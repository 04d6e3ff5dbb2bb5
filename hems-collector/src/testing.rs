//! Scripted Wi-SUN adapter and meter used by unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::echonet::{EchonetObject, Frame, Property, ServiceCode};
use crate::properties::epc;
use crate::shutdown::Shutdown;
use crate::transport::Transport;

pub const METER_ADDR: &str = "FE80:0000:0000:0000:021C:6400:030C:12A4";
pub const METER_MAC: &str = "001C6400030C12A4";

/// Commands received by the fake adapter, payloads rendered as hex.
pub type CommandLog = Arc<Mutex<Vec<String>>>;

/// Connect a transport to a fake adapter driven by `handler`.
///
/// The handler gets each command line (and the `SKSENDTO` payload) and
/// returns the lines the adapter prints in answer.
pub fn fake_adapter<H>(handler: H) -> (Transport, CommandLog)
where
    H: FnMut(&str, &[u8]) -> Vec<String> + Send + 'static,
{
    let log: CommandLog = Arc::default();
    (fake_adapter_logging(log.clone(), handler), log)
}

/// Like [`fake_adapter`], recording into an existing log.
pub fn fake_adapter_logging<H>(log: CommandLog, mut handler: H) -> Transport
where
    H: FnMut(&str, &[u8]) -> Vec<String> + Send + 'static,
{
    let (client, adapter) = tokio::io::duplex(64 * 1024);
    let seen = log;

    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(adapter);
        let mut reader = BufReader::new(read_half);

        while let Some((line, payload)) = next_command(&mut reader).await {
            let entry = if payload.is_empty() {
                line.clone()
            } else {
                format!("{} {}", line, hex::encode_upper(&payload))
            };
            seen.lock().unwrap().push(entry);

            for reply in handler(&line, &payload) {
                if write_half.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });

    Transport::new(client, Shutdown::never())
}

async fn next_command<R: AsyncRead + Unpin>(reader: &mut R) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    loop {
        buf.push(reader.read_u8().await.ok()?);

        if buf.ends_with(b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..buf.len() - 2]).to_string();
            return Some((line, Vec::new()));
        }

        if buf.starts_with(b"SKSENDTO") && buf.iter().filter(|&&b| b == b' ').count() == 6 {
            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            let len = usize::from_str_radix(line.split_whitespace().nth(5)?, 16).ok()?;
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await.ok()?;
            return Some((line, payload));
        }
    }
}

/// `ERXUDP` notification carrying `payload` from the meter.
pub fn erxudp(payload: &[u8]) -> String {
    format!(
        "ERXUDP {} FE80:0000:0000:0000:021D:1291:0000:0574 0E1A 0E1A {} 1 {:04X} {}",
        METER_ADDR,
        METER_MAC,
        payload.len(),
        hex::encode_upper(payload)
    )
}

/// Minimal smart meter answering Get and SetC requests.
#[derive(Debug, Clone, Default)]
pub struct MeterSim {
    pub properties: HashMap<u8, Vec<u8>>,
    /// `E2` payload per history day index.
    pub history: HashMap<u8, Vec<u8>>,
    pub history_day: u8,
}

impl MeterSim {
    pub fn with(mut self, code: u8, data: &[u8]) -> Self {
        self.properties.insert(code, data.to_vec());
        self
    }

    pub fn respond(&mut self, request: &Frame) -> Frame {
        let (service, properties) = match request.service {
            ServiceCode::SetC => {
                let ok = request.properties.iter().all(|p| {
                    p.code == epc::HISTORY_DAY && p.data.len() == 1
                });
                if ok {
                    self.history_day = request.properties[0].data[0];
                }
                let service = if ok { ServiceCode::SetRes } else { ServiceCode::SetCSna };
                let properties = request
                    .properties
                    .iter()
                    .map(|p| {
                        if ok {
                            Property::empty(p.code)
                        } else {
                            p.clone()
                        }
                    })
                    .collect();
                (service, properties)
            }
            _ => {
                let properties: Vec<Property> = request
                    .properties
                    .iter()
                    .map(|p| {
                        let data = if p.code == epc::ENERGY_HISTORY {
                            self.history.get(&self.history_day).cloned()
                        } else {
                            self.properties.get(&p.code).cloned()
                        };
                        Property::new(p.code, data.unwrap_or_default())
                    })
                    .collect();
                let service = if properties.iter().all(|p| !p.data.is_empty()) {
                    ServiceCode::GetRes
                } else {
                    ServiceCode::GetSna
                };
                (service, properties)
            }
        };

        Frame {
            tid: request.tid,
            source: EchonetObject::SMART_METER,
            destination: EchonetObject::CONTROLLER,
            service,
            properties,
        }
    }
}

/// Handler for a well-behaved adapter in front of `meter`: every command
/// succeeds, scans find one PAN, joins succeed.
pub fn happy_adapter(meter: MeterSim) -> impl FnMut(&str, &[u8]) -> Vec<String> + Send + 'static {
    let meter = Arc::new(Mutex::new(meter));
    move |line, payload| {
        let mut replies = vec![line.to_string()];
        replies.extend(adapter_reply(line, payload, &meter));
        replies
    }
}

/// Adapter replies to `line`, without the echo.
pub fn adapter_reply(line: &str, payload: &[u8], meter: &Mutex<MeterSim>) -> Vec<String> {
    let command = line.split_whitespace().next().unwrap_or_default();
    match command {
        "SKVER" => vec!["EVER 1.2.10".into(), "OK".into()],
        "SKLL64" => vec![METER_ADDR.into()],
        "SKSCAN" => {
            let mut replies = vec!["OK".to_string()];
            replies.extend(pan_descriptor(0x21, 0x8888, METER_MAC, 0xE1));
            replies.push(format!("EVENT 22 {}", METER_ADDR));
            replies
        }
        "SKJOIN" => vec!["OK".into(), format!("EVENT 25 {}", METER_ADDR)],
        "SKSENDTO" => {
            let mut replies = vec![format!("EVENT 21 {} 00", METER_ADDR), "OK".to_string()];
            if let Ok(request) = Frame::decode(payload) {
                let response = meter.lock().unwrap().respond(&request);
                replies.push(erxudp(&response.encode().unwrap()));
            }
            replies
        }
        _ => vec!["OK".into()],
    }
}

pub fn pan_descriptor(channel: u8, pan_id: u16, mac: &str, lqi: u8) -> Vec<String> {
    vec![
        format!("EVENT 20 {}", METER_ADDR),
        "EPANDESC".to_string(),
        format!("  Channel:{:02X}", channel),
        "  Channel Page:09".to_string(),
        format!("  Pan ID:{:04X}", pan_id),
        format!("  Addr:{}", mac),
        format!("  LQI:{:02X}", lqi),
        "  PairID:00AABBCC".to_string(),
    ]
}
