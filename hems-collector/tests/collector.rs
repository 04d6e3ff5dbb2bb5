//! End-to-end tests: scripted Wi-SUN adapter, scheduler cycle, file output.

use std::sync::{Arc, Mutex};

use hems_collector::config::CollectorConfig;
use hems_collector::dispatch::Dispatcher;
use hems_collector::echonet::{EchonetObject, Frame, Property, ServiceCode};
use hems_collector::meter::{MeterLink, Opener, SmartMeter};
use hems_collector::scheduler::{CycleOutcome, Scheduler};
use hems_collector::shutdown::Shutdown;
use hems_collector::sinks::build_sinks;
use hems_collector::transport::Transport;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

const METER_ADDR: &str = "FE80:0000:0000:0000:021C:6400:030C:12A4";
const METER_MAC: &str = "001C6400030C12A4";

type Log = Arc<Mutex<Vec<String>>>;

/// Property values served by the scripted meter.
fn meter_value(code: u8) -> Vec<u8> {
    match code {
        0xE7 => vec![0x00, 0x00, 0x01, 0xF4],
        0xE0 => vec![0x00, 0x01, 0xE2, 0x40],
        0xD3 => vec![0x00, 0x00, 0x00, 0x01],
        0xE1 => vec![0x01],
        0xE8 => vec![0x00, 0x32, 0x7F, 0xFE],
        _ => Vec::new(),
    }
}

fn meter_response(request: &Frame) -> Frame {
    let (service, properties) = match request.service {
        ServiceCode::SetC => (
            ServiceCode::SetRes,
            request.properties.iter().map(|p| Property::empty(p.code)).collect(),
        ),
        _ => {
            let properties: Vec<Property> = request
                .properties
                .iter()
                .map(|p| Property::new(p.code, meter_value(p.code)))
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

fn replies(line: &str, payload: &[u8], accept_join: bool) -> Vec<String> {
    let mut out = vec![line.to_string()];
    match line.split_whitespace().next().unwrap_or_default() {
        "SKVER" => out.extend(["EVER 1.2.10".to_string(), "OK".to_string()]),
        "SKLL64" => out.push(METER_ADDR.to_string()),
        "SKSCAN" => out.extend([
            "OK".to_string(),
            format!("EVENT 20 {}", METER_ADDR),
            "EPANDESC".to_string(),
            "  Channel:21".to_string(),
            "  Channel Page:09".to_string(),
            "  Pan ID:8888".to_string(),
            format!("  Addr:{}", METER_MAC),
            "  LQI:E1".to_string(),
            "  PairID:00AABBCC".to_string(),
            format!("EVENT 22 {}", METER_ADDR),
        ]),
        "SKJOIN" => {
            let code = if accept_join { 25 } else { 24 };
            out.extend(["OK".to_string(), format!("EVENT {} {}", code, METER_ADDR)]);
        }
        "SKSENDTO" => {
            out.push("OK".to_string());
            if let Ok(request) = Frame::decode(payload) {
                let response = meter_response(&request).encode().unwrap();
                out.push(format!(
                    "ERXUDP {} FE80:0000:0000:0000:021D:1291:0000:0574 0E1A 0E1A {} 1 {:04X} {}",
                    METER_ADDR,
                    METER_MAC,
                    response.len(),
                    hex::encode_upper(&response)
                ));
            }
        }
        _ => out.push("OK".to_string()),
    }
    out
}

async fn next_command<R: AsyncRead + Unpin>(reader: &mut R) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    loop {
        buf.push(reader.read_u8().await.ok()?);
        if buf.ends_with(b"\r\n") {
            return Some((String::from_utf8_lossy(&buf[..buf.len() - 2]).to_string(), Vec::new()));
        }
        // SKSENDTO's binary payload follows the sixth space.
        if buf.starts_with(b"SKSENDTO") && buf.iter().filter(|&&b| b == b' ').count() == 6 {
            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            let len = usize::from_str_radix(line.split_whitespace().nth(5)?, 16).ok()?;
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await.ok()?;
            return Some((line, payload));
        }
    }
}

fn spawn_adapter(stream: DuplexStream, log: Log, accept_join: bool) {
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        while let Some((line, payload)) = next_command(&mut reader).await {
            log.lock().unwrap().push(line.clone());
            for reply in replies(&line, &payload, accept_join) {
                if write_half.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });
}

fn opener(log: Log, accept_join: bool, shutdown: Shutdown) -> Opener {
    Box::new(move || {
        let (client, adapter) = tokio::io::duplex(64 * 1024);
        spawn_adapter(adapter, log.clone(), accept_join);
        Ok(Transport::new(client, shutdown.clone()))
    })
}

fn config(output_path: &str, extra: &str) -> CollectorConfig {
    let text = format!(
        r#"{{
            broute: {{ id: "0123456789ABCDEF0123456789ABCDEF", password: "PASSWORD1234" }},
            scheduler: {{ mode: "interval", interval_secs: 60, timezone: "+09:00" }},
            outputs: [ {{ type: "file", format: "csv", path: {:?} }} ],
            {}
        }}"#,
        output_path, extra
    );
    let config: CollectorConfig = json5::from_str(&text).expect("invalid test config");
    config.validate().expect("test config rejected");
    config
}

fn count(log: &Log, command: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|l| l.starts_with(command))
        .count()
}

#[tokio::test]
async fn test_scan_join_acquire_and_write_csv() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("readings");
    let config = config(path.to_str().unwrap(), "");

    let log: Log = Arc::default();
    let shutdown = Shutdown::never();
    let meter = SmartMeter::new(&config, opener(log.clone(), true, shutdown.clone()), shutdown.clone())
        .unwrap();
    let dispatcher = Dispatcher::new(build_sinks(&config.outputs, None).unwrap());
    let mut scheduler = Scheduler::new(meter, dispatcher, &config.scheduler, shutdown).unwrap();

    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Dispatched);
    assert_eq!(scheduler.run_cycle().await, CycleOutcome::Dispatched);
    assert!(scheduler.meter().is_connected());

    // One join serves both cycles.
    assert_eq!(count(&log, "SKSCAN"), 1);
    assert_eq!(count(&log, "SKJOIN"), 1);

    let text = std::fs::read_to_string(dir.path().join("readings.csv")).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("timestamp,cumulative_power_kwh,instant_power_w"));

    let row: Vec<&str> = lines[1].split(',').collect();
    assert_eq!(row.len(), 10);
    assert!(row[0].ends_with('Z'));
    assert_eq!(row[1], "12345.6");
    assert_eq!(row[2], "500");
    // 2-wire meter: no T phase.
    assert_eq!(row[5], "");
}

#[tokio::test(start_paused = true)]
async fn test_rejected_join_skips_cycle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("readings");
    let config = config(
        path.to_str().unwrap(),
        &format!(
            r#"meter: {{ channel: "21", pan_id: "8888", address: "{}" }},
               join: {{ max_join_attempts: 2 }}"#,
            METER_ADDR
        ),
    );

    let log: Log = Arc::default();
    let shutdown = Shutdown::never();
    let meter = SmartMeter::new(&config, opener(log.clone(), false, shutdown.clone()), shutdown.clone())
        .unwrap();
    let dispatcher = Dispatcher::new(build_sinks(&config.outputs, None).unwrap());
    let mut scheduler = Scheduler::new(meter, dispatcher, &config.scheduler, shutdown).unwrap();

    assert_eq!(scheduler.run_cycle().await, CycleOutcome::JoinFailed);
    assert!(!scheduler.meter().is_connected());
    assert_eq!(count(&log, "SKSCAN"), 0);
    assert_eq!(count(&log, "SKJOIN"), 2);
    assert!(!dir.path().join("readings.csv").exists());
}

#[test]
fn test_example_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/hems.example.json5");
    let config = CollectorConfig::load_from_file(path).expect("example config rejected");

    assert_eq!(config.outputs.len(), 2);
    assert_eq!(config.serial.baud_rate, 115200);
    assert!(config.meter.identity().unwrap().is_none());
}
