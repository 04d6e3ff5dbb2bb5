//! Measurement acquisition over an authenticated session.
//!
//! One acquisition sends a single Get request for the power, current and
//! energy properties (plus the energy coefficient and unit on a session's
//! first cycle), correlates the meter's answer and assembles a
//! [`Measurement`]. The half-hour history falls back to the previous day
//! when today has fewer than two readings. History steps are optional:
//! only a lost session or a shutdown makes them fail the acquisition.

use chrono::{DateTime, FixedOffset, Utc};
use hems_common::Measurement;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterEvent, Command, ECHONET_PORT, event};
use crate::config::AcquisitionConfig;
use crate::echonet::{DecodeError, EncodeError, Frame, ServiceCode};
use crate::join::Session;
use crate::properties::{self, EnergyHistory, EnergyScale, epc};
use crate::transport::{Transport, TransportError};

/// Properties requested on every cycle.
const CYCLE_PROPERTIES: [u8; 5] = [
    epc::INSTANT_POWER,
    epc::INSTANT_CURRENT,
    epc::CUMULATIVE_ENERGY,
    epc::FIXED_TIME_ENERGY,
    epc::ENERGY_HISTORY,
];

/// Properties requested once per session.
const SCALE_PROPERTIES: [u8; 2] = [epc::COEFFICIENT, epc::ENERGY_UNIT];

const TODAY: u8 = 0x00;
const YESTERDAY: u8 = 0x01;

/// Errors raised by one acquisition attempt.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Timed out waiting for the meter's response")]
    Timeout,

    #[error("Malformed response frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("Request could not be encoded: {0}")]
    Encode(#[from] EncodeError),

    #[error("Meter refused every requested property")]
    Rejected,

    #[error("Response carried neither instantaneous power nor cumulative energy")]
    MissingPrimary,

    #[error("Session lost (EVENT {0:02X})")]
    Disconnected(u8),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl From<TransportError> for AcquisitionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => AcquisitionError::Cancelled,
            TransportError::Timeout(_) => AcquisitionError::Timeout,
            other => AcquisitionError::Transport(other),
        }
    }
}

impl AcquisitionError {
    /// Whether another attempt in the same cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AcquisitionError::Timeout
            | AcquisitionError::Decode(_)
            | AcquisitionError::Rejected
            | AcquisitionError::MissingPrimary => true,
            AcquisitionError::Transport(e) => matches!(
                e,
                TransportError::CommandFailed { .. } | TransportError::Busy { .. }
            ),
            _ => false,
        }
    }

    /// Whether the session must be dropped and rebuilt.
    pub fn tears_down_session(&self) -> bool {
        match self {
            AcquisitionError::Disconnected(_) => true,
            AcquisitionError::Transport(e) => matches!(
                e,
                TransportError::Closed | TransportError::Io(_) | TransportError::Serial(_)
            ),
            _ => false,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AcquisitionError::Timeout => "timeout",
            AcquisitionError::Decode(_) => "decode",
            AcquisitionError::Encode(_) => "encode",
            AcquisitionError::Rejected => "rejected",
            AcquisitionError::MissingPrimary => "missing_primary",
            AcquisitionError::Disconnected(_) => "disconnected",
            AcquisitionError::Transport(_) => "transport",
            AcquisitionError::Cancelled => "cancelled",
        }
    }
}

fn is_disconnect(code: u8) -> bool {
    matches!(
        code,
        event::JOIN_FAILED
            | event::SESSION_TERMINATE_REQUESTED
            | event::SESSION_TERMINATED
            | event::SESSION_TERMINATE_TIMEOUT
    )
}

/// Reads measurements from the meter.
#[derive(Debug, Clone)]
pub struct Acquirer {
    config: AcquisitionConfig,
    offset: FixedOffset,
}

impl Acquirer {
    /// `offset` is the UTC offset of the meter's clock.
    pub fn new(config: AcquisitionConfig, offset: FixedOffset) -> Self {
        Self { config, offset }
    }

    pub async fn acquire(
        &self,
        transport: &mut Transport,
        session: &mut Session,
    ) -> Result<Measurement, AcquisitionError> {
        self.acquire_at(transport, session, Utc::now()).await
    }

    /// Acquire a measurement stamped `now`.
    pub async fn acquire_at(
        &self,
        transport: &mut Transport,
        session: &mut Session,
        now: DateTime<Utc>,
    ) -> Result<Measurement, AcquisitionError> {
        if session.history_day != Some(TODAY) {
            let selected = self.select_history_day(transport, session, TODAY).await;
            optional(selected, "select today's history")?;
        }

        let mut codes = CYCLE_PROPERTIES.to_vec();
        if session.history_day != Some(TODAY) {
            // E2 would describe whichever day the meter last had selected.
            codes.retain(|&code| code != epc::ENERGY_HISTORY);
        }
        if session.energy_scale.is_none() {
            codes.extend_from_slice(&SCALE_PROPERTIES);
        }

        let request = Frame::get_request(session.next_tid(), &codes);
        let response = self.exchange(transport, session, &request).await?;

        if response.properties.iter().all(|p| p.data.is_empty()) {
            return Err(AcquisitionError::Rejected);
        }
        if response.service == ServiceCode::GetSna {
            debug!(codes = ?unsupported(&response), "Meter did not supply some properties");
        }

        let value = |code: u8| {
            response
                .property(code)
                .map(|p| p.data.as_slice())
                .filter(|data| !data.is_empty())
        };

        if value(epc::INSTANT_POWER).is_none() && value(epc::CUMULATIVE_ENERGY).is_none() {
            return Err(AcquisitionError::MissingPrimary);
        }

        let scale = match session.energy_scale {
            Some(scale) => scale,
            None => match EnergyScale::from_properties(
                value(epc::COEFFICIENT),
                value(epc::ENERGY_UNIT),
            ) {
                Ok(scale) => {
                    info!(
                        coefficient = scale.coefficient,
                        exponent = scale.exponent,
                        "Cached cumulative energy scale"
                    );
                    session.energy_scale = Some(scale);
                    scale
                }
                Err(e) => {
                    warn!(error = %e, "Unusable energy scale, assuming 1 kWh per count");
                    EnergyScale::default()
                }
            },
        };

        let mut measurement = Measurement::new(now);

        if let Some(data) = value(epc::INSTANT_POWER) {
            measurement.instant_power_w = parsed(properties::instant_power(data)).flatten();
        }

        if let Some(currents) =
            value(epc::INSTANT_CURRENT).and_then(|d| parsed(properties::instant_current(d)))
        {
            measurement.current_a = currents.total;
            measurement.current_r_a = currents.r;
            measurement.current_t_a = currents.t;
        }

        if let Some(data) = value(epc::CUMULATIVE_ENERGY) {
            measurement.cumulative_power_kwh = parsed(properties::cumulative_energy(data))
                .flatten()
                .map(|raw| scale.to_kwh(raw.into()));
        }

        if let Some(reading) = value(epc::FIXED_TIME_ENERGY)
            .and_then(|d| parsed(properties::fixed_time_energy(d, self.offset)))
        {
            measurement.historical_timestamp = Some(reading.timestamp);
            measurement.historical_cumulative_power_kwh =
                reading.raw.map(|raw| scale.to_kwh(raw.into()));
        }

        if let Some(today) =
            value(epc::ENERGY_HISTORY).and_then(|d| parsed(properties::energy_history(d)))
        {
            let yesterday = if today.valid_slots() < 2 {
                debug!(valid_slots = today.valid_slots(), "Reading previous day's history");
                self.yesterday_history(transport, session).await?
            } else {
                None
            };

            let date = now.with_timezone(&self.offset).date_naive();
            if let Some(recent) =
                properties::recent_consumption(&today, yesterday.as_ref(), date, self.offset, scale)
            {
                measurement.recent_30min_timestamp = Some(recent.timestamp);
                measurement.recent_30min_consumption_kwh = Some(recent.kwh);
            }
        }

        debug!(populated = measurement.populated_fields(), "Measurement assembled");
        Ok(measurement)
    }

    async fn yesterday_history(
        &self,
        transport: &mut Transport,
        session: &mut Session,
    ) -> Result<Option<EnergyHistory>, AcquisitionError> {
        let selected = self.select_history_day(transport, session, YESTERDAY).await;
        let history = match optional(selected, "select previous day's history")? {
            Some(true) => {
                let request = Frame::get_request(session.next_tid(), &[epc::ENERGY_HISTORY]);
                let read = self.exchange(transport, session, &request).await;
                optional(read, "read previous day's history")?
            }
            _ => None,
        };

        if session.history_day != Some(TODAY) {
            let restored = self.select_history_day(transport, session, TODAY).await;
            optional(restored, "restore today's history")?;
        }

        Ok(history
            .as_ref()
            .and_then(|frame| frame.property(epc::ENERGY_HISTORY))
            .filter(|p| !p.data.is_empty())
            .and_then(|p| parsed(properties::energy_history(&p.data))))
    }

    /// Point `E2` at `day`. Returns false if the meter refused.
    ///
    /// The selected day is unknown until the meter confirms, so a request
    /// that goes unanswered is reselected on the next cycle.
    async fn select_history_day(
        &self,
        transport: &mut Transport,
        session: &mut Session,
        day: u8,
    ) -> Result<bool, AcquisitionError> {
        session.history_day = None;
        let request = Frame::set_request(session.next_tid(), epc::HISTORY_DAY, vec![day]);
        let response = self.exchange(transport, session, &request).await?;

        if response.service == ServiceCode::SetRes {
            session.history_day = Some(day);
            Ok(true)
        } else {
            warn!(day, "Meter refused to select history day");
            Ok(false)
        }
    }

    /// Send `request` and wait for the frame answering it.
    async fn exchange(
        &self,
        transport: &mut Transport,
        session: &Session,
        request: &Frame,
    ) -> Result<Frame, AcquisitionError> {
        let command = Command::SendTo {
            address: session.identity().address,
            payload: request.encode()?,
        };

        let early = transport
            .execute(&command, self.config.command_timeout())
            .await?;
        for reply in &early {
            if let Some(result) = correlate(reply, request) {
                return result;
            }
        }

        let deadline = Instant::now() + self.config.response_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reply = transport
                .await_event(
                    |e| {
                        matches!(e, AdapterEvent::Udp(_))
                            || e.event_code().is_some_and(is_disconnect)
                    },
                    remaining,
                )
                .await?;

            if let Some(result) = correlate(&reply, request) {
                return result;
            }
        }
    }
}

/// Match an adapter event against the outstanding request.
fn correlate(reply: &AdapterEvent, request: &Frame) -> Option<Result<Frame, AcquisitionError>> {
    match reply {
        AdapterEvent::Event(notice) if is_disconnect(notice.code) => {
            warn!(code = %format!("{:02X}", notice.code), "Meter session lost");
            Some(Err(AcquisitionError::Disconnected(notice.code)))
        }
        AdapterEvent::Udp(datagram) if datagram.remote_port == ECHONET_PORT => {
            match Frame::decode(&datagram.payload) {
                Ok(frame) if frame.answers(request) => Some(Ok(frame)),
                Ok(frame) => {
                    debug!(tid = frame.tid, service = ?frame.service, "Ignoring unrelated frame");
                    None
                }
                Err(e) => Some(Err(e.into())),
            }
        }
        _ => None,
    }
}

fn unsupported(frame: &Frame) -> Vec<String> {
    frame
        .properties
        .iter()
        .filter(|p| p.data.is_empty())
        .map(|p| format!("{:02X}", p.code))
        .collect()
}

/// Outcome of an optional history step. Failures that leave the session
/// usable are logged and dropped.
fn optional<T>(
    result: Result<T, AcquisitionError>,
    step: &str,
) -> Result<Option<T>, AcquisitionError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.tears_down_session() || matches!(e, AcquisitionError::Cancelled) => Err(e),
        Err(e) => {
            warn!(
                step,
                kind = e.kind(),
                error = %e,
                "History step failed, continuing without it"
            );
            Ok(None)
        }
    }
}

/// Keep a decoded value, or log and drop a malformed one.
fn parsed<T>(result: Result<T, properties::ValueError>) -> Option<T> {
    result
        .map_err(|e| warn!(error = %e, "Ignoring malformed property"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::NetworkIdentity;
    use crate::properties::HISTORY_SLOTS;
    use crate::testing::{CommandLog, METER_ADDR, MeterSim, adapter_reply, erxudp, fake_adapter};
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn acquirer() -> Acquirer {
        Acquirer::new(AcquisitionConfig::default(), jst())
    }

    fn session() -> Session {
        Session::new(NetworkIdentity {
            channel: 0x21,
            pan_id: 0x8888,
            mac: None,
            address: METER_ADDR.parse().unwrap(),
        })
    }

    /// 2024-06-01 10:05 JST.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 1, 5, 0).unwrap()
    }

    fn history(day: u16, values: &[(usize, u32)]) -> Vec<u8> {
        let mut slots = vec![0xFFFF_FFFEu32; HISTORY_SLOTS];
        for &(i, v) in values {
            slots[i] = v;
        }
        let mut data = day.to_be_bytes().to_vec();
        for v in slots {
            data.extend_from_slice(&v.to_be_bytes());
        }
        data
    }

    fn three_wire_meter() -> MeterSim {
        let mut sim = MeterSim::default()
            .with(epc::INSTANT_POWER, &[0x00, 0x00, 0x07, 0x1C])
            .with(epc::INSTANT_CURRENT, &[0x00, 0x65, 0x00, 0x52])
            .with(epc::CUMULATIVE_ENERGY, &[0x00, 0x01, 0xE2, 0x40])
            .with(epc::COEFFICIENT, &[0x00, 0x00, 0x00, 0x01])
            .with(epc::ENERGY_UNIT, &[0x01])
            .with(
                epc::FIXED_TIME_ENERGY,
                &[0x07, 0xE8, 6, 1, 19, 0, 0, 0x00, 0x01, 0xE2, 0x3B],
            );
        sim.history
            .insert(0, history(0, &[(18, 123300), (19, 123400), (20, 123451)]));
        sim
    }

    fn connect(sim: &Arc<Mutex<MeterSim>>) -> (Transport, CommandLog) {
        let sim = sim.clone();
        fake_adapter(move |line, payload| adapter_reply(line, payload, &sim))
    }

    /// Like [`connect`], but SetC requests selecting `day` are acknowledged
    /// by the adapter and never answered by the meter.
    fn connect_ignoring_select(sim: &Arc<Mutex<MeterSim>>, day: u8) -> (Transport, CommandLog) {
        let sim = sim.clone();
        fake_adapter(move |line, payload| {
            let ignored = Frame::decode(payload).is_ok_and(|f| {
                f.service == ServiceCode::SetC
                    && f.property(epc::HISTORY_DAY).is_some_and(|p| p.data == [day])
            });
            if ignored {
                vec!["OK".into()]
            } else {
                adapter_reply(line, payload, &sim)
            }
        })
    }

    /// Property codes of each Get request sent so far.
    fn get_requests(log: &CommandLog) -> Vec<Vec<u8>> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("SKSENDTO"))
            .filter_map(|l| hex::decode(l.split_whitespace().last()?).ok())
            .filter_map(|bytes| Frame::decode(&bytes).ok())
            .filter(|f| f.service == ServiceCode::Get)
            .map(|f| f.property_codes())
            .collect()
    }

    #[tokio::test]
    async fn test_three_wire_measurement() {
        let sim = Arc::new(Mutex::new(three_wire_meter()));
        let (mut transport, log) = connect(&sim);
        let mut session = session();

        let m = acquirer()
            .acquire_at(&mut transport, &mut session, now())
            .await
            .unwrap();

        assert_eq!(m.timestamp, now());
        assert_eq!(m.instant_power_w, Some(1820));
        assert_eq!(m.cumulative_power_kwh, Some(12345.6));
        assert_eq!(m.current_r_a, Some(10.1));
        assert_eq!(m.current_t_a, Some(8.2));
        assert_eq!(m.current_a, Some(18.3));
        assert_eq!(
            m.historical_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(m.historical_cumulative_power_kwh, Some(12345.1));
        // Slot 20 starts at 10:00 JST.
        assert_eq!(
            m.recent_30min_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 1, 0, 0).unwrap())
        );
        assert_eq!(m.recent_30min_consumption_kwh, Some(5.1));

        assert_eq!(
            session.energy_scale(),
            Some(EnergyScale {
                coefficient: 1,
                exponent: -1
            })
        );
        assert_eq!(
            get_requests(&log),
            vec![vec![0xE7, 0xE8, 0xE0, 0xEA, 0xE2, 0xD3, 0xE1]]
        );
    }

    #[tokio::test]
    async fn test_scale_requested_once_per_session() {
        let sim = Arc::new(Mutex::new(three_wire_meter()));
        let (mut transport, log) = connect(&sim);
        let mut session = session();
        let acquirer = acquirer();

        acquirer.acquire_at(&mut transport, &mut session, now()).await.unwrap();
        let second = acquirer.acquire_at(&mut transport, &mut session, now()).await.unwrap();

        assert_eq!(second.cumulative_power_kwh, Some(12345.6));
        let requests = get_requests(&log);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1], CYCLE_PROPERTIES.to_vec());

        // E5 is selected once per session.
        let sets = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("SKSENDTO") && l.ends_with("6101E50100"))
            .count();
        assert_eq!(sets, 1);
    }

    #[tokio::test]
    async fn test_two_wire_measurement() {
        let sim = three_wire_meter().with(epc::INSTANT_CURRENT, &[0x00, 0x65, 0x7F, 0xFE]);
        let sim = Arc::new(Mutex::new(sim));
        let (mut transport, _log) = connect(&sim);

        let m = acquirer()
            .acquire_at(&mut transport, &mut session(), now())
            .await
            .unwrap();

        assert_eq!(m.current_r_a, Some(10.1));
        assert_eq!(m.current_t_a, None);
        assert_eq!(m.current_a, Some(10.1));
    }

    #[tokio::test]
    async fn test_partial_response_leaves_fields_unset() {
        let mut sim = MeterSim::default().with(epc::INSTANT_POWER, &[0xFF, 0xFF, 0xFF, 0x38]);
        sim.history.clear();
        let sim = Arc::new(Mutex::new(sim));
        let (mut transport, _log) = connect(&sim);

        let m = acquirer()
            .acquire_at(&mut transport, &mut session(), now())
            .await
            .unwrap();

        assert_eq!(m.instant_power_w, Some(-200));
        assert_eq!(m.cumulative_power_kwh, None);
        assert_eq!(m.current_a, None);
        assert_eq!(m.recent_30min_consumption_kwh, None);
    }

    #[tokio::test]
    async fn test_missing_primary_properties() {
        let sim = MeterSim::default().with(epc::INSTANT_CURRENT, &[0x00, 0x65, 0x00, 0x52]);
        let sim = Arc::new(Mutex::new(sim));
        let (mut transport, _log) = connect(&sim);

        let err = acquirer()
            .acquire_at(&mut transport, &mut session(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::MissingPrimary));
        assert!(err.is_retryable());
        assert!(!err.tears_down_session());
    }

    #[tokio::test]
    async fn test_every_property_refused() {
        let sim = Arc::new(Mutex::new(MeterSim::default()));
        let (mut transport, _log) = connect(&sim);

        let err = acquirer()
            .acquire_at(&mut transport, &mut session(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Rejected));
    }

    #[tokio::test]
    async fn test_history_falls_back_to_yesterday() {
        let mut sim = three_wire_meter();
        sim.history.insert(0, history(0, &[(0, 123400)]));
        sim.history.insert(1, history(1, &[(46, 123380), (47, 123390)]));
        let sim = Arc::new(Mutex::new(sim));
        let (mut transport, log) = connect(&sim);
        let mut session = session();

        let m = acquirer()
            .acquire_at(&mut transport, &mut session, now())
            .await
            .unwrap();

        assert_eq!(m.recent_30min_consumption_kwh, Some(1.0));
        // Today's first slot: 00:00 JST.
        assert_eq!(
            m.recent_30min_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 31, 15, 0, 0).unwrap())
        );
        assert_eq!(sim.lock().unwrap().history_day, 0);
        assert_eq!(session.history_day, Some(0));

        let sets: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("SKSENDTO") && l.contains("6101E501"))
            .map(|l| l[l.len() - 2..].to_string())
            .collect();
        assert_eq!(sets, vec!["00", "01", "00"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_history_select_keeps_measurement() {
        let sim = Arc::new(Mutex::new(three_wire_meter()));
        let (mut transport, log) = connect_ignoring_select(&sim, 0);
        let mut session = session();
        let acquirer = acquirer();

        let m = acquirer
            .acquire_at(&mut transport, &mut session, now())
            .await
            .unwrap();

        assert_eq!(m.instant_power_w, Some(1820));
        assert_eq!(m.cumulative_power_kwh, Some(12345.6));
        assert_eq!(m.current_a, Some(18.3));
        assert_eq!(m.recent_30min_timestamp, None);
        assert_eq!(m.recent_30min_consumption_kwh, None);
        assert_eq!(session.history_day, None);
        // E2 is left out while the selected day is unknown.
        assert_eq!(
            get_requests(&log),
            vec![vec![0xE7, 0xE8, 0xE0, 0xEA, 0xD3, 0xE1]]
        );

        // The next cycle tries the select again.
        acquirer
            .acquire_at(&mut transport, &mut session, now())
            .await
            .unwrap();
        let selects = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("SKSENDTO") && l.ends_with("6101E50100"))
            .count();
        assert_eq!(selects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_previous_day_select_keeps_measurement() {
        let mut sim = three_wire_meter();
        sim.history.insert(0, history(0, &[(0, 123400)]));
        sim.history.insert(1, history(1, &[(46, 123380), (47, 123390)]));
        let sim = Arc::new(Mutex::new(sim));
        let (mut transport, log) = connect_ignoring_select(&sim, 1);
        let mut session = session();

        let m = acquirer()
            .acquire_at(&mut transport, &mut session, now())
            .await
            .unwrap();

        assert_eq!(m.instant_power_w, Some(1820));
        assert_eq!(m.cumulative_power_kwh, Some(12345.6));
        // One valid slot today and no previous day: no delta.
        assert_eq!(m.recent_30min_consumption_kwh, None);
        assert_eq!(m.recent_30min_timestamp, None);

        // Today is reselected after the unanswered request.
        assert_eq!(session.history_day, Some(0));
        assert_eq!(sim.lock().unwrap().history_day, 0);
        let sets: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("SKSENDTO") && l.contains("6101E501"))
            .map(|l| l[l.len() - 2..].to_string())
            .collect();
        assert_eq!(sets, vec!["00", "01", "00"]);
        // The previous day's E2 is never read.
        assert_eq!(get_requests(&log).len(), 1);
    }

    #[tokio::test]
    async fn test_session_loss_during_history_select_fails() {
        let sim = Arc::new(Mutex::new(three_wire_meter()));
        let meter = sim.clone();
        let (mut transport, _log) = fake_adapter(move |line, payload| {
            let select = Frame::decode(payload).is_ok_and(|f| f.service == ServiceCode::SetC);
            if select {
                vec!["OK".into(), format!("EVENT 28 {}", METER_ADDR)]
            } else {
                adapter_reply(line, payload, &meter)
            }
        });

        let err = acquirer()
            .acquire_at(&mut transport, &mut session(), now())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionError::Disconnected(0x28)));
        assert!(err.tears_down_session());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout() {
        let (mut transport, _log) = fake_adapter(|_, _| vec!["OK".into()]);

        let started = Instant::now();
        let err = acquirer()
            .acquire_at(&mut transport, &mut session(), now())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionError::Timeout));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_session() {
        let (mut transport, _log) = fake_adapter(|_, _| {
            vec!["OK".into(), format!("EVENT 27 {}", METER_ADDR)]
        });

        let err = acquirer()
            .acquire_at(&mut transport, &mut session(), now())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionError::Disconnected(0x27)));
        assert!(err.tears_down_session());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_decode_error() {
        let (mut transport, _log) = fake_adapter(|_, _| {
            vec!["OK".into(), erxudp(&[0x10, 0x81, 0x00, 0x01])]
        });

        let err = acquirer()
            .acquire_at(&mut transport, &mut session(), now())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionError::Decode(DecodeError::Truncated { .. })));
        assert!(err.is_retryable());
    }
}
