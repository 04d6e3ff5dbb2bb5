//! Smart-meter property codes (EPC) and their payload decoders.
//!
//! All values are big-endian. Decoders map the meter's "not available"
//! sentinels to `None`; they never substitute zero.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// Property codes of the low-voltage smart electric energy meter class.
pub mod epc {
    /// Coefficient for cumulative energy (unsigned 32-bit).
    pub const COEFFICIENT: u8 = 0xD3;
    /// Measured cumulative forward energy (unsigned 32-bit count).
    pub const CUMULATIVE_ENERGY: u8 = 0xE0;
    /// Unit of cumulative energy (power-of-ten code).
    pub const ENERGY_UNIT: u8 = 0xE1;
    /// Cumulative energy history 1: day index + 48 half-hour counts.
    pub const ENERGY_HISTORY: u8 = 0xE2;
    /// Day selector for `ENERGY_HISTORY` (0 = today, 1 = yesterday, ...).
    pub const HISTORY_DAY: u8 = 0xE5;
    /// Instantaneous power in watts (signed 32-bit).
    pub const INSTANT_POWER: u8 = 0xE7;
    /// Instantaneous R/T phase currents in 0.1 A (signed 16-bit each).
    pub const INSTANT_CURRENT: u8 = 0xE8;
    /// Cumulative forward energy at the latest fixed 30-minute boundary.
    pub const FIXED_TIME_ENERGY: u8 = 0xEA;
}

/// Half-hour slots in one day of `ENERGY_HISTORY`.
pub const HISTORY_SLOTS: usize = 48;

/// Counter value meaning "no data" in energy properties.
const NO_DATA_U32: u32 = 0xFFFF_FFFE;

/// Errors raised when a property payload has an unexpected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("Property {code:#04x}: unexpected payload length {len}")]
    Length { code: u8, len: usize },

    #[error("Property {code:#04x}: invalid date/time")]
    InvalidDateTime { code: u8 },
}

fn fixed<const N: usize>(code: u8, data: &[u8]) -> Result<[u8; N], ValueError> {
    data.try_into().map_err(|_| ValueError::Length {
        code,
        len: data.len(),
    })
}

/// Signed 32-bit value with underflow/overflow/no-data sentinels removed.
pub fn signed_32(bytes: [u8; 4]) -> Option<i32> {
    match u32::from_be_bytes(bytes) {
        0x8000_0000 | 0x7FFF_FFFF | 0x7FFF_FFFE => None,
        raw => Some(raw as i32),
    }
}

/// Signed 16-bit value with underflow/overflow/no-data sentinels removed.
pub fn signed_16(bytes: [u8; 2]) -> Option<i16> {
    match u16::from_be_bytes(bytes) {
        0x8000 | 0x7FFF | 0x7FFE => None,
        raw => Some(raw as i16),
    }
}

fn counter(bytes: [u8; 4]) -> Option<u32> {
    match u32::from_be_bytes(bytes) {
        NO_DATA_U32 => None,
        raw => Some(raw),
    }
}

/// `E7`: instantaneous power in watts.
pub fn instant_power(data: &[u8]) -> Result<Option<i64>, ValueError> {
    let bytes = fixed::<4>(epc::INSTANT_POWER, data)?;
    Ok(signed_32(bytes).map(i64::from))
}

/// Decoded `E8` phase currents, in amperes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseCurrents {
    pub r: Option<f64>,
    /// Absent on single-phase 2-wire services.
    pub t: Option<f64>,
    /// R alone for 2-wire, R + T for 3-wire.
    pub total: Option<f64>,
}

/// `E8`: instantaneous current.
///
/// A T-phase value of `0x7FFE` (or a 2-byte payload) marks a single-phase
/// 2-wire service.
pub fn instant_current(data: &[u8]) -> Result<PhaseCurrents, ValueError> {
    let (r_raw, t_bytes) = match data.len() {
        2 => (signed_16([data[0], data[1]]), None),
        4 => (signed_16([data[0], data[1]]), Some([data[2], data[3]])),
        len => {
            return Err(ValueError::Length {
                code: epc::INSTANT_CURRENT,
                len,
            });
        }
    };

    let two_wire = match t_bytes {
        None => true,
        Some(bytes) => u16::from_be_bytes(bytes) == 0x7FFE,
    };

    let amps = |deci: i32| f64::from(deci) / 10.0;

    if two_wire {
        return Ok(PhaseCurrents {
            r: r_raw.map(|r| amps(r.into())),
            t: None,
            total: r_raw.map(|r| amps(r.into())),
        });
    }

    let t_raw = t_bytes.and_then(signed_16);
    let total = match (r_raw, t_raw) {
        (Some(r), Some(t)) => Some(amps(i32::from(r) + i32::from(t))),
        _ => None,
    };

    Ok(PhaseCurrents {
        r: r_raw.map(|r| amps(r.into())),
        t: t_raw.map(|t| amps(t.into())),
        total,
    })
}

/// `E0`: cumulative energy as a raw count.
pub fn cumulative_energy(data: &[u8]) -> Result<Option<u32>, ValueError> {
    Ok(counter(fixed::<4>(epc::CUMULATIVE_ENERGY, data)?))
}

/// Conversion from raw energy counts to kWh: `raw × coefficient × 10^exponent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyScale {
    pub coefficient: u32,
    pub exponent: i32,
}

impl Default for EnergyScale {
    fn default() -> Self {
        Self {
            coefficient: 1,
            exponent: 0,
        }
    }
}

impl EnergyScale {
    /// Build from the `D3` and `E1` payloads. A missing coefficient is 1;
    /// a missing or unknown unit is 10^0.
    pub fn from_properties(
        coefficient: Option<&[u8]>,
        unit: Option<&[u8]>,
    ) -> Result<Self, ValueError> {
        let coefficient = match coefficient {
            Some(data) => u32::from_be_bytes(fixed::<4>(epc::COEFFICIENT, data)?),
            None => 1,
        };
        let exponent = match unit {
            Some(data) => unit_exponent(fixed::<1>(epc::ENERGY_UNIT, data)?[0]),
            None => 0,
        };
        Ok(Self {
            coefficient,
            exponent,
        })
    }

    /// Convert a raw count (or count difference) to kWh.
    ///
    /// Negative exponents divide so that e.g. 123456 × 10^-1 is exactly 12345.6.
    pub fn to_kwh(&self, raw: i64) -> f64 {
        let scaled = raw as f64 * f64::from(self.coefficient);
        if self.exponent < 0 {
            scaled / 10f64.powi(-self.exponent)
        } else {
            scaled * 10f64.powi(self.exponent)
        }
    }
}

/// Map an `E1` unit code to a power-of-ten exponent.
pub fn unit_exponent(code: u8) -> i32 {
    match code {
        0x00..=0x04 => -i32::from(code),
        0x0A..=0x0D => i32::from(code - 0x09),
        other => {
            tracing::warn!(unit_code = other, "Unknown energy unit code, assuming 1 kWh");
            0
        }
    }
}

/// Decoded `EA` reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTimeReading {
    pub timestamp: DateTime<Utc>,
    pub raw: Option<u32>,
}

fn local_to_utc(local: NaiveDateTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `EA`: year(2) month day hour minute second + count(4), meter-local time.
pub fn fixed_time_energy(data: &[u8], offset: FixedOffset) -> Result<FixedTimeReading, ValueError> {
    let code = epc::FIXED_TIME_ENERGY;
    let bytes = fixed::<11>(code, data)?;

    let year = i32::from(u16::from_be_bytes([bytes[0], bytes[1]]));
    let local = NaiveDate::from_ymd_opt(year, bytes[2].into(), bytes[3].into())
        .and_then(|date| date.and_hms_opt(bytes[4].into(), bytes[5].into(), bytes[6].into()))
        .ok_or(ValueError::InvalidDateTime { code })?;
    let timestamp = local_to_utc(local, offset).ok_or(ValueError::InvalidDateTime { code })?;

    Ok(FixedTimeReading {
        timestamp,
        raw: counter([bytes[7], bytes[8], bytes[9], bytes[10]]),
    })
}

/// Decoded `E2` payload: one day of half-hour cumulative counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnergyHistory {
    /// Day index echoed by the meter (0 = today).
    pub day: u16,
    /// Count at the start of each half-hour slot, `None` where missing.
    pub slots: Vec<Option<u32>>,
}

impl EnergyHistory {
    pub fn valid_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// `E2`: day index(2) + 48 × count(4).
pub fn energy_history(data: &[u8]) -> Result<EnergyHistory, ValueError> {
    if data.len() != 2 + HISTORY_SLOTS * 4 {
        return Err(ValueError::Length {
            code: epc::ENERGY_HISTORY,
            len: data.len(),
        });
    }

    let day = u16::from_be_bytes([data[0], data[1]]);
    let slots = data[2..]
        .chunks_exact(4)
        .map(|c| counter([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(EnergyHistory { day, slots })
}

/// Consumption over the most recent complete half hour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecentConsumption {
    /// Start of the latest valid slot.
    pub timestamp: DateTime<Utc>,
    pub kwh: f64,
}

/// Difference between the two latest valid history slots.
///
/// `today` is the meter-local date of `today_history`; when given,
/// `yesterday_history` precedes it so that the first slot of the day can
/// be compared with the last slot of the previous day.
pub fn recent_consumption(
    today_history: &EnergyHistory,
    yesterday_history: Option<&EnergyHistory>,
    today: NaiveDate,
    offset: FixedOffset,
    scale: EnergyScale,
) -> Option<RecentConsumption> {
    let yesterday = today.pred_opt()?;

    let mut valid = today_history
        .slots
        .iter()
        .enumerate()
        .rev()
        .filter_map(|(i, v)| v.map(|v| (today, i, v)))
        .chain(yesterday_history.into_iter().flat_map(move |h| {
            h.slots
                .iter()
                .enumerate()
                .rev()
                .filter_map(move |(i, v)| v.map(|v| (yesterday, i, v)))
        }));

    let (date, slot, latest) = valid.next()?;
    let (_, _, previous) = valid.next()?;

    if latest < previous {
        tracing::warn!(latest, previous, "Energy history decreased, skipping consumption");
        return None;
    }

    let local = date.and_hms_opt(0, 0, 0)? + Duration::minutes(30 * slot as i64);

    Some(RecentConsumption {
        timestamp: local_to_utc(local, offset)?,
        kwh: scale.to_kwh(i64::from(latest) - i64::from(previous)),
    })
}
