use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One normalized reading taken from the smart meter.
///
/// Serializes to a flat record whose keys are always present; fields the
/// meter did not report (or does not support for its wiring) are `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// UTC instant the acquisition cycle ran.
    pub timestamp: DateTime<Utc>,

    /// Cumulative forward energy, scaled to kWh.
    pub cumulative_power_kwh: Option<f64>,

    /// Instantaneous power in watts (negative when exporting).
    pub instant_power_w: Option<i64>,

    /// Representative current: R for 2-wire, R + T for 3-wire.
    pub current_a: Option<f64>,

    /// R-phase current.
    pub current_r_a: Option<f64>,

    /// T-phase current, absent on single-phase 2-wire services.
    pub current_t_a: Option<f64>,

    /// Time of the latest fixed 30-minute cumulative reading.
    pub historical_timestamp: Option<DateTime<Utc>>,

    /// Cumulative energy at `historical_timestamp`.
    pub historical_cumulative_power_kwh: Option<f64>,

    /// Start of the most recent complete 30-minute slot.
    pub recent_30min_timestamp: Option<DateTime<Utc>>,

    /// Energy consumed during that slot.
    pub recent_30min_consumption_kwh: Option<f64>,
}

impl Measurement {
    /// Record keys in output order.
    pub const FIELDS: [&'static str; 10] = [
        "timestamp",
        "cumulative_power_kwh",
        "instant_power_w",
        "current_a",
        "current_r_a",
        "current_t_a",
        "historical_timestamp",
        "historical_cumulative_power_kwh",
        "recent_30min_timestamp",
        "recent_30min_consumption_kwh",
    ];

    /// Create an empty measurement stamped at `timestamp`.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cumulative_power_kwh: None,
            instant_power_w: None,
            current_a: None,
            current_r_a: None,
            current_t_a: None,
            historical_timestamp: None,
            historical_cumulative_power_kwh: None,
            recent_30min_timestamp: None,
            recent_30min_consumption_kwh: None,
        }
    }

    /// Number of meter-derived fields that carry a value.
    pub fn populated_fields(&self) -> usize {
        [
            self.cumulative_power_kwh.is_some(),
            self.instant_power_w.is_some(),
            self.current_a.is_some(),
            self.current_r_a.is_some(),
            self.current_t_a.is_some(),
            self.historical_timestamp.is_some(),
            self.historical_cumulative_power_kwh.is_some(),
            self.recent_30min_timestamp.is_some(),
            self.recent_30min_consumption_kwh.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn opt<T: std::fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map_or_else(|| "-".to_string(), |v| v.to_string())
        }

        write!(
            f,
            "{} cumulative={} kWh power={} W current={} A (R={} T={})",
            self.timestamp.to_rfc3339(),
            opt(&self.cumulative_power_kwh),
            opt(&self.instant_power_w),
            opt(&self.current_a),
            opt(&self.current_r_a),
            opt(&self.current_t_a),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_absent_fields_serialize_as_null() {
        let m = Measurement::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        let value = serde_json::to_value(&m).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object.len(), Measurement::FIELDS.len());
        for key in Measurement::FIELDS {
            assert!(object.contains_key(key), "missing key {key}");
        }
        assert!(object["current_t_a"].is_null());
        assert!(object["instant_power_w"].is_null());
    }

    #[test]
    fn test_populated_fields() {
        let mut m = Measurement::new(Utc::now());
        assert_eq!(m.populated_fields(), 0);

        m.instant_power_w = Some(-120);
        m.current_r_a = Some(1.5);
        assert_eq!(m.populated_fields(), 2);
    }

    #[test]
    fn test_display_marks_missing_values() {
        let mut m = Measurement::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        m.instant_power_w = Some(450);

        let text = m.to_string();
        assert!(text.contains("power=450 W"));
        assert!(text.contains("T=-"));
    }
}
