//! Core domain model for meterlog: historian payloads and persisted flow reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "meterlog-core";

/// Row cap applied when a query carries no filter at all.
pub const UNFILTERED_QUERY_LIMIT: i64 = 100;

/// A single historian tag reading, reduced to the shapes the historian emits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TagValue {
    Text(String),
    Number(f64),
    Boolean(bool),
    /// `{ "u": <unit>, "v": <number> }`
    Unit { unit: String, value: f64 },
}

impl TagValue {
    /// Classify a raw JSON leaf. Arrays, null and objects that are not
    /// `{u, v}` pairs have no tag-value reading.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::Bool(b) => Some(Self::Boolean(*b)),
            Value::Object(map) => {
                let unit = map.get("u").and_then(Value::as_str)?;
                let value = map.get("v").and_then(Value::as_f64)?;
                Some(Self::Unit {
                    unit: unit.to_string(),
                    value,
                })
            }
            Value::Null | Value::Array(_) => None,
        }
    }

    pub fn to_number(&self) -> Option<f64> {
        match self {
            Self::Text(text) => parse_numeric_text(text),
            Self::Number(n) => n.is_finite().then_some(*n),
            Self::Boolean(_) => None,
            Self::Unit { value, .. } => value.is_finite().then_some(*value),
        }
    }
}

/// Parse a numeric string, rejecting blanks and non-finite results.
/// Decimal and exponent notation only; hex literals such as `0x10` are
/// not numbers here.
pub fn parse_numeric_text(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// The seven measurement columns carried by every report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementField {
    Temperature,
    Pressure,
    MassFlow,
    AirIndex,
    TotalQuantity,
    StandardDensity,
    RawDensity,
}

impl MeasurementField {
    pub const ALL: [MeasurementField; 7] = [
        MeasurementField::Temperature,
        MeasurementField::Pressure,
        MeasurementField::MassFlow,
        MeasurementField::AirIndex,
        MeasurementField::TotalQuantity,
        MeasurementField::StandardDensity,
        MeasurementField::RawDensity,
    ];

    /// Column and JSON field name.
    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementField::Temperature => "temperature",
            MeasurementField::Pressure => "pressure",
            MeasurementField::MassFlow => "mass_flow",
            MeasurementField::AirIndex => "air_index",
            MeasurementField::TotalQuantity => "total_quantity",
            MeasurementField::StandardDensity => "standard_density",
            MeasurementField::RawDensity => "raw_density",
        }
    }
}

impl fmt::Display for MeasurementField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurements {
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub mass_flow: Option<f64>,
    pub air_index: Option<f64>,
    pub total_quantity: Option<f64>,
    pub standard_density: Option<f64>,
    pub raw_density: Option<f64>,
}

impl Measurements {
    pub fn get(&self, field: MeasurementField) -> Option<f64> {
        match field {
            MeasurementField::Temperature => self.temperature,
            MeasurementField::Pressure => self.pressure,
            MeasurementField::MassFlow => self.mass_flow,
            MeasurementField::AirIndex => self.air_index,
            MeasurementField::TotalQuantity => self.total_quantity,
            MeasurementField::StandardDensity => self.standard_density,
            MeasurementField::RawDensity => self.raw_density,
        }
    }

    pub fn set(&mut self, field: MeasurementField, value: Option<f64>) {
        let slot = match field {
            MeasurementField::Temperature => &mut self.temperature,
            MeasurementField::Pressure => &mut self.pressure,
            MeasurementField::MassFlow => &mut self.mass_flow,
            MeasurementField::AirIndex => &mut self.air_index,
            MeasurementField::TotalQuantity => &mut self.total_quantity,
            MeasurementField::StandardDensity => &mut self.standard_density,
            MeasurementField::RawDensity => &mut self.raw_density,
        };
        *slot = value;
    }
}

/// One timestamped historian reading of all tags of interest.
///
/// Extra historian fields (`PN`, `SN`, `rnd`) are accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub ts: Value,
    #[serde(default, deserialize_with = "lenient::tag_map")]
    pub tags: Option<Map<String, Value>>,
}

impl Snapshot {
    pub fn tag(&self, name: &str) -> Option<&Value> {
        self.tags.as_ref().and_then(|tags| tags.get(name))
    }
}

/// A batch submission as posted by the historian bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmission {
    #[serde(deserialize_with = "lenient::identifier")]
    pub meter_id: String,
    #[serde(deserialize_with = "lenient::identifier")]
    pub ship_name: String,
    #[serde(default, deserialize_with = "lenient::batch_number")]
    pub batch_number: Option<i64>,
    pub snapshots: Vec<Snapshot>,
}

/// Composite natural key of a report. Timestamps compare at millisecond precision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportKey {
    pub meter: String,
    pub ship: String,
    pub batch_number: Option<i64>,
    pub timestamp_ms: i64,
}

impl ReportKey {
    pub fn new(
        meter: impl Into<String>,
        ship: impl Into<String>,
        batch_number: Option<i64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            meter: meter.into(),
            ship: ship.into(),
            batch_number,
            timestamp_ms: timestamp.timestamp_millis(),
        }
    }
}

/// Output of snapshot normalization; the timestamp may still be unusable.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSnapshot {
    pub meter: String,
    pub ship: String,
    pub batch_number: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub measurements: Measurements,
}

impl NormalizedSnapshot {
    /// Promote to an insertable report, or `None` when the timestamp is invalid.
    pub fn into_new_report(self) -> Option<NewReport> {
        let timestamp = self.timestamp?;
        Some(NewReport {
            meter: self.meter,
            ship: self.ship,
            batch_number: self.batch_number,
            timestamp,
            measurements: self.measurements,
        })
    }
}

/// A report ready to be written to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewReport {
    pub meter: String,
    pub ship: String,
    pub batch_number: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub measurements: Measurements,
}

impl NewReport {
    pub fn key(&self) -> ReportKey {
        ReportKey::new(
            self.meter.clone(),
            self.ship.clone(),
            self.batch_number,
            self.timestamp,
        )
    }
}

/// A persisted `report` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: i64,
    pub meter: String,
    pub ship: String,
    pub batch_number: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub measurements: Measurements,
}

impl Report {
    pub fn key(&self) -> ReportKey {
        ReportKey::new(
            self.meter.clone(),
            self.ship.clone(),
            self.batch_number,
            self.timestamp,
        )
    }
}

/// AND-combined query filters; every bound is inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportFilter {
    pub meter_id: Option<String>,
    pub ship_name: Option<String>,
    pub batch_number: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl ReportFilter {
    pub fn is_unfiltered(&self) -> bool {
        self.meter_id.is_none()
            && self.ship_name.is_none()
            && self.batch_number.is_none()
            && self.from.is_none()
            && self.to.is_none()
    }

    pub fn matches(&self, report: &Report) -> bool {
        self.meter_id.as_deref().map_or(true, |m| report.meter == m)
            && self.ship_name.as_deref().map_or(true, |s| report.ship == s)
            && self.batch_number.map_or(true, |b| report.batch_number == Some(b))
            && self.from.map_or(true, |from| report.timestamp >= from)
            && self.to.map_or(true, |to| report.timestamp <= to)
    }
}

/// Meter and ship identifiers may arrive as strings or numbers; both are trimmed.
pub fn identifier_from_json(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidBatchNumber(pub String);

impl fmt::Display for InvalidBatchNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid batch_number: {}", self.0)
    }
}

impl std::error::Error for InvalidBatchNumber {}

/// Batch numbers are integers; numeric strings and integral floats are accepted.
pub fn batch_number_from_json(value: &Value) -> Result<Option<i64>, InvalidBatchNumber> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(Some(i));
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Some(f as i64)),
                _ => Err(InvalidBatchNumber(n.to_string())),
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i64>()
                .map(Some)
                .map_err(|_| InvalidBatchNumber(trimmed.to_string()))
        }
        other => Err(InvalidBatchNumber(other.to_string())),
    }
}

/// Lenient field deserializers for historian payloads.
pub mod lenient {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_json::{Map, Value};

    pub fn identifier<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        super::identifier_from_json(&value)
            .ok_or_else(|| D::Error::custom("expected a non-empty string or numeric identifier"))
    }

    pub fn batch_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        match value {
            None => Ok(None),
            Some(v) => super::batch_number_from_json(&v).map_err(D::Error::custom),
        }
    }

    /// Anything other than a JSON object is treated as an absent tag map.
    pub fn tag_map<'de, D>(deserializer: D) -> Result<Option<Map<String, Value>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Object(map) => Ok(Some(map)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn report(id: i64, meter: &str, ship: &str, batch: Option<i64>, secs: i64) -> Report {
        Report {
            id,
            meter: meter.into(),
            ship: ship.into(),
            batch_number: batch,
            timestamp: ts(secs),
            measurements: Measurements::default(),
        }
    }

    #[test]
    fn tag_value_classifies_historian_shapes() {
        assert_eq!(
            TagValue::from_json(&json!({"u": "degC", "v": 21.5})),
            Some(TagValue::Unit {
                unit: "degC".into(),
                value: 21.5
            })
        );
        assert_eq!(TagValue::from_json(&json!(true)), Some(TagValue::Boolean(true)));
        assert_eq!(TagValue::from_json(&json!([1, 2])), None);
        assert_eq!(TagValue::from_json(&json!({"v": 3})), None);
    }

    #[test]
    fn tag_value_to_number_per_variant() {
        assert_eq!(TagValue::Text(" 4.5 ".into()).to_number(), Some(4.5));
        assert_eq!(TagValue::Text("abc".into()).to_number(), None);
        assert_eq!(TagValue::Text("inf".into()).to_number(), None);
        assert_eq!(TagValue::Boolean(false).to_number(), None);
        assert_eq!(TagValue::Number(f64::NAN).to_number(), None);
        assert_eq!(
            TagValue::Unit {
                unit: "bar".into(),
                value: 2.0
            }
            .to_number(),
            Some(2.0)
        );
    }

    #[test]
    fn blank_numeric_text_is_not_zero() {
        assert_eq!(parse_numeric_text(""), None);
        assert_eq!(parse_numeric_text("   "), None);
        assert_eq!(parse_numeric_text("1e3"), Some(1000.0));
        assert_eq!(parse_numeric_text("0x10"), None);
    }

    #[test]
    fn batch_submission_accepts_numeric_ids_and_string_batch() {
        let sub: BatchSubmission = serde_json::from_value(json!({
            "meter_id": 17,
            "ship_name": "  Nordic Star ",
            "batch_number": "42",
            "snapshots": [{"ts": "2024-01-01T00:00:00Z", "PN": "x", "SN": 9}]
        }))
        .unwrap();
        assert_eq!(sub.meter_id, "17");
        assert_eq!(sub.ship_name, "Nordic Star");
        assert_eq!(sub.batch_number, Some(42));
        assert_eq!(sub.snapshots.len(), 1);
        assert!(sub.snapshots[0].tags.is_none());
    }

    #[test]
    fn batch_number_is_optional() {
        let sub: BatchSubmission = serde_json::from_value(json!({
            "meter_id": "m1",
            "ship_name": "s1",
            "snapshots": []
        }))
        .unwrap();
        assert_eq!(sub.batch_number, None);

        let err = batch_number_from_json(&json!("B-7")).unwrap_err();
        assert_eq!(err.to_string(), "invalid batch_number: B-7");
    }

    #[test]
    fn non_object_tags_are_treated_as_missing() {
        let snap: Snapshot = serde_json::from_value(json!({"ts": 1, "tags": null})).unwrap();
        assert!(snap.tags.is_none());
        assert!(snap.tag("LM_Run1!RUN1_TT_CUR").is_none());
    }

    #[test]
    fn report_key_ignores_sub_millisecond_precision() {
        let a = ts(1_700_000_000);
        let b = a + chrono::Duration::microseconds(300);
        assert_eq!(
            ReportKey::new("m", "s", Some(1), a),
            ReportKey::new("m", "s", Some(1), b)
        );
    }

    #[test]
    fn filter_composes_with_and_semantics() {
        let filter = ReportFilter {
            ship_name: Some("X".into()),
            from: Some(ts(100)),
            to: Some(ts(200)),
            ..Default::default()
        };
        assert!(!filter.is_unfiltered());
        assert!(filter.matches(&report(1, "m", "X", None, 100)));
        assert!(filter.matches(&report(2, "m", "X", None, 200)));
        assert!(!filter.matches(&report(3, "m", "X", None, 201)));
        assert!(!filter.matches(&report(4, "m", "Y", None, 150)));
    }

    #[test]
    fn report_serializes_flat_columns() {
        let mut r = report(7, "m", "s", Some(3), 0);
        r.measurements.set(MeasurementField::Pressure, Some(1.25));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["pressure"], 1.25);
        assert_eq!(v["temperature"], Value::Null);
        assert_eq!(v["timestamp"], "1970-01-01T00:00:00Z");
    }
}
