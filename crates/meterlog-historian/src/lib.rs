//! Historian snapshot adapter: tag value extraction, timestamp parsing and
//! normalization of snapshots into flat report records.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use meterlog_core::{
    BatchSubmission, MeasurementField, Measurements, NormalizedSnapshot, Snapshot, TagValue,
};
use serde_json::Value;
use tracing::debug;

pub const CRATE_NAME: &str = "meterlog-historian";

/// Property names tried, in priority order, when a tag value is an object.
pub const TAG_VALUE_KEYS: [&str; 5] = ["value", "v", "cur", "current", "raw"];

/// Output column <- historian tag name.
pub const TAG_MAPPING: [(MeasurementField, &str); 7] = [
    (MeasurementField::Temperature, "LM_Run1!RUN1_TT_CUR"),
    (MeasurementField::Pressure, "LM_Run1!RUN1_PT_CUR_GAUGE"),
    (MeasurementField::MassFlow, "LM_Run1!RUN1_MASSR_CUR"),
    (MeasurementField::AirIndex, "BB_MiMO!RUN1_AERATION_CUR"),
    (MeasurementField::TotalQuantity, "BB_MiMO!RUN1_MASS_TOTAL"),
    (MeasurementField::StandardDensity, "LM_Run1!RUN1_SD_CUR"),
    (MeasurementField::RawDensity, "LM_Run1!RUN1_DT_CUR"),
];

/// Largest magnitude of a millisecond epoch accepted as an instant.
const MAX_EPOCH_MILLIS: f64 = 8.64e15;

const OFFSET_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Reduce any tag value shape to a finite number, or `None`.
///
/// Total over every JSON input. A `{u, v}` pair with a numeric `v` reads as
/// [`TagValue::Unit`]; any other object is unwrapped through its first
/// non-null property in [`TAG_VALUE_KEYS`]. Leaves go through [`TagValue`].
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Object(map) => match TagValue::from_json(value) {
            Some(tag @ TagValue::Unit { .. }) => tag.to_number(),
            _ => TAG_VALUE_KEYS
                .iter()
                .find_map(|key| map.get(*key).filter(|v| !v.is_null()))
                .and_then(to_number),
        },
        other => TagValue::from_json(other).and_then(|tag| tag.to_number()),
    }
}

/// Parse a snapshot timestamp: a millisecond epoch number or a date string.
///
/// Instants are truncated to millisecond precision.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch_millis),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

pub fn from_epoch_millis(millis: f64) -> Option<DateTime<Utc>> {
    if !millis.is_finite() || millis.abs() > MAX_EPOCH_MILLIS {
        return None;
    }
    Utc.timestamp_millis_opt(millis.trunc() as i64).single()
}

pub fn parse_timestamp_str(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return truncate_to_millis(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return truncate_to_millis(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return truncate_to_millis(dt.with_timezone(&Utc));
        }
    }
    // Offset-less readings are taken as UTC.
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return truncate_to_millis(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| truncate_to_millis(naive.and_utc()))
}

fn truncate_to_millis(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(dt.timestamp_millis()).single()
}

/// Batch-level identity shared by every snapshot of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    pub meter: String,
    pub ship: String,
    pub batch_number: Option<i64>,
}

impl BatchContext {
    pub fn new(meter: impl Into<String>, ship: impl AsRef<str>, batch_number: Option<i64>) -> Self {
        Self {
            meter: meter.into(),
            ship: ship.as_ref().trim().to_string(),
            batch_number,
        }
    }

    pub fn from_submission(submission: &BatchSubmission) -> Self {
        Self::new(
            submission.meter_id.clone(),
            &submission.ship_name,
            submission.batch_number,
        )
    }
}

pub fn extract_measurements(snapshot: &Snapshot) -> Measurements {
    let mut measurements = Measurements::default();
    for (field, tag) in TAG_MAPPING {
        measurements.set(field, snapshot.tag(tag).and_then(to_number));
    }
    measurements
}

pub fn normalize_snapshot(ctx: &BatchContext, snapshot: &Snapshot) -> NormalizedSnapshot {
    NormalizedSnapshot {
        meter: ctx.meter.clone(),
        ship: ctx.ship.clone(),
        batch_number: ctx.batch_number,
        timestamp: parse_timestamp(&snapshot.ts),
        measurements: extract_measurements(snapshot),
    }
}

/// Normalize every snapshot of a submission, preserving submission order.
pub fn normalize_submission(submission: &BatchSubmission) -> Vec<NormalizedSnapshot> {
    let ctx = BatchContext::from_submission(submission);
    let untagged = submission
        .snapshots
        .iter()
        .filter(|s| s.tags.is_none())
        .count();
    if untagged > 0 {
        debug!(untagged, "snapshots without a tag map; measurements will be null");
    }
    submission
        .snapshots
        .iter()
        .map(|snapshot| normalize_snapshot(&ctx, snapshot))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: Value) -> Snapshot {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn to_number_is_total() {
        let cases = [
            (json!(null), None),
            (json!("not a number"), None),
            (json!("NaN"), None),
            (json!(12.5), Some(12.5)),
            (json!(-3), Some(-3.0)),
            (json!(" 7.25 "), Some(7.25)),
            (json!({"value": "8"}), Some(8.0)),
            (json!({"u": "kg/h", "v": 1200.5}), Some(1200.5)),
            (json!({"cur": {"raw": 4}}), Some(4.0)),
            (json!({"unit": "bar"}), None),
            (json!(true), None),
            (json!([1, 2, 3]), None),
        ];
        for (input, expected) in cases {
            let got = to_number(&input);
            assert_eq!(got, expected, "input {input}");
            if let Some(n) = got {
                assert!(n.is_finite());
            }
        }
    }

    #[test]
    fn to_number_skips_null_properties_in_priority_order() {
        assert_eq!(to_number(&json!({"value": null, "v": 2, "raw": 9})), Some(2.0));
        assert_eq!(to_number(&json!({"current": "x", "raw": 9})), None);
    }

    #[test]
    fn parses_supported_timestamp_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2024-01-01T00:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-01-01T02:00:00+02:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-01-01 00:00:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-01-01")), Some(expected));
        assert_eq!(parse_timestamp(&json!(1_704_067_200_000i64)), Some(expected));
        assert_eq!(
            parse_timestamp(&json!("Mon, 01 Jan 2024 00:00:00 +0000")),
            Some(expected)
        );
    }

    #[test]
    fn rejects_unparseable_timestamps() {
        assert_eq!(parse_timestamp(&json!("not-a-date")), None);
        assert_eq!(parse_timestamp(&json!("")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
        assert_eq!(parse_timestamp(&json!(1e300)), None);
    }

    #[test]
    fn timestamps_are_truncated_to_millis() {
        let parsed = parse_timestamp(&json!("2024-01-01T00:00:00.123456Z")).unwrap();
        assert_eq!(parsed.timestamp_subsec_micros(), 123_000);
    }

    #[test]
    fn normalizes_snapshot_with_fixed_tag_mapping() {
        let ctx = BatchContext::new("M-01", "  Nordic Star  ", Some(12));
        let snap = snapshot(json!({
            "ts": "2024-03-05T10:00:00Z",
            "PN": "P", "SN": "S", "rnd": "r",
            "tags": {
                "LM_Run1!RUN1_TT_CUR": {"u": "degC", "v": 15.2},
                "LM_Run1!RUN1_PT_CUR_GAUGE": {"u": "bar", "v": 3.4},
                "LM_Run1!RUN1_MASSR_CUR": {"u": "t/h", "v": "120.5"},
                "BB_MiMO!RUN1_AERATION_CUR": {"u": "%", "v": 0.1},
                "BB_MiMO!RUN1_MASS_TOTAL": {"u": "t", "v": 5000},
                "LM_Run1!RUN1_SD_CUR": {"u": "kg/m3", "v": 991.0},
                "LM_Run1!RUN1_DT_CUR": {"u": "kg/m3", "v": 989.5},
                "SYS!SYS_TAG": {"v": "ignored"}
            }
        }));

        let normalized = normalize_snapshot(&ctx, &snap);
        assert_eq!(normalized.meter, "M-01");
        assert_eq!(normalized.ship, "Nordic Star");
        assert_eq!(normalized.batch_number, Some(12));
        assert!(normalized.timestamp.is_some());
        let m = normalized.measurements;
        assert_eq!(m.temperature, Some(15.2));
        assert_eq!(m.pressure, Some(3.4));
        assert_eq!(m.mass_flow, Some(120.5));
        assert_eq!(m.air_index, Some(0.1));
        assert_eq!(m.total_quantity, Some(5000.0));
        assert_eq!(m.standard_density, Some(991.0));
        assert_eq!(m.raw_density, Some(989.5));
    }

    #[test]
    fn missing_tag_map_yields_null_measurements() {
        let ctx = BatchContext::new("M-01", "ship", None);
        let normalized = normalize_snapshot(&ctx, &snapshot(json!({"ts": "not-a-date"})));
        assert_eq!(normalized.timestamp, None);
        assert_eq!(normalized.measurements, Measurements::default());
    }

    #[test]
    fn normalize_submission_preserves_order() {
        let submission: BatchSubmission = serde_json::from_value(json!({
            "meter_id": "M",
            "ship_name": "S",
            "snapshots": [
                {"ts": "2024-01-01T00:00:00Z", "tags": {"LM_Run1!RUN1_TT_CUR": 10}},
                {"ts": "2024-01-01T00:01:00Z", "tags": {"LM_Run1!RUN1_TT_CUR": 11}}
            ]
        }))
        .unwrap();
        let out = normalize_submission(&submission);
        let temps: Vec<_> = out.iter().map(|n| n.measurements.temperature).collect();
        assert_eq!(temps, vec![Some(10.0), Some(11.0)]);
    }

    #[test]
    fn every_field_has_a_historian_tag() {
        for field in MeasurementField::ALL {
            assert!(
                TAG_MAPPING.iter().any(|(f, tag)| *f == field && !tag.is_empty()),
                "{field}"
            );
        }
    }

    #[test]
    fn unit_pairs_read_through_the_unit_variant() {
        assert_eq!(to_number(&json!({"u": "bar", "v": 2.5})), Some(2.5));
        assert_eq!(to_number(&json!({"u": "bar", "v": 2.5, "value": 9})), Some(2.5));
        // Text `v` is not a unit pair, so the property walk applies.
        assert_eq!(to_number(&json!({"u": "t/h", "v": "120.5"})), Some(120.5));
    }
}
