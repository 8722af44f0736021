//! # Line Protocol Encoder
//!
//! Encodes telemetry records into the InfluxDB line protocol:
//!
//! ```text
//! measurement,tag1=v1,tag2=v2 field1=1.5,field2=7i,seq=42i 1700000000000000000
//! ```
//!
//! Tags and fields are emitted in key order (records store them in
//! `BTreeMap`s), so the same record always encodes to the same line. That
//! makes redelivery after a crash idempotent on the database side: the
//! point is simply overwritten.

use super::record::{FieldValue, TelemetryRecord};

/// Name of the integer field carrying the per-source sequence number
pub const SEQUENCE_FIELD: &str = "seq";

/// Encode a single record as one line (no trailing newline)
///
/// # Examples
///
/// ```
/// use gnss_spooler::telemetry::line_protocol::encode_record;
/// use gnss_spooler::telemetry::record::{FieldValue, TelemetryRecord};
/// use chrono::{TimeZone, Utc};
/// use std::collections::BTreeMap;
///
/// let mut fields = BTreeMap::new();
/// fields.insert("lat".to_string(), FieldValue::Float(52.5));
/// let ts = Utc.timestamp_opt(1, 0).unwrap();
/// let record = TelemetryRecord::new("gnss_fix", "gpsd", 7, ts, BTreeMap::new(), fields);
///
/// assert_eq!(encode_record(&record), "gnss_fix lat=52.5,seq=7i 1000000000");
/// ```
pub fn encode_record(record: &TelemetryRecord) -> String {
    let mut line = String::with_capacity(128);

    line.push_str(&escape_measurement(record.measurement()));

    for (key, value) in record.tags() {
        if value.is_empty() {
            // Line protocol has no representation for empty tag values
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');

    let mut first = true;
    for (key, value) in record.fields() {
        if key == SEQUENCE_FIELD {
            continue;
        }
        if !first {
            line.push(',');
        }
        first = false;
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&encode_field_value(value));
    }

    if !first {
        line.push(',');
    }
    line.push_str(SEQUENCE_FIELD);
    line.push('=');
    line.push_str(&format!("{}i", record.sequence()));

    if let Some(nanos) = record.timestamp().timestamp_nanos_opt() {
        line.push(' ');
        line.push_str(&nanos.to_string());
    }

    line
}

/// Encode a batch of records, one line each, newline separated
pub fn encode_batch(records: &[TelemetryRecord]) -> String {
    records
        .iter()
        .map(encode_record)
        .collect::<Vec<_>>()
        .join("\n")
}

fn encode_field_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Integer(v) => format!("{}i", v),
        FieldValue::Float(v) => format!("{}", v),
        FieldValue::Boolean(v) => format!("{}", v),
        FieldValue::Text(v) => {
            let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{}\"", escaped)
        }
    }
}

/// Escape a measurement name (commas and spaces)
fn escape_measurement(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == ',' || c == ' ' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape a tag key, tag value or field key (commas, equals signs, spaces)
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if c == ',' || c == '=' || c == ' ' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
