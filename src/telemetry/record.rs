//! # Telemetry Record
//!
//! Canonical, immutable unit of telemetry flowing through the spooler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single field value of a telemetry record
///
/// Serialized untagged so spool payloads stay plain JSON. Variant order
/// matters: integral JSON numbers decode as `Integer`, everything else
/// numeric as `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

/// Canonical telemetry record
///
/// Created by the normalizer and never mutated afterwards; the spool stores
/// it verbatim and the sink encodes it to line protocol.
///
/// # Examples
///
/// ```
/// use gnss_spooler::telemetry::record::{FieldValue, TelemetryRecord};
/// use std::collections::BTreeMap;
///
/// let mut fields = BTreeMap::new();
/// fields.insert("lat".to_string(), FieldValue::Float(52.1));
/// fields.insert("lon".to_string(), FieldValue::Float(4.3));
///
/// let record = TelemetryRecord::new("gnss_fix", "gpsd", 1, chrono::Utc::now(), BTreeMap::new(), fields);
/// assert_eq!(record.measurement(), "gnss_fix");
/// assert_eq!(record.sequence(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    measurement: String,
    source: String,
    sequence: u64,
    timestamp: DateTime<Utc>,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
}

impl TelemetryRecord {
    /// Creates a new record
    pub fn new(
        measurement: impl Into<String>,
        source: impl Into<String>,
        sequence: u64,
        timestamp: DateTime<Utc>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            source: source.into(),
            sequence,
            timestamp,
            tags,
            fields,
        }
    }

    /// Measurement name (e.g. `gnss_fix`)
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Source adapter that produced the sample (e.g. `gpsd`)
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Per-source sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wall-clock time of the observation
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Looks up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}
