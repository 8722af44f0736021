//! # Event Normalizer
//!
//! Converts raw adapter samples into canonical [`TelemetryRecord`]s.
//!
//! Each measurement has a fixed schema of known fields and tags. Samples
//! that miss a required field or carry a wrong type are rejected with a
//! [`ValidationError`] and counted; they never enter the pipeline.
//!
//! ## Sequence numbers
//!
//! Every source gets its own strictly increasing counter. Counters are
//! seeded from the current Unix time in microseconds. With a
//! [`SequenceStore`] attached, the seed is also raised above the last
//! persisted reservation, so a restart after the clock stepped back still
//! continues upward. A sequence number is assigned only once a sample
//! passes validation.

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::metrics::Metrics;
use super::record::{FieldValue, TelemetryRecord};
use super::sequence::{SequenceStore, RESERVATION};
use crate::delivery::WriterHandle;
use crate::sources::RawSample;

/// GNSS position fix (gpsd TPV)
pub const MEASUREMENT_GNSS_FIX: &str = "gnss_fix";

/// GNSS satellite view (gpsd SKY)
pub const MEASUREMENT_GNSS_SKY: &str = "gnss_sky";

/// Oscillator discipline statistics (chrony tracking)
pub const MEASUREMENT_CHRONY_TRACKING: &str = "chrony_tracking";

/// Reasons a raw sample is rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown measurement '{0}'")]
    UnknownMeasurement(String),

    #[error("{measurement}: missing required field '{field}'")]
    MissingField { measurement: String, field: String },

    #[error("{measurement}: field '{field}' should be {expected}, got {found}")]
    WrongType {
        measurement: String,
        field: String,
        expected: &'static str,
        found: String,
    },

    #[error("{measurement}: field '{field}' is not a finite number")]
    NonFinite { measurement: String, field: String },
}

impl ValidationError {
    /// Short label used for the rejection metric
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::UnknownMeasurement(_) => "unknown_measurement",
            ValidationError::MissingField { .. } => "missing_field",
            ValidationError::WrongType { .. } => "wrong_type",
            ValidationError::NonFinite { .. } => "non_finite",
        }
    }
}

/// Type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Float,
    Integer,
}

/// Schema entry for a single field
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

/// Schema of one measurement
#[derive(Debug, Clone, Copy)]
pub struct MeasurementSchema {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
    pub tags: &'static [&'static str],
}

const fn req(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: true }
}

const fn opt(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: false }
}

const GNSS_FIX_FIELDS: &[FieldSpec] = &[
    req("lat", FieldKind::Float),
    req("lon", FieldKind::Float),
    opt("alt", FieldKind::Float),
    opt("speed", FieldKind::Float),
    opt("climb", FieldKind::Float),
    opt("track", FieldKind::Float),
    opt("epx", FieldKind::Float),
    opt("epy", FieldKind::Float),
    opt("epv", FieldKind::Float),
    opt("ept", FieldKind::Float),
];

const GNSS_SKY_FIELDS: &[FieldSpec] = &[
    req("satellites_visible", FieldKind::Integer),
    req("satellites_used", FieldKind::Integer),
    opt("hdop", FieldKind::Float),
    opt("vdop", FieldKind::Float),
    opt("pdop", FieldKind::Float),
    opt("gdop", FieldKind::Float),
    opt("tdop", FieldKind::Float),
];

const CHRONY_TRACKING_FIELDS: &[FieldSpec] = &[
    req("system_offset", FieldKind::Float),
    req("frequency_ppm", FieldKind::Float),
    req("skew_ppm", FieldKind::Float),
    opt("last_offset", FieldKind::Float),
    opt("rms_offset", FieldKind::Float),
    opt("residual_freq_ppm", FieldKind::Float),
    opt("root_delay", FieldKind::Float),
    opt("root_dispersion", FieldKind::Float),
    opt("update_interval", FieldKind::Float),
    opt("stratum", FieldKind::Integer),
];

/// All known measurement schemas
pub const SCHEMAS: &[MeasurementSchema] = &[
    MeasurementSchema {
        name: MEASUREMENT_GNSS_FIX,
        fields: GNSS_FIX_FIELDS,
        tags: &["mode"],
    },
    MeasurementSchema {
        name: MEASUREMENT_GNSS_SKY,
        fields: GNSS_SKY_FIELDS,
        tags: &[],
    },
    MeasurementSchema {
        name: MEASUREMENT_CHRONY_TRACKING,
        fields: CHRONY_TRACKING_FIELDS,
        tags: &["ref_id", "leap_status"],
    },
];

/// Find the schema for a measurement name
pub fn schema_for(measurement: &str) -> Option<&'static MeasurementSchema> {
    SCHEMAS.iter().find(|s| s.name == measurement)
}

/// Validates raw samples and stamps them with tags and sequence numbers
#[derive(Debug)]
pub struct Normalizer {
    device_id: String,
    sequences: HashMap<String, u64>,
    sequence_seed: u64,
    store: Option<SequenceStore>,
    metrics: Arc<Metrics>,
}

impl Normalizer {
    /// Creates a normalizer whose counters start at the current time in microseconds
    pub fn new(device_id: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        let seed = Utc::now().timestamp_micros().max(0) as u64;
        Self::with_sequence_seed(device_id, metrics, seed)
    }

    /// Creates a normalizer with an explicit sequence seed
    pub fn with_sequence_seed(
        device_id: impl Into<String>,
        metrics: Arc<Metrics>,
        seed: u64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sequences: HashMap::new(),
            sequence_seed: seed,
            store: None,
            metrics,
        }
    }

    /// Persist sequence reservations so counters never repeat across restarts
    pub fn with_sequence_store(mut self, store: SequenceStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate and convert a raw sample
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the measurement is unknown, a
    /// required field is missing, or a field has the wrong type. The
    /// rejection is counted in `spooler_records_rejected_total`.
    pub fn normalize(&mut self, sample: RawSample) -> Result<TelemetryRecord, ValidationError> {
        match self.build(sample) {
            Ok(record) => {
                self.metrics
                    .records_normalized
                    .with_label_values(&[record.measurement()])
                    .inc();
                Ok(record)
            }
            Err((measurement, err)) => {
                debug!("Rejected sample: {}", err);
                self.metrics
                    .records_rejected
                    .with_label_values(&[measurement.as_str(), err.reason()])
                    .inc();
                Err(err)
            }
        }
    }

    fn build(&mut self, sample: RawSample) -> Result<TelemetryRecord, (String, ValidationError)> {
        let RawSample {
            measurement,
            source,
            values,
            timestamp,
        } = sample;

        let schema = match schema_for(&measurement) {
            Some(schema) => schema,
            None => {
                let err = ValidationError::UnknownMeasurement(measurement.clone());
                return Err((measurement, err));
            }
        };

        let mut fields = BTreeMap::new();
        for spec in schema.fields {
            match values.get(spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        let err = ValidationError::MissingField {
                            measurement: measurement.clone(),
                            field: spec.name.to_string(),
                        };
                        return Err((measurement, err));
                    }
                }
                Some(value) => {
                    let converted = convert_field(&measurement, spec, value)
                        .map_err(|e| (measurement.clone(), e))?;
                    fields.insert(spec.name.to_string(), converted);
                }
            }
        }

        let mut tags = BTreeMap::new();
        tags.insert("device".to_string(), self.device_id.clone());
        tags.insert("source".to_string(), source.clone());
        for &tag in schema.tags {
            if let Some(value) = values.get(tag).and_then(tag_value) {
                tags.insert(tag.to_string(), value);
            }
        }

        let sequence = self.next_sequence(&source);
        let timestamp = timestamp.unwrap_or_else(Utc::now);

        Ok(TelemetryRecord::new(
            measurement,
            source,
            sequence,
            timestamp,
            tags,
            fields,
        ))
    }

    fn next_sequence(&mut self, source: &str) -> u64 {
        let reserved = self.store.as_ref().and_then(|s| s.reserved(source));
        let seed = self.sequence_seed.max(reserved.unwrap_or(0));
        let counter = self.sequences.entry(source.to_string()).or_insert(seed);
        *counter += 1;
        let sequence = *counter;

        if let Some(store) = &mut self.store {
            if reserved.map_or(true, |r| sequence > r) {
                let upto = sequence.saturating_add(RESERVATION);
                if let Err(e) = store.reserve(source, upto) {
                    error!("Failed to persist sequence reservation for {}: {}", source, e);
                }
            }
        }
        sequence
    }

    /// Normalize samples into the writer until every adapter is gone
    pub async fn run(mut self, mut samples: mpsc::Receiver<RawSample>, writer: WriterHandle) {
        info!("Normalizer started for device {}", self.device_id);

        while let Some(sample) = samples.recv().await {
            let Ok(record) = self.normalize(sample) else {
                continue;
            };
            if let Err(e) = writer.submit(record).await {
                warn!("Normalizer stopping: {}", e);
                break;
            }
        }

        info!("Normalizer stopped");
    }
}

fn convert_field(
    measurement: &str,
    spec: &FieldSpec,
    value: &Value,
) -> Result<FieldValue, ValidationError> {
    let wrong_type = |expected: &'static str| ValidationError::WrongType {
        measurement: measurement.to_string(),
        field: spec.name.to_string(),
        expected,
        found: json_type_name(value).to_string(),
    };

    match spec.kind {
        FieldKind::Float => {
            let v = value.as_f64().ok_or_else(|| wrong_type("a number"))?;
            if !v.is_finite() {
                return Err(ValidationError::NonFinite {
                    measurement: measurement.to_string(),
                    field: spec.name.to_string(),
                });
            }
            Ok(FieldValue::Float(v))
        }
        FieldKind::Integer => {
            if let Some(v) = value.as_i64() {
                Ok(FieldValue::Integer(v))
            } else {
                Err(wrong_type("an integer"))
            }
        }
    }
}

fn tag_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
