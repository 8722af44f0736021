//! # Telemetry Module
//!
//! Canonical telemetry records and everything that touches them before
//! delivery.
//!
//! This module handles:
//! - The immutable [`record::TelemetryRecord`] model
//! - Validation of raw adapter samples against per-measurement schemas
//! - Per-source sequence numbering with persisted reservations
//! - Encoding records as InfluxDB line protocol
//! - Prometheus counters for every record outcome

pub mod line_protocol;
pub mod metrics;
pub mod normalizer;
pub mod record;
pub mod sequence;

pub use metrics::Metrics;
pub use record::{FieldValue, TelemetryRecord};
