//! # Source Adapters
//!
//! Tasks that observe external timing daemons and emit [`RawSample`]s.
//!
//! - [`gpsd`]: GNSS receiver state from gpsd's JSON watch stream
//! - [`chrony`]: oscillator discipline state from `chronyc tracking`
//!
//! Adapters never wait on the pipeline. When the normalizer queue is full,
//! the sample is dropped and counted.

pub mod chrony;
pub mod gpsd;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::telemetry::metrics::Metrics;

pub use chrony::ChronyPoller;
pub use gpsd::GpsdAdapter;

/// Source label for gpsd samples
pub const SOURCE_GPSD: &str = "gpsd";

/// Source label for chrony samples
pub const SOURCE_CHRONY: &str = "chrony";

/// Untyped sample as read from a source
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub measurement: String,
    pub source: String,
    pub values: Map<String, Value>,
    /// Time reported by the source, if any
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawSample {
    pub fn new(
        measurement: impl Into<String>,
        source: impl Into<String>,
        values: Map<String, Value>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            source: source.into(),
            values,
            timestamp,
        }
    }
}

/// Non-blocking producer side of the sample queue
#[derive(Debug, Clone)]
pub struct SampleSender {
    tx: mpsc::Sender<RawSample>,
    metrics: Arc<Metrics>,
}

impl SampleSender {
    pub fn channel(depth: usize, metrics: Arc<Metrics>) -> (Self, mpsc::Receiver<RawSample>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx, metrics }, rx)
    }

    /// Queue a sample; returns false if it was dropped
    pub fn send(&self, sample: RawSample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(TrySendError::Full(sample)) => {
                self.metrics
                    .samples_dropped
                    .with_label_values(&[sample.source.as_str()])
                    .inc();
                trace!("Sample queue full, dropped {}", sample.measurement);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
