//! # Spooler Metrics
//!
//! Prometheus counters and gauges for every record outcome. The registry is
//! owned here and rendered by the status endpoint at `/metrics`.
//!
//! Every record accepted by the writer ends in exactly one of
//! `spooler_records_delivered_total` or `spooler_records_dropped_total`
//! (possibly after passing through `spooler_records_spooled_total`).

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Encoder,
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};

use crate::error::Result;

/// Delivery path label: direct delivery by the writer
pub const PATH_LIVE: &str = "live";

/// Delivery path label: redelivery by the drainer
pub const PATH_DRAIN: &str = "drain";

/// Metrics shared by all spooler components
#[derive(Clone)]
pub struct Metrics {
    pub records_normalized: IntCounterVec,
    pub records_rejected: IntCounterVec,
    pub records_delivered: IntCounterVec,
    pub records_spooled: IntCounter,
    pub records_dropped: IntCounterVec,
    pub samples_dropped: IntCounterVec,
    pub delivery_failures: IntCounterVec,
    pub spool_evicted_segments: IntCounter,
    pub spool_corrupt_entries: IntCounter,
    pub spool_resident_bytes: IntGauge,
    pub watchdog_actions: IntCounterVec,
    pub health_level: IntGaugeVec,

    registry: Registry,
}

impl Metrics {
    /// Create and register all metrics in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let records_normalized = register_int_counter_vec_with_registry!(
            "spooler_records_normalized_total",
            "Samples accepted by the normalizer",
            &["measurement"],
            registry
        )?;

        let records_rejected = register_int_counter_vec_with_registry!(
            "spooler_records_rejected_total",
            "Samples rejected by schema validation",
            &["measurement", "reason"],
            registry
        )?;

        let records_delivered = register_int_counter_vec_with_registry!(
            "spooler_records_delivered_total",
            "Records acknowledged by the remote sink",
            &["path"],
            registry
        )?;

        let records_spooled = register_int_counter_with_registry!(
            "spooler_records_spooled_total",
            "Records written to the disk spool",
            registry
        )?;

        let records_dropped = register_int_counter_vec_with_registry!(
            "spooler_records_dropped_total",
            "Records lost before delivery, by reason",
            &["reason"],
            registry
        )?;

        let samples_dropped = register_int_counter_vec_with_registry!(
            "spooler_samples_dropped_total",
            "Raw samples discarded because the normalizer queue was full",
            &["source"],
            registry
        )?;

        let delivery_failures = register_int_counter_vec_with_registry!(
            "spooler_delivery_failures_total",
            "Failed delivery attempts by path and failure kind",
            &["path", "kind"],
            registry
        )?;

        let spool_evicted_segments = register_int_counter_with_registry!(
            "spooler_spool_evicted_segments_total",
            "Closed segments deleted to stay under the spool capacity",
            registry
        )?;

        let spool_corrupt_entries = register_int_counter_with_registry!(
            "spooler_spool_corrupt_entries_total",
            "Spool entries discarded because of checksum or framing errors",
            registry
        )?;

        let spool_resident_bytes = register_int_gauge_with_registry!(
            "spooler_spool_resident_bytes",
            "Bytes currently resident in spool segment files",
            registry
        )?;

        let watchdog_actions = register_int_counter_vec_with_registry!(
            "spooler_watchdog_actions_total",
            "Recovery actions triggered by the watchdog",
            &["action"],
            registry
        )?;

        let health_level = register_int_gauge_vec_with_registry!(
            "spooler_health_level",
            "Subsystem health (0=healthy, 1=degraded, 2=unhealthy)",
            &["subsystem"],
            registry
        )?;

        Ok(Self {
            records_normalized,
            records_rejected,
            records_delivered,
            records_spooled,
            records_dropped,
            samples_dropped,
            delivery_failures,
            spool_evicted_segments,
            spool_corrupt_entries,
            spool_resident_bytes,
            watchdog_actions,
            health_level,
            registry,
        })
    }

    /// Count `n` records delivered on `path`
    pub fn delivered(&self, path: &str, n: usize) {
        self.records_delivered
            .with_label_values(&[path])
            .inc_by(n as u64);
    }

    /// Count `n` records lost for `reason`
    pub fn dropped(&self, reason: &str, n: u64) {
        self.records_dropped.with_label_values(&[reason]).inc_by(n);
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
