//! # Health Module
//!
//! Per-subsystem health tracking and the watchdog that escalates recovery.
//!
//! This module handles:
//! - Collecting observations from every component without blocking them
//! - Per-subsystem state machines (healthy, degraded, unhealthy)
//! - Publishing a read-only [`HealthSnapshot`] for the status endpoint
//! - Restarting unhealthy subsystems and, as a last resort, rebooting

pub mod actions;
pub mod monitor;
pub mod tracker;
pub mod watchdog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::telemetry::metrics::Metrics;

pub use actions::{RecoveryActions, SystemActions};
pub use monitor::HealthMonitor;
pub use tracker::HealthTracker;
pub use watchdog::{RecoveryAction, Watchdog};

/// Monitored subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// GNSS receiver, observed through gpsd
    Gnss,
    /// Oscillator discipline, observed through chrony
    Oscillator,
    /// Remote time-series database
    Sink,
    /// Local disk spool
    Spool,
}

impl Subsystem {
    pub const ALL: [Subsystem; 4] = [
        Subsystem::Gnss,
        Subsystem::Oscillator,
        Subsystem::Sink,
        Subsystem::Spool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Gnss => "gnss",
            Subsystem::Oscillator => "oscillator",
            Subsystem::Sink => "sink",
            Subsystem::Spool => "spool",
        }
    }

    /// Whether the watchdog can restart this subsystem
    pub fn is_restartable(&self) -> bool {
        !matches!(self, Subsystem::Spool)
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health level, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
        }
    }

    /// Numeric form for the health gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            HealthLevel::Healthy => 0,
            HealthLevel::Degraded => 1,
            HealthLevel::Unhealthy => 2,
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single good or bad report about a subsystem
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub subsystem: Subsystem,
    pub ok: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl Observation {
    pub fn good(subsystem: Subsystem, detail: impl Into<String>) -> Self {
        Self {
            subsystem,
            ok: true,
            detail: detail.into(),
            at: Utc::now(),
        }
    }

    pub fn bad(subsystem: Subsystem, detail: impl Into<String>) -> Self {
        Self {
            subsystem,
            ok: false,
            detail: detail.into(),
            at: Utc::now(),
        }
    }

    /// Same observation with an explicit timestamp
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// Non-blocking handle for reporting observations
///
/// Reports are dropped when the monitor falls behind; health is sampled
/// continuously, so a lost report is superseded by the next one.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    tx: mpsc::Sender<Observation>,
}

impl HealthReporter {
    pub fn new(tx: mpsc::Sender<Observation>) -> Self {
        Self { tx }
    }

    /// Create a reporter and the receiving end for the monitor
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Observation>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self::new(tx), rx)
    }

    pub fn report(&self, observation: Observation) {
        if let Err(e) = self.tx.try_send(observation) {
            trace!("Health observation dropped: {}", e);
        }
    }

    pub fn good(&self, subsystem: Subsystem, detail: impl Into<String>) {
        self.report(Observation::good(subsystem, detail));
    }

    pub fn bad(&self, subsystem: Subsystem, detail: impl Into<String>) {
        self.report(Observation::bad(subsystem, detail));
    }
}

/// Published state of one subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemStatus {
    pub level: HealthLevel,
    /// Time of the last level change
    pub since: DateTime<Utc>,
    pub last_good: Option<DateTime<Utc>>,
    pub last_observation: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub detail: String,
}

/// Read-only health view published by the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub composite: HealthLevel,
    pub subsystems: BTreeMap<Subsystem, SubsystemStatus>,
    pub spool_fill_ratio: f64,
    pub spool_pending_entries: u64,
    pub generated_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Snapshot before the monitor has run
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            composite: HealthLevel::Healthy,
            subsystems: BTreeMap::new(),
            spool_fill_ratio: 0.0,
            spool_pending_entries: 0,
            generated_at: now,
        }
    }

    pub fn level(&self, subsystem: Subsystem) -> HealthLevel {
        self.subsystems
            .get(&subsystem)
            .map_or(HealthLevel::Healthy, |s| s.level)
    }

    /// Subsystems currently at the given level
    pub fn at_level(&self, level: HealthLevel) -> Vec<Subsystem> {
        self.subsystems
            .iter()
            .filter(|(_, s)| s.level == level)
            .map(|(subsystem, _)| *subsystem)
            .collect()
    }

    /// Push the levels into the health gauge
    pub fn export(&self, metrics: &Arc<Metrics>) {
        for subsystem in Subsystem::ALL {
            metrics
                .health_level
                .with_label_values(&[subsystem.as_str()])
                .set(self.level(subsystem).as_gauge());
        }
    }
}
