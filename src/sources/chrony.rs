//! # chrony Poller
//!
//! Polls `chronyc -c tracking` and reports the oscillator discipline
//! state. The leap status doubles as the oscillator health signal:
//! `Normal` means chrony is synchronised.

use anyhow::{anyhow, bail, Context};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{RawSample, SampleSender, SOURCE_CHRONY};
use crate::config::ChronyConfig;
use crate::health::{HealthReporter, Subsystem};
use crate::shutdown::stopped;
use crate::telemetry::normalizer::MEASUREMENT_CHRONY_TRACKING;

/// Leap status reported while synchronised
pub const LEAP_NORMAL: &str = "Normal";

/// Columns of `chronyc -c tracking`
const TRACKING_COLUMNS: usize = 14;

/// Decoded tracking report
#[derive(Debug, Clone, PartialEq)]
pub struct Tracking {
    pub ref_id: String,
    pub ref_name: String,
    pub stratum: u64,
    /// Offset of the system clock from true time, in seconds
    pub system_offset: f64,
    pub last_offset: f64,
    pub rms_offset: f64,
    pub frequency_ppm: f64,
    pub residual_freq_ppm: f64,
    pub skew_ppm: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub update_interval: f64,
    pub leap_status: String,
}

impl Tracking {
    pub fn is_synchronised(&self) -> bool {
        self.leap_status == LEAP_NORMAL
    }

    pub fn to_sample(&self) -> RawSample {
        let mut values = Map::new();
        let floats = [
            ("system_offset", self.system_offset),
            ("last_offset", self.last_offset),
            ("rms_offset", self.rms_offset),
            ("frequency_ppm", self.frequency_ppm),
            ("residual_freq_ppm", self.residual_freq_ppm),
            ("skew_ppm", self.skew_ppm),
            ("root_delay", self.root_delay),
            ("root_dispersion", self.root_dispersion),
            ("update_interval", self.update_interval),
        ];
        for (name, value) in floats {
            values.insert(name.to_string(), Value::from(value));
        }
        values.insert("stratum".to_string(), Value::from(self.stratum));
        values.insert("ref_id".to_string(), Value::from(self.ref_id.clone()));
        values.insert(
            "leap_status".to_string(),
            Value::from(self.leap_status.clone()),
        );

        RawSample::new(MEASUREMENT_CHRONY_TRACKING, SOURCE_CHRONY, values, None)
    }
}

/// Parse the CSV output of `chronyc -c tracking`
pub fn parse_tracking(output: &str) -> anyhow::Result<Tracking> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("empty tracking output"))?;

    let columns: Vec<&str> = line.split(',').collect();
    if columns.len() < TRACKING_COLUMNS {
        bail!(
            "expected {} tracking columns, got {}",
            TRACKING_COLUMNS,
            columns.len()
        );
    }

    let float = |i: usize, name: &str| -> anyhow::Result<f64> {
        columns[i]
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid {} {:?}", name, columns[i]))
    };

    Ok(Tracking {
        ref_id: columns[0].trim().to_string(),
        ref_name: columns[1].trim().to_string(),
        stratum: columns[2]
            .trim()
            .parse()
            .with_context(|| format!("invalid stratum {:?}", columns[2]))?,
        system_offset: float(4, "system time")?,
        last_offset: float(5, "last offset")?,
        rms_offset: float(6, "RMS offset")?,
        frequency_ppm: float(7, "frequency")?,
        residual_freq_ppm: float(8, "residual frequency")?,
        skew_ppm: float(9, "skew")?,
        root_delay: float(10, "root delay")?,
        root_dispersion: float(11, "root dispersion")?,
        update_interval: float(12, "update interval")?,
        leap_status: columns[13].trim().to_string(),
    })
}

/// chrony tracking poller task
pub struct ChronyPoller {
    command: String,
    poll_interval: Duration,
    timeout: Duration,
    samples: SampleSender,
    health: HealthReporter,
}

impl ChronyPoller {
    pub fn new(config: &ChronyConfig, samples: SampleSender, health: HealthReporter) -> Self {
        Self {
            command: config.command.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            timeout: Duration::from_millis(config.timeout_ms),
            samples,
            health,
        }
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "chrony poller started ({} every {:?})",
            self.command, self.poll_interval
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.poll_once().await,
                _ = stopped(&mut shutdown) => break,
            }
        }

        info!("chrony poller stopped");
    }

    /// Query chrony once and report the result
    pub async fn poll_once(&self) {
        match self.query().await {
            Ok(tracking) => {
                if tracking.is_synchronised() {
                    self.health.good(
                        Subsystem::Oscillator,
                        format!(
                            "synchronised to {} (offset {:.9} s)",
                            tracking.ref_name, tracking.system_offset
                        ),
                    );
                } else {
                    debug!("chrony leap status: {}", tracking.leap_status);
                    self.health.bad(
                        Subsystem::Oscillator,
                        format!("leap status: {}", tracking.leap_status),
                    );
                }
                self.samples.send(tracking.to_sample());
            }
            Err(e) => {
                warn!("chrony query failed: {:#}", e);
                self.health
                    .bad(Subsystem::Oscillator, format!("chronyc failed: {}", e));
            }
        }
    }

    async fn query(&self) -> anyhow::Result<Tracking> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.command)
                .args(["-c", "tracking"])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("{} timed out after {:?}", self.command, self.timeout))?
        .with_context(|| format!("failed to run {}", self.command))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_tracking(&String::from_utf8_lossy(&output.stdout))
    }
}
