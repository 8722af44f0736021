//! # Watchdog
//!
//! Decides which recovery actions to take for a health snapshot.
//!
//! Escalation only happens while the composite level is unhealthy:
//! 1. every unhealthy restartable subsystem is restarted, at most once per
//!    restart interval;
//! 2. once the composite has been unhealthy for `reboot_after`, the node
//!    is rebooted, at most once per cooldown.
//!
//! The time of the last reboot is persisted so the cooldown also covers
//! the reboot the watchdog itself caused.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::{HealthLevel, HealthSnapshot, Subsystem};
use crate::config::HealthConfig;
use crate::error::Result;

/// Action the monitor must carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Restart(Subsystem),
    Reboot,
}

impl RecoveryAction {
    /// Label for `spooler_watchdog_actions_total`
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryAction::Restart(Subsystem::Gnss) => "restart_gnss",
            RecoveryAction::Restart(Subsystem::Oscillator) => "restart_oscillator",
            RecoveryAction::Restart(Subsystem::Sink) => "restart_sink",
            RecoveryAction::Restart(Subsystem::Spool) => "restart_spool",
            RecoveryAction::Reboot => "reboot",
        }
    }
}

/// Escalation thresholds
#[derive(Debug, Clone)]
pub struct WatchdogPolicy {
    pub restart_interval: Duration,
    pub reboot_after: Duration,
    pub reboot_cooldown: Duration,
}

impl WatchdogPolicy {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            restart_interval: Duration::seconds(config.restart_interval_s as i64),
            reboot_after: Duration::seconds(config.reboot_after_s as i64),
            reboot_cooldown: Duration::seconds(config.reboot_cooldown_s as i64),
        }
    }
}

/// Persisted watchdog state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchdogState {
    pub last_reboot: Option<DateTime<Utc>>,
}

impl WatchdogState {
    /// Load state, treating a missing or unreadable file as empty
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!("Ignoring unreadable watchdog state {:?}: {}", path, e);
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Failed to read watchdog state {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Escalation state machine
#[derive(Debug)]
pub struct Watchdog {
    policy: WatchdogPolicy,
    state: WatchdogState,
    state_file: Option<PathBuf>,
    unhealthy_since: Option<DateTime<Utc>>,
    last_restart: HashMap<Subsystem, DateTime<Utc>>,
}

impl Watchdog {
    pub fn new(policy: WatchdogPolicy, state: WatchdogState, state_file: Option<PathBuf>) -> Self {
        if let Some(last) = state.last_reboot {
            info!("Last watchdog reboot at {}", last);
        }
        Self {
            policy,
            state,
            state_file,
            unhealthy_since: None,
            last_restart: HashMap::new(),
        }
    }

    /// Build from configuration, loading the persisted state file
    pub fn from_config(config: &HealthConfig) -> Self {
        let state = WatchdogState::load(&config.state_file);
        Self::new(
            WatchdogPolicy::from_config(config),
            state,
            Some(config.state_file.clone()),
        )
    }

    pub fn last_reboot(&self) -> Option<DateTime<Utc>> {
        self.state.last_reboot
    }

    /// Decide recovery actions for the current snapshot
    pub fn step(&mut self, snapshot: &HealthSnapshot, now: DateTime<Utc>) -> Vec<RecoveryAction> {
        if snapshot.composite != HealthLevel::Unhealthy {
            if self.unhealthy_since.take().is_some() {
                info!("Composite health is {}, watchdog stands down", snapshot.composite);
            }
            return Vec::new();
        }

        let unhealthy_since = *self.unhealthy_since.get_or_insert(now);
        let mut actions = Vec::new();

        for subsystem in snapshot.at_level(HealthLevel::Unhealthy) {
            if !subsystem.is_restartable() {
                continue;
            }
            let due = self
                .last_restart
                .get(&subsystem)
                .map_or(true, |last| now - *last >= self.policy.restart_interval);
            if !due {
                continue;
            }

            let status = &snapshot.subsystems[&subsystem];
            warn!(
                "Watchdog restarting {}: unhealthy since {}, {} consecutive failures, last good {:?}, detail: {}",
                subsystem, status.since, status.consecutive_failures, status.last_good, status.detail
            );
            self.last_restart.insert(subsystem, now);
            actions.push(RecoveryAction::Restart(subsystem));
        }

        let unhealthy_for = now - unhealthy_since;
        if unhealthy_for >= self.policy.reboot_after {
            let cooled_down = self
                .state
                .last_reboot
                .map_or(true, |last| now - last >= self.policy.reboot_cooldown);

            if cooled_down {
                error!(
                    "Watchdog rebooting node: unhealthy for {} s (levels: {}, spool fill {:.1}%)",
                    unhealthy_for.num_seconds(),
                    describe_levels(snapshot),
                    snapshot.spool_fill_ratio * 100.0
                );
                self.state.last_reboot = Some(now);
                if let Some(path) = &self.state_file {
                    if let Err(e) = self.state.save(path) {
                        error!("Failed to persist watchdog state to {:?}: {}", path, e);
                    }
                }
                actions.push(RecoveryAction::Reboot);
            }
        }

        actions
    }
}

fn describe_levels(snapshot: &HealthSnapshot) -> String {
    snapshot
        .subsystems
        .iter()
        .map(|(subsystem, status)| format!("{}={}", subsystem, status.level))
        .collect::<Vec<_>>()
        .join(", ")
}
