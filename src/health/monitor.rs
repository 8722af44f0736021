//! # Health Monitor
//!
//! The only writer of health state. Consumes observations, samples the
//! spool and source liveness on a fixed interval, publishes a
//! [`HealthSnapshot`] on a `watch` channel and executes the watchdog's
//! recovery actions.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{
    HealthSnapshot, HealthTracker, Observation, RecoveryAction, RecoveryActions, Subsystem,
    Watchdog,
};
use crate::config::HealthConfig;
use crate::spool::SpoolQueue;
use crate::telemetry::metrics::Metrics;

pub struct HealthMonitor {
    check_interval: Duration,
    stale_after: chrono::Duration,
    spool_unhealthy_ratio: f64,
    tracker: HealthTracker,
    watchdog: Watchdog,
    observations: mpsc::Receiver<Observation>,
    snapshot: watch::Sender<HealthSnapshot>,
    spool: Arc<SpoolQueue>,
    actions: Arc<dyn RecoveryActions>,
    metrics: Arc<Metrics>,
    /// Last externally reported observation of each liveness-checked subsystem
    last_seen: HashMap<Subsystem, DateTime<Utc>>,
}

impl HealthMonitor {
    /// Create the monitor and the receiving end of its snapshot channel
    pub fn new(
        config: &HealthConfig,
        watchdog: Watchdog,
        observations: mpsc::Receiver<Observation>,
        spool: Arc<SpoolQueue>,
        actions: Arc<dyn RecoveryActions>,
        metrics: Arc<Metrics>,
    ) -> (Self, watch::Receiver<HealthSnapshot>) {
        let now = Utc::now();
        let (snapshot, rx) = watch::channel(HealthSnapshot::initial(now));
        let monitor = Self {
            check_interval: Duration::from_secs(config.check_interval_s.max(1)),
            stale_after: chrono::Duration::seconds(config.stale_after_s as i64),
            spool_unhealthy_ratio: config.spool_unhealthy_ratio,
            tracker: HealthTracker::from_config(config, now),
            watchdog,
            observations,
            snapshot,
            spool,
            actions,
            metrics,
            last_seen: HashMap::new(),
        };
        (monitor, rx)
    }

    /// Report `subsystem` as bad when nothing is heard from it for `stale_after`
    pub fn watch_liveness(mut self, subsystem: Subsystem, since: DateTime<Utc>) -> Self {
        self.last_seen.insert(subsystem, since);
        self
    }

    /// Run until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Health monitor started (check interval {:?}, liveness: {:?})",
            self.check_interval,
            self.last_seen.keys().collect::<Vec<_>>()
        );

        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open = true;

        loop {
            tokio::select! {
                observation = self.observations.recv(), if open => match observation {
                    Some(observation) => self.handle(&observation),
                    None => open = false,
                },
                _ = interval.tick() => self.check(Utc::now()).await,
                _ = shutdown.changed() => break,
            }
        }

        info!("Health monitor stopped");
    }

    fn handle(&mut self, observation: &Observation) {
        if let Some(last) = self.last_seen.get_mut(&observation.subsystem) {
            if observation.at > *last {
                *last = observation.at;
            }
        }
        self.tracker.observe(observation);
    }

    /// One periodic evaluation
    async fn check(&mut self, now: DateTime<Utc>) {
        let fill = self.spool.fill_ratio();
        let spool_observation = if fill >= self.spool_unhealthy_ratio {
            Observation::bad(Subsystem::Spool, format!("spool {:.1}% full", fill * 100.0))
        } else {
            Observation::good(Subsystem::Spool, format!("spool {:.1}% full", fill * 100.0))
        };
        self.tracker.observe(&spool_observation.at(now));

        let stale: Vec<_> = self
            .last_seen
            .iter()
            .map(|(subsystem, last)| (*subsystem, now - *last))
            .filter(|(_, silence)| *silence >= self.stale_after)
            .collect();
        for (subsystem, silence) in stale {
            let detail = format!("no samples for {} s", silence.num_seconds());
            self.tracker
                .observe(&Observation::bad(subsystem, detail).at(now));
        }

        self.tracker.evaluate(now);

        let snapshot = self
            .tracker
            .snapshot(now, fill, self.spool.pending_entries());
        snapshot.export(&self.metrics);
        debug!("Composite health: {}", snapshot.composite);

        let actions = self.watchdog.step(&snapshot, now);
        self.snapshot.send_replace(snapshot);

        for action in actions {
            self.metrics
                .watchdog_actions
                .with_label_values(&[action.label()])
                .inc();
            match action {
                RecoveryAction::Restart(subsystem) => self.actions.restart(subsystem).await,
                RecoveryAction::Reboot => self.actions.reboot().await,
            }
        }
    }
}
