//! # Daemon Wiring
//!
//! Builds every task from the configuration, runs them until a shutdown
//! signal arrives and joins them in pipeline order so nothing in flight
//! is lost.

use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::delivery::{DeliveryContext, Drainer, Writer};
use crate::error::Result;
use crate::health::{HealthMonitor, HealthReporter, Subsystem, SystemActions, Watchdog};
use crate::sink::{InfluxSink, Sink};
use crate::sources::{ChronyPoller, GpsdAdapter, SampleSender};
use crate::spool::SpoolQueue;
use crate::status::{self, StatusState};
use crate::telemetry::metrics::Metrics;
use crate::telemetry::normalizer::Normalizer;
use crate::telemetry::sequence::SequenceStore;

/// Depth of the health observation queue
const OBSERVATION_QUEUE_DEPTH: usize = 256;

/// Running set of spooler tasks
pub struct Daemon {
    shutdown: watch::Sender<bool>,
    /// Joined in order; producers come first
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    spool: Arc<SpoolQueue>,
    status_addr: Option<SocketAddr>,
}

impl Daemon {
    /// Open the spool, bind the status listener and spawn every task
    ///
    /// # Errors
    ///
    /// Fails only on startup faults: metrics registration, spool recovery
    /// or binding the status listener. Each maps to its own exit code.
    pub async fn start(config: &Config, sink: Arc<dyn Sink>) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let spool = Arc::new(SpoolQueue::open(&config.spool, metrics.clone())?);

        // Bind before anything is spawned so a port conflict aborts cleanly
        let listener = if config.status.enabled {
            Some(status::bind(config.status_addr()?).await?)
        } else {
            None
        };
        let status_addr = listener.as_ref().and_then(|l| l.local_addr().ok());

        let (shutdown, shutdown_rx) = crate::shutdown::channel();
        let (health, observations) = HealthReporter::channel(OBSERVATION_QUEUE_DEPTH);
        let mut tasks = Vec::new();

        // Sources
        let (samples, sample_rx) =
            SampleSender::channel(config.sources.queue_depth, metrics.clone());
        let gnss_restart = Arc::new(Notify::new());

        if config.sources.gpsd.enabled {
            let adapter = GpsdAdapter::new(
                &config.sources.gpsd,
                samples.clone(),
                health.clone(),
                gnss_restart.clone(),
            );
            tasks.push(("gpsd", tokio::spawn(adapter.run(shutdown_rx.clone()))));
        }
        if config.sources.chrony.enabled {
            let poller = ChronyPoller::new(&config.sources.chrony, samples.clone(), health.clone());
            tasks.push(("chrony", tokio::spawn(poller.run(shutdown_rx.clone()))));
        }
        // Only the adapters may hold senders, or the normalizer never drains
        drop(samples);

        // Pipeline
        let ctx = DeliveryContext::new(sink.clone(), spool.clone(), health.clone(), metrics.clone());
        let (writer, handle) = Writer::new(&config.writer, &config.sink, ctx.clone());
        let drainer = Drainer::new(
            &config.drain,
            &config.sink,
            Duration::from_secs(config.writer.auth_backoff_s),
            ctx,
        );
        let normalizer = Normalizer::new(config.device.id.clone(), metrics.clone())
            .with_sequence_store(SequenceStore::open(&config.spool.dir));

        tasks.push(("normalizer", tokio::spawn(normalizer.run(sample_rx, handle))));
        tasks.push(("writer", tokio::spawn(writer.run(shutdown_rx.clone()))));
        tasks.push(("drainer", tokio::spawn(drainer.run(shutdown_rx.clone()))));

        // Health
        let actions = Arc::new(SystemActions::new(&config.health, gnss_restart, sink));
        let (mut monitor, snapshot) = HealthMonitor::new(
            &config.health,
            Watchdog::from_config(&config.health),
            observations,
            spool.clone(),
            actions,
            metrics.clone(),
        );
        let now = Utc::now();
        if config.sources.gpsd.enabled {
            monitor = monitor.watch_liveness(Subsystem::Gnss, now);
        }
        if config.sources.chrony.enabled {
            monitor = monitor.watch_liveness(Subsystem::Oscillator, now);
        }
        tasks.push(("health", tokio::spawn(monitor.run(shutdown_rx.clone()))));

        if let Some(listener) = listener {
            let state = StatusState { snapshot, metrics };
            tasks.push(("status", tokio::spawn(status::serve(listener, state, shutdown_rx))));
        }

        info!(
            "Spooler running for device {} ({} tasks)",
            config.device.id,
            tasks.len()
        );

        Ok(Self {
            shutdown,
            tasks,
            spool,
            status_addr,
        })
    }

    /// Address the status endpoint is bound to, if enabled
    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    pub fn spool(&self) -> &Arc<SpoolQueue> {
        &self.spool
    }

    /// Signal shutdown and wait for every task to finish
    pub async fn stop(self) {
        info!("Shutting down");
        self.shutdown.send_replace(true);

        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!("{} task failed: {}", name, e);
            }
        }

        let spool = self.spool.clone();
        match tokio::task::spawn_blocking(move || spool.checkpoint()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Final spool checkpoint failed: {}", e),
            Err(e) => warn!("Final spool checkpoint task failed: {}", e),
        }
        info!(
            "Shutdown complete, {} entries left in spool",
            self.spool.pending_entries()
        );
    }
}

/// Run the spooler until SIGINT or SIGTERM
pub async fn run(config: Config) -> Result<()> {
    let sink: Arc<dyn Sink> = Arc::new(InfluxSink::new(&config.sink)?);
    let daemon = Daemon::start(&config, sink).await?;
    shutdown_signal().await;
    daemon.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EXIT_SPOOL;
    use crate::health::HealthLevel;
    use crate::sink::mocks::MockSink;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    const TRACKING: &str = "50505300,PPS,1,1748779200.123456789,-0.000000021,0.000000015,0.000000110,-2.145,0.001,0.012,0.000000001,0.000010000,16.0,Normal";

    fn config(dir: &Path, chronyc: &str) -> Config {
        let toml = format!(
            r#"
[sink]
url = "http://127.0.0.1:1"
token = "secret"
org = "timing"
bucket = "gnss"

[spool]
dir = "{spool}"

[sources]
gpsd = {{ enabled = false }}
chrony = {{ enabled = true, command = "{chronyc}", poll_interval_ms = 50 }}

[status]
listen = "127.0.0.1:0"
"#,
            spool = dir.join("spool").display(),
            chronyc = chronyc,
        );
        toml::from_str(&toml).unwrap()
    }

    fn fake_chronyc(dir: &Path) -> String {
        let path = dir.join("chronyc");
        std::fs::write(&path, format!("#!/bin/sh\nprintf '{}\\n'\n", TRACKING)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_samples_flow_to_sink_and_stop_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &fake_chronyc(dir.path()));
        let sink = MockSink::new();

        let daemon = Daemon::start(&config, Arc::new(sink.clone())).await.unwrap();
        let addr = daemon.status_addr().unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while sink.delivered_sequences().len() < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let snapshot = status::query(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_ne!(snapshot.composite, HealthLevel::Unhealthy);

        tokio::time::timeout(Duration::from_secs(10), daemon.stop())
            .await
            .unwrap();

        let delivered = sink.delivered_sequences();
        assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        assert!(status::query(&addr.to_string(), Duration::from_millis(500))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_outage_spools_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &fake_chronyc(dir.path()));
        let sink = MockSink::new();
        sink.set_failure(Some(crate::sink::DeliveryError::Connect(
            "connection refused".to_string(),
        )));

        let daemon = Daemon::start(&config, Arc::new(sink.clone())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while daemon.spool().pending_entries() < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        daemon.stop().await;
        assert!(sink.delivered_sequences().is_empty());

        sink.set_failure(None);
        let daemon = Daemon::start(&config, Arc::new(sink.clone())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while sink.delivered_sequences().len() < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_unusable_spool_dir_is_spool_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let mut config = config(dir.path(), "chronyc");
        config.spool.dir = blocker.join("spool");

        let err = Daemon::start(&config, Arc::new(MockSink::new()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), EXIT_SPOOL);
    }

    #[tokio::test]
    async fn test_status_port_in_use_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = config(dir.path(), "chronyc");
        config.status.listen = taken.local_addr().unwrap().to_string();

        let err = Daemon::start(&config, Arc::new(MockSink::new()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), crate::error::EXIT_RESOURCES);
    }
}
