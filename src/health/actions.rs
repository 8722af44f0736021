//! Recovery actions executed on behalf of the watchdog.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use super::Subsystem;
use crate::config::HealthConfig;
use crate::sink::Sink;

/// Time allowed for a service manager command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Side effects the watchdog can request
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecoveryActions: Send + Sync {
    /// Restart one subsystem
    async fn restart(&self, subsystem: Subsystem);

    /// Reboot the node
    async fn reboot(&self);
}

/// Recovery actions on the real system
pub struct SystemActions {
    gnss_restart: Arc<Notify>,
    sink: Arc<dyn Sink>,
    gnss_service: Option<String>,
    oscillator_service: Option<String>,
    reboot_enabled: bool,
    reboot_command: Vec<String>,
}

impl std::fmt::Debug for SystemActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemActions")
            .field("gnss_service", &self.gnss_service)
            .field("oscillator_service", &self.oscillator_service)
            .field("reboot_enabled", &self.reboot_enabled)
            .field("reboot_command", &self.reboot_command)
            .finish_non_exhaustive()
    }
}

impl SystemActions {
    /// `gnss_restart` wakes the gpsd adapter so it reconnects
    pub fn new(config: &HealthConfig, gnss_restart: Arc<Notify>, sink: Arc<dyn Sink>) -> Self {
        Self {
            gnss_restart,
            sink,
            gnss_service: config.gnss_service.clone(),
            oscillator_service: config.oscillator_service.clone(),
            reboot_enabled: config.reboot_enabled,
            reboot_command: config.reboot_command.clone(),
        }
    }

    async fn restart_service(&self, service: Option<&str>) {
        let Some(service) = service else {
            return;
        };
        let argv = vec![
            "systemctl".to_string(),
            "restart".to_string(),
            service.to_string(),
        ];
        match run_command(&argv, COMMAND_TIMEOUT).await {
            Ok(()) => info!("Restarted service {}", service),
            Err(e) => error!("Failed to restart service {}: {:#}", service, e),
        }
    }
}

#[async_trait]
impl RecoveryActions for SystemActions {
    async fn restart(&self, subsystem: Subsystem) {
        match subsystem {
            Subsystem::Gnss => {
                self.restart_service(self.gnss_service.as_deref()).await;
                self.gnss_restart.notify_one();
            }
            Subsystem::Oscillator => {
                self.restart_service(self.oscillator_service.as_deref()).await;
            }
            Subsystem::Sink => {
                self.sink.reset().await;
                info!("Sink client rebuilt");
            }
            Subsystem::Spool => {
                warn!("Spool cannot be restarted; ignoring");
            }
        }
    }

    async fn reboot(&self) {
        if !self.reboot_enabled {
            warn!("Reboot requested but disabled by configuration");
            return;
        }
        if let Err(e) = run_command(&self.reboot_command, COMMAND_TIMEOUT).await {
            error!("Reboot command failed: {:#}", e);
        }
    }
}

/// Run an external command, failing on a non-zero exit or timeout
pub async fn run_command(argv: &[String], timeout: Duration) -> anyhow::Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;

    let output = tokio::time::timeout(
        timeout,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| anyhow!("{} timed out after {:?}", program, timeout))?
    .with_context(|| format!("failed to run {}", program))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
