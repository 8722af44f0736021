//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Values from the file can be overridden by the environment variables the
//! appliance's env file has always used (`INFLUX_URL`, `INFLUX_TOKEN`,
//! `INFLUX_ORG`, `INFLUX_BUCKET`, `SPOOL_DIR`, `SPOOL_MAX_BYTES`).

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SpoolerError};

/// Default configuration file location on the appliance
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pi5-ptp-node/spooler.toml";

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub spool: SpoolConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device identity, attached to every record as the `device` tag
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub id: String,
}

/// Remote time-series sink configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub org: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,

    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
}

/// Disk spool configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SpoolConfig {
    #[serde(default = "default_spool_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,

    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: u64,

    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

/// Live-path writer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WriterConfig {
    #[serde(default = "default_writer_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_auth_backoff_s")]
    pub auth_backoff_s: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Backlog drainer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DrainConfig {
    #[serde(default = "default_drain_rate_per_sec")]
    pub rate_per_sec: f64,

    #[serde(default = "default_drain_burst")]
    pub burst: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

/// Health monitor and watchdog configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval_s")]
    pub check_interval_s: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_unhealthy_after_s")]
    pub unhealthy_after_s: u64,

    #[serde(default = "default_stale_after_s")]
    pub stale_after_s: u64,

    #[serde(default = "default_spool_unhealthy_ratio")]
    pub spool_unhealthy_ratio: f64,

    #[serde(default = "default_restart_interval_s")]
    pub restart_interval_s: u64,

    #[serde(default = "default_reboot_after_s")]
    pub reboot_after_s: u64,

    #[serde(default = "default_reboot_cooldown_s")]
    pub reboot_cooldown_s: u64,

    #[serde(default = "default_reboot_enabled")]
    pub reboot_enabled: bool,

    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,

    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    #[serde(default = "default_gnss_service")]
    pub gnss_service: Option<String>,

    #[serde(default = "default_oscillator_service")]
    pub oscillator_service: Option<String>,
}

/// Source adapter configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default)]
    pub gpsd: GpsdConfig,

    #[serde(default)]
    pub chrony: ChronyConfig,

    #[serde(default = "default_sample_queue_depth")]
    pub queue_depth: usize,
}

/// gpsd watch client configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GpsdConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_gpsd_host")]
    pub host: String,

    #[serde(default = "default_gpsd_port")]
    pub port: u16,

    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
}

/// chrony tracking poller configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ChronyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_chronyc")]
    pub command: String,

    #[serde(default = "default_chrony_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_chrony_timeout_ms")]
    pub timeout_ms: u64,
}

/// Local status endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_status_listen")]
    pub listen: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// Default value functions
fn default_device_id() -> String { "pi5-ptp-node".to_string() }

fn default_auth_scheme() -> String { "Token".to_string() }
fn default_sink_timeout_ms() -> u64 { 2000 }
fn default_batch_max() -> usize { 500 }

fn default_spool_dir() -> PathBuf { PathBuf::from("/var/spool/pi5-ptp-node") }
fn default_capacity_bytes() -> u64 { 20_000_000_000 }
fn default_segment_bytes() -> u64 { 10_000_000 }
fn default_fsync() -> bool { true }

fn default_writer_queue_depth() -> usize { 1024 }
fn default_auth_backoff_s() -> u64 { 60 }
fn default_shutdown_grace_ms() -> u64 { 5000 }

fn default_drain_rate_per_sec() -> f64 { 20.0 }
fn default_drain_burst() -> u32 { 20 }
fn default_backoff_base_ms() -> u64 { 1000 }
fn default_backoff_max_ms() -> u64 { 60_000 }
fn default_backoff_jitter() -> f64 { 0.2 }
fn default_idle_poll_ms() -> u64 { 1000 }

fn default_check_interval_s() -> u64 { 10 }
fn default_failure_threshold() -> u32 { 3 }
fn default_unhealthy_after_s() -> u64 { 300 }
fn default_stale_after_s() -> u64 { 30 }
fn default_spool_unhealthy_ratio() -> f64 { 0.9 }
fn default_restart_interval_s() -> u64 { 600 }
fn default_reboot_after_s() -> u64 { 1800 }
fn default_reboot_cooldown_s() -> u64 { 6 * 3600 }
fn default_reboot_enabled() -> bool { true }
fn default_reboot_command() -> Vec<String> { vec!["systemctl".to_string(), "reboot".to_string()] }
fn default_state_file() -> PathBuf { PathBuf::from("/var/lib/pi5-ptp-node/watchdog.json") }
fn default_gnss_service() -> Option<String> { Some("gpsd".to_string()) }
fn default_oscillator_service() -> Option<String> { Some("chrony".to_string()) }

fn default_sample_queue_depth() -> usize { 256 }
fn default_enabled() -> bool { true }
fn default_gpsd_host() -> String { "127.0.0.1".to_string() }
fn default_gpsd_port() -> u16 { 2947 }
fn default_reconnect_ms() -> u64 { 5000 }
fn default_chronyc() -> String { "chronyc".to_string() }
fn default_chrony_poll_ms() -> u64 { 2000 }
fn default_chrony_timeout_ms() -> u64 { 3000 }

fn default_status_listen() -> String { "127.0.0.1:9108".to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { id: default_device_id() }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: default_spool_dir(),
            capacity_bytes: default_capacity_bytes(),
            segment_bytes: default_segment_bytes(),
            fsync: default_fsync(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_writer_queue_depth(),
            auth_backoff_s: default_auth_backoff_s(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: default_drain_rate_per_sec(),
            burst: default_drain_burst(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_s: default_check_interval_s(),
            failure_threshold: default_failure_threshold(),
            unhealthy_after_s: default_unhealthy_after_s(),
            stale_after_s: default_stale_after_s(),
            spool_unhealthy_ratio: default_spool_unhealthy_ratio(),
            restart_interval_s: default_restart_interval_s(),
            reboot_after_s: default_reboot_after_s(),
            reboot_cooldown_s: default_reboot_cooldown_s(),
            reboot_enabled: default_reboot_enabled(),
            reboot_command: default_reboot_command(),
            state_file: default_state_file(),
            gnss_service: default_gnss_service(),
            oscillator_service: default_oscillator_service(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            gpsd: GpsdConfig::default(),
            chrony: ChronyConfig::default(),
            queue_depth: default_sample_queue_depth(),
        }
    }
}

impl Default for GpsdConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_gpsd_host(),
            port: default_gpsd_port(),
            reconnect_ms: default_reconnect_ms(),
        }
    }
}

impl Default for ChronyConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            command: default_chronyc(),
            poll_interval_ms: default_chrony_poll_ms(),
            timeout_ms: default_chrony_timeout_ms(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen: default_status_listen(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl SinkConfig {
    /// Live delivery timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Environment overrides are applied after parsing and before validation.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails (missing sink URL/token/org/bucket, out-of-range values)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use gnss_spooler::config::Config;
    ///
    /// let config = Config::load("/etc/pi5-ptp-node/spooler.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            SpoolerError::Config(toml::de::Error::custom(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        })?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the appliance environment
    ///
    /// `lookup` returns the value of an environment variable, if set. Empty
    /// values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("INFLUX_URL") {
            self.sink.url = url;
        }
        if let Some(token) = get("INFLUX_TOKEN") {
            self.sink.token = token;
        }
        if let Some(org) = get("INFLUX_ORG") {
            self.sink.org = org;
        }
        if let Some(bucket) = get("INFLUX_BUCKET") {
            self.sink.bucket = bucket;
        }
        if let Some(dir) = get("SPOOL_DIR") {
            self.spool.dir = PathBuf::from(dir);
        }
        if let Some(max) = get("SPOOL_MAX_BYTES") {
            self.spool.capacity_bytes = max.trim().parse().map_err(|_| {
                SpoolerError::Config(toml::de::Error::custom(format!(
                    "SPOOL_MAX_BYTES is not a byte count: {}",
                    max
                )))
            })?;
        }

        Ok(())
    }

    /// Parsed status listener address
    pub fn status_addr(&self) -> Result<SocketAddr> {
        self.status.listen.parse().map_err(|_| {
            SpoolerError::Config(toml::de::Error::custom(format!(
                "status listen address is invalid: {}",
                self.status.listen
            )))
        })
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if a required option is missing or any value is out of range
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl std::fmt::Display) -> SpoolerError {
            SpoolerError::Config(toml::de::Error::custom(msg))
        }

        // Validate sink configuration
        if self.sink.url.is_empty() {
            return Err(invalid("sink url is required (or INFLUX_URL)"));
        }

        if !self.sink.url.starts_with("http://") && !self.sink.url.starts_with("https://") {
            return Err(invalid("sink url must start with http:// or https://"));
        }

        if self.sink.token.is_empty() {
            return Err(invalid("sink token is required (or INFLUX_TOKEN)"));
        }

        if self.sink.org.is_empty() || self.sink.bucket.is_empty() {
            return Err(invalid("sink org and bucket are required"));
        }

        if !["Token", "Bearer"].contains(&self.sink.auth_scheme.as_str()) {
            return Err(invalid("sink auth_scheme must be one of: Token, Bearer"));
        }

        if self.sink.timeout_ms == 0 || self.sink.timeout_ms > 60_000 {
            return Err(invalid("sink timeout_ms must be between 1 and 60000"));
        }

        if self.sink.batch_max == 0 || self.sink.batch_max > 10_000 {
            return Err(invalid("sink batch_max must be between 1 and 10000"));
        }

        if self.device.id.is_empty() {
            return Err(invalid("device id cannot be empty"));
        }

        // Validate spool configuration
        if self.spool.dir.as_os_str().is_empty() {
            return Err(invalid("spool dir cannot be empty"));
        }

        if self.spool.segment_bytes < 4096 || self.spool.segment_bytes > 1 << 30 {
            return Err(invalid("spool segment_bytes must be between 4096 and 1073741824"));
        }

        if self.spool.capacity_bytes < self.spool.segment_bytes * 2 {
            return Err(invalid("spool capacity_bytes must be at least twice segment_bytes"));
        }

        // Validate writer configuration
        if self.writer.queue_depth == 0 {
            return Err(invalid("writer queue_depth must be greater than 0"));
        }

        if self.writer.auth_backoff_s == 0 || self.writer.auth_backoff_s > 3600 {
            return Err(invalid("writer auth_backoff_s must be between 1 and 3600"));
        }

        // Validate drainer configuration
        if !(self.drain.rate_per_sec > 0.0) || self.drain.rate_per_sec > 10_000.0 {
            return Err(invalid("drain rate_per_sec must be between 0 (exclusive) and 10000"));
        }

        if self.drain.burst == 0 {
            return Err(invalid("drain burst must be greater than 0"));
        }

        if self.drain.backoff_base_ms == 0 || self.drain.backoff_base_ms > self.drain.backoff_max_ms {
            return Err(invalid("drain backoff_base_ms must be between 1 and backoff_max_ms"));
        }

        if !(0.0..=1.0).contains(&self.drain.backoff_jitter) {
            return Err(invalid("drain backoff_jitter must be between 0.0 and 1.0"));
        }

        if self.drain.idle_poll_ms == 0 || self.drain.idle_poll_ms > 60_000 {
            return Err(invalid("drain idle_poll_ms must be between 1 and 60000"));
        }

        // Validate health configuration
        if self.health.check_interval_s == 0 || self.health.check_interval_s > 3600 {
            return Err(invalid("health check_interval_s must be between 1 and 3600"));
        }

        if self.health.failure_threshold == 0 {
            return Err(invalid("health failure_threshold must be greater than 0"));
        }

        if self.health.unhealthy_after_s == 0 || self.health.stale_after_s == 0 {
            return Err(invalid("health unhealthy_after_s and stale_after_s must be greater than 0"));
        }

        if !(self.health.spool_unhealthy_ratio > 0.0 && self.health.spool_unhealthy_ratio <= 1.0) {
            return Err(invalid("health spool_unhealthy_ratio must be in (0.0, 1.0]"));
        }

        if self.health.reboot_after_s <= self.health.unhealthy_after_s {
            return Err(invalid("health reboot_after_s must be greater than unhealthy_after_s"));
        }

        if self.health.reboot_cooldown_s < self.health.reboot_after_s {
            return Err(invalid("health reboot_cooldown_s must be at least reboot_after_s"));
        }

        if self.health.reboot_enabled && self.health.reboot_command.is_empty() {
            return Err(invalid("health reboot_command cannot be empty when reboot is enabled"));
        }

        // Validate sources
        if self.sources.queue_depth == 0 {
            return Err(invalid("sources queue_depth must be greater than 0"));
        }

        if self.sources.gpsd.enabled && self.sources.gpsd.host.is_empty() {
            return Err(invalid("gpsd host cannot be empty when enabled"));
        }

        if self.sources.chrony.enabled && self.sources.chrony.command.is_empty() {
            return Err(invalid("chrony command cannot be empty when enabled"));
        }

        if self.sources.chrony.poll_interval_ms == 0 || self.sources.chrony.poll_interval_ms > 60_000 {
            return Err(invalid("chrony poll_interval_ms must be between 1 and 60000"));
        }

        // Validate status listener
        if self.status.enabled {
            self.status_addr()?;
        }

        // Validate log level
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}
