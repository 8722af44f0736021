//! # GNSS Spooler
//!
//! Durable GNSS and oscillator telemetry spooler for unattended timing
//! appliances.
//!
//! # Usage
//!
//! ```bash
//! gnss-spooler --config /etc/pi5-ptp-node/spooler.toml run
//! gnss-spooler status
//! gnss-spooler check-config
//! ```
//!
//! `run` exits 0 after a clean shutdown, 2 on a configuration error, 3 when
//! the spool directory cannot be opened and 4 when the status listener or
//! runtime cannot be set up. `status` exits 0/1/2 for a healthy, degraded
//! or unhealthy spooler and 3 when it cannot be reached.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use gnss_spooler::config::{Config, LoggingConfig, DEFAULT_CONFIG_PATH};
use gnss_spooler::error::EXIT_RESOURCES;
use gnss_spooler::{daemon, status};

/// Default address queried by `status`
const DEFAULT_STATUS_ADDR: &str = "127.0.0.1:9108";

#[derive(Debug, Parser)]
#[command(name = "gnss-spooler", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand, PartialEq)]
enum Command {
    /// Run the spooler until SIGINT or SIGTERM (default)
    Run,
    /// Query a running spooler's health
    Status {
        /// Status endpoint address
        #[arg(long, default_value = DEFAULT_STATUS_ADDR)]
        addr: String,

        /// Request timeout in seconds
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&cli.config),
        Command::Status { addr, timeout } => query_status(&addr, Duration::from_secs(timeout)),
        Command::CheckConfig => check_config(&cli.config),
    });
}

fn run(path: &Path) -> i32 {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            // No logging config yet; report on stderr through the default subscriber
            let _guard = init_logging(&LoggingConfig::default());
            error!("Failed to load {:?}: {}", path, e);
            return e.exit_code();
        }
    };
    let _guard = init_logging(&config.logging);

    info!("GNSS Spooler v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {:?}", path);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the async runtime: {}", e);
            return EXIT_RESOURCES;
        }
    };

    match runtime.block_on(daemon::run(config)) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

fn query_status(addr: &str, timeout: Duration) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start the async runtime: {}", e);
            return status::EXIT_UNREACHABLE;
        }
    };

    match runtime.block_on(status::query(addr, timeout)) {
        Ok(snapshot) => {
            match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{:?}", snapshot.composite),
            }
            status::exit_code(snapshot.composite)
        }
        Err(e) => {
            eprintln!("gnss-spooler at {} is unreachable: {:#}", addr, e);
            status::EXIT_UNREACHABLE
        }
    }
}

fn check_config(path: &Path) -> i32 {
    match Config::load(path) {
        Ok(config) => {
            println!("{:?}: OK", path);
            println!("  device:   {}", config.device.id);
            println!("  sink:     {} ({}/{})", config.sink.url, config.sink.org, config.sink.bucket);
            println!(
                "  spool:    {:?} ({} bytes)",
                config.spool.dir, config.spool.capacity_bytes
            );
            println!("  status:   {}", config.status.listen);
            0
        }
        Err(e) => {
            eprintln!("{:?}: {}", path, e);
            e.exit_code()
        }
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over `logging.level`. With `logging.dir` set, output is
/// also written to a daily-rotated file; the returned guard flushes it.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let stdout = tracing_subscriber::fmt::layer();

    let Some(dir) = &logging.dir else {
        tracing_subscriber::registry().with(filter).with(stdout).init();
        return None;
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("gnss-spooler")
        .filename_suffix("log")
        .build(dir);

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(file)
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            warn!("Logging to stdout only, cannot write to {:?}: {}", dir, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_is_default() {
        let cli = Cli::try_parse_from(["gnss-spooler"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["gnss-spooler", "check-config", "--config", "/tmp/s.toml"])
            .unwrap();
        assert_eq!(cli.command, Some(Command::CheckConfig));
        assert_eq!(cli.config, PathBuf::from("/tmp/s.toml"));
    }

    #[test]
    fn test_status_defaults() {
        let cli = Cli::try_parse_from(["gnss-spooler", "status"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Status {
                addr: DEFAULT_STATUS_ADDR.to_string(),
                timeout: 3,
            })
        );
    }

    #[test]
    fn test_check_config_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spooler.toml");
        assert_eq!(check_config(&path), gnss_spooler::error::EXIT_CONFIG);

        std::fs::write(&path, "[sink]\nurl = \"http://influx:8086\"\n").unwrap();
        assert_eq!(check_config(&path), gnss_spooler::error::EXIT_CONFIG);

        std::fs::write(
            &path,
            "[sink]\nurl = \"http://influx:8086\"\ntoken = \"t\"\norg = \"o\"\nbucket = \"b\"\n",
        )
        .unwrap();
        assert_eq!(check_config(&path), 0);
    }

    #[test]
    fn test_unreachable_status() {
        // Port 1 is never served
        assert_eq!(
            query_status("127.0.0.1:1", Duration::from_millis(500)),
            status::EXIT_UNREACHABLE
        );
    }
}
