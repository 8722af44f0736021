//! # gpsd Adapter
//!
//! Connects to gpsd, enables the JSON watch stream and turns `TPV` and
//! `SKY` reports into samples. The connection is re-established after
//! errors, and on demand when the watchdog restarts the GNSS subsystem.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use super::{RawSample, SampleSender, SOURCE_GPSD};
use crate::config::GpsdConfig;
use crate::health::{HealthReporter, Subsystem};
use crate::shutdown::stopped;
use crate::telemetry::normalizer::{MEASUREMENT_GNSS_FIX, MEASUREMENT_GNSS_SKY};

/// Enables JSON reports on the connection
pub const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Fix modes below this carry no position
const MIN_FIX_MODE: u64 = 2;

const TPV_FIELDS: &[&str] = &[
    "lat", "lon", "alt", "speed", "climb", "track", "epx", "epy", "epv", "ept",
];

const SKY_FIELDS: &[&str] = &["hdop", "vdop", "pdop", "gdop", "tdop"];

/// One decoded gpsd report
#[derive(Debug, Clone, PartialEq)]
pub enum GpsdMessage {
    /// Position report with at least a 2D fix
    Fix(RawSample),
    /// Position report without a usable fix
    NoFix { mode: u64 },
    /// Satellite view
    Sky(RawSample),
}

/// Decode one line of the watch stream
///
/// Returns `Ok(None)` for report classes that are not recorded
/// (`VERSION`, `DEVICES`, `WATCH`, `PPS`, ...).
pub fn parse_message(line: &str) -> serde_json::Result<Option<GpsdMessage>> {
    let report: Map<String, Value> = serde_json::from_str(line)?;

    let message = match report.get("class").and_then(Value::as_str) {
        Some("TPV") => Some(parse_tpv(&report)),
        Some("SKY") => parse_sky(&report).map(GpsdMessage::Sky),
        _ => None,
    };
    Ok(message)
}

fn parse_tpv(report: &Map<String, Value>) -> GpsdMessage {
    let mode = report.get("mode").and_then(Value::as_u64).unwrap_or(0);
    if mode < MIN_FIX_MODE {
        return GpsdMessage::NoFix { mode };
    }

    let mut values = Map::new();
    for &field in TPV_FIELDS {
        if let Some(value) = report.get(field) {
            values.insert(field.to_string(), value.clone());
        }
    }
    // Newer gpsd releases report altitude only as altMSL / altHAE
    if !values.contains_key("alt") {
        if let Some(alt) = report.get("altMSL").or_else(|| report.get("altHAE")) {
            values.insert("alt".to_string(), alt.clone());
        }
    }
    values.insert("mode".to_string(), Value::from(mode));

    let timestamp = report
        .get("time")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));

    GpsdMessage::Fix(RawSample::new(
        MEASUREMENT_GNSS_FIX,
        SOURCE_GPSD,
        values,
        timestamp,
    ))
}

fn parse_sky(report: &Map<String, Value>) -> Option<RawSample> {
    let satellites = report.get("satellites").and_then(Value::as_array);

    let visible = report
        .get("nSat")
        .and_then(Value::as_u64)
        .or_else(|| satellites.map(|s| s.len() as u64))?;
    let used = report.get("uSat").and_then(Value::as_u64).or_else(|| {
        satellites.map(|s| {
            s.iter()
                .filter(|sat| sat.get("used").and_then(Value::as_bool) == Some(true))
                .count() as u64
        })
    })?;

    let mut values = Map::new();
    values.insert("satellites_visible".to_string(), Value::from(visible));
    values.insert("satellites_used".to_string(), Value::from(used));
    for &field in SKY_FIELDS {
        if let Some(value) = report.get(field) {
            values.insert(field.to_string(), value.clone());
        }
    }

    let timestamp = report
        .get("time")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));

    Some(RawSample::new(
        MEASUREMENT_GNSS_SKY,
        SOURCE_GPSD,
        values,
        timestamp,
    ))
}

/// gpsd watch client task
pub struct GpsdAdapter {
    addr: String,
    reconnect: Duration,
    samples: SampleSender,
    health: HealthReporter,
    restart: Arc<Notify>,
}

impl GpsdAdapter {
    /// `restart` forces a reconnect when notified
    pub fn new(
        config: &GpsdConfig,
        samples: SampleSender,
        health: HealthReporter,
        restart: Arc<Notify>,
    ) -> Self {
        Self {
            addr: format!("{}:{}", config.host, config.port),
            reconnect: Duration::from_millis(config.reconnect_ms),
            samples,
            health,
            restart,
        }
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("gpsd adapter started ({})", self.addr);

        loop {
            let result = tokio::select! {
                result = self.connect() => result,
                _ = self.restart.notified() => {
                    info!("GNSS restart requested, reconnecting to gpsd");
                    continue;
                }
                _ = stopped(&mut shutdown) => break,
            };

            if let Err(e) = result {
                warn!("gpsd session ended: {:#}", e);
                self.health
                    .bad(Subsystem::Gnss, format!("gpsd unavailable: {}", e));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect) => {}
                _ = self.restart.notified() => {
                    info!("GNSS restart requested, reconnecting to gpsd");
                }
                _ = stopped(&mut shutdown) => break,
            }
        }

        info!("gpsd adapter stopped");
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.addr))?;
        info!("Connected to gpsd at {}", self.addr);
        self.session(stream).await
    }

    /// Enable watch mode on `stream` and process reports until it closes
    pub async fn session<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        writer
            .write_all(WATCH_COMMAND)
            .await
            .context("failed to enable watch mode")?;

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            self.handle_line(&line);
        }

        bail!("connection closed by gpsd")
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match parse_message(line) {
            Ok(Some(GpsdMessage::Fix(sample))) => {
                let mode = sample.values.get("mode").and_then(Value::as_u64).unwrap_or(0);
                self.health
                    .good(Subsystem::Gnss, format!("{}D fix", mode));
                self.samples.send(sample);
            }
            Ok(Some(GpsdMessage::NoFix { mode })) => {
                debug!("gpsd reports no fix (mode {})", mode);
                self.health.bad(Subsystem::Gnss, "no fix");
            }
            Ok(Some(GpsdMessage::Sky(sample))) => {
                self.samples.send(sample);
            }
            Ok(None) => {}
            Err(e) => debug!("Ignoring malformed gpsd report: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Observation;
    use crate::telemetry::metrics::Metrics;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    const TPV_3D: &str = r#"{"class":"TPV","device":"/dev/ttyAMA0","mode":3,"time":"2025-06-01T12:00:00.000Z","lat":52.2297,"lon":21.0122,"altMSL":110.5,"speed":0.02,"climb":-0.1,"track":181.3,"epx":2.1,"epy":2.4,"epv":4.8,"ept":0.005}"#;
    const TPV_NO_FIX: &str = r#"{"class":"TPV","device":"/dev/ttyAMA0","mode":1}"#;
    const SKY: &str = r#"{"class":"SKY","device":"/dev/ttyAMA0","hdop":0.9,"pdop":1.6,"satellites":[{"PRN":5,"used":true},{"PRN":12,"used":true},{"PRN":29,"used":false}]}"#;

    fn adapter() -> (
        GpsdAdapter,
        mpsc::Receiver<RawSample>,
        mpsc::Receiver<Observation>,
    ) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (samples, sample_rx) = SampleSender::channel(16, metrics);
        let (health, health_rx) = HealthReporter::channel(16);
        let adapter = GpsdAdapter::new(
            &GpsdConfig::default(),
            samples,
            health,
            Arc::new(Notify::new()),
        );
        (adapter, sample_rx, health_rx)
    }

    #[test]
    fn test_parse_tpv_fix() {
        let Some(GpsdMessage::Fix(sample)) = parse_message(TPV_3D).unwrap() else {
            panic!("expected a fix");
        };
        assert_eq!(sample.measurement, "gnss_fix");
        assert_eq!(sample.source, "gpsd");
        assert_eq!(sample.values["lat"], 52.2297);
        assert_eq!(sample.values["alt"], 110.5);
        assert_eq!(sample.values["mode"], 3);
        assert_eq!(
            sample.timestamp,
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
        );
        assert!(!sample.values.contains_key("device"));
    }

    #[test]
    fn test_parse_tpv_without_fix() {
        assert_eq!(
            parse_message(TPV_NO_FIX).unwrap(),
            Some(GpsdMessage::NoFix { mode: 1 })
        );
        assert_eq!(
            parse_message(r#"{"class":"TPV"}"#).unwrap(),
            Some(GpsdMessage::NoFix { mode: 0 })
        );
    }

    #[test]
    fn test_parse_sky_counts_satellites() {
        let Some(GpsdMessage::Sky(sample)) = parse_message(SKY).unwrap() else {
            panic!("expected a sky report");
        };
        assert_eq!(sample.values["satellites_visible"], 3);
        assert_eq!(sample.values["satellites_used"], 2);
        assert_eq!(sample.values["hdop"], 0.9);
        assert_eq!(sample.timestamp, None);
    }

    #[test]
    fn test_parse_sky_summary_counts() {
        let line = r#"{"class":"SKY","nSat":14,"uSat":8}"#;
        let Some(GpsdMessage::Sky(sample)) = parse_message(line).unwrap() else {
            panic!("expected a sky report");
        };
        assert_eq!(sample.values["satellites_visible"], 14);
        assert_eq!(sample.values["satellites_used"], 8);

        // Nothing to count
        assert_eq!(parse_message(r#"{"class":"SKY","hdop":1.0}"#).unwrap(), None);
    }

    #[test]
    fn test_other_classes_ignored() {
        let version = r#"{"class":"VERSION","release":"3.25","proto_major":3,"proto_minor":15}"#;
        assert_eq!(parse_message(version).unwrap(), None);
        assert!(parse_message("not json").is_err());
    }

    #[tokio::test]
    async fn test_session_streams_reports() {
        let (adapter, mut samples, mut health) = adapter();
        let stream = tokio_test::io::Builder::new()
            .write(WATCH_COMMAND)
            .read(b"{\"class\":\"VERSION\",\"release\":\"3.25\"}\n")
            .read(format!("{}\n{}\n", TPV_3D, SKY).as_bytes())
            .read(b"garbage\n")
            .read(format!("{}\n", TPV_NO_FIX).as_bytes())
            .build();

        let err = adapter.session(stream).await.unwrap_err();
        assert!(err.to_string().contains("closed"));

        assert_eq!(samples.try_recv().unwrap().measurement, "gnss_fix");
        assert_eq!(samples.try_recv().unwrap().measurement, "gnss_sky");
        assert!(samples.try_recv().is_err());

        let good = health.try_recv().unwrap();
        assert!(good.ok);
        assert_eq!(good.detail, "3D fix");
        let bad = health.try_recv().unwrap();
        assert_eq!(bad.subsystem, Subsystem::Gnss);
        assert_eq!(bad.detail, "no fix");
    }

    #[tokio::test]
    async fn test_run_reports_unreachable_gpsd() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let metrics = Arc::new(Metrics::new().unwrap());
        let (samples, _sample_rx) = SampleSender::channel(16, metrics);
        let (health, mut health_rx) = HealthReporter::channel(16);
        let config = GpsdConfig {
            port,
            reconnect_ms: 60_000,
            ..GpsdConfig::default()
        };
        let adapter = GpsdAdapter::new(&config, samples, health, Arc::new(Notify::new()));

        let (tx, rx) = crate::shutdown::channel();
        let task = tokio::spawn(adapter.run(rx));

        let observation = tokio::time::timeout(Duration::from_secs(5), health_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observation.subsystem, Subsystem::Gnss);
        assert!(observation.detail.starts_with("gpsd unavailable"));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
