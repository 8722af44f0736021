//! # Dual-Path Writer
//!
//! Delivers normalized records straight to the sink and falls back to the
//! spool when that fails. Nothing the writer accepts is held in memory
//! longer than one delivery attempt.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::DeliveryContext;
use crate::config::{SinkConfig, WriterConfig};
use crate::error::{Result, SpoolerError};
use crate::health::Subsystem;
use crate::sink::DeliveryError;
use crate::telemetry::metrics::PATH_LIVE;
use crate::telemetry::record::TelemetryRecord;

/// Producer side of the writer queue
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<TelemetryRecord>,
}

impl WriterHandle {
    /// Queue a record for delivery, waiting only while the queue is full
    pub async fn submit(&self, record: TelemetryRecord) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|_| SpoolerError::Closed("writer"))
    }
}

/// Live delivery task
pub struct Writer {
    rx: mpsc::Receiver<TelemetryRecord>,
    ctx: DeliveryContext,
    batch_max: usize,
    timeout: Duration,
    auth_backoff: Duration,
    shutdown_grace: Duration,
}

impl Writer {
    pub fn new(
        writer: &WriterConfig,
        sink: &SinkConfig,
        ctx: DeliveryContext,
    ) -> (Self, WriterHandle) {
        let (tx, rx) = mpsc::channel(writer.queue_depth.max(1));
        let task = Self {
            rx,
            ctx,
            batch_max: sink.batch_max.max(1),
            timeout: sink.timeout(),
            auth_backoff: Duration::from_secs(writer.auth_backoff_s),
            shutdown_grace: Duration::from_millis(writer.shutdown_grace_ms),
        };
        (task, WriterHandle { tx })
    }

    /// Run until every [`WriterHandle`] is dropped
    ///
    /// Once `shutdown` fires, deliveries are only attempted until the grace
    /// period runs out; later records go straight to the spool.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Writer started (batch max {}, timeout {:?})",
            self.batch_max, self.timeout
        );
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed(), if deadline.is_none() => {
                    deadline = Some(Instant::now() + self.shutdown_grace);
                    info!("Writer shutting down, grace period {:?}", self.shutdown_grace);
                }
                record = self.rx.recv() => match record {
                    Some(record) => {
                        let batch = self.fill_batch(record);
                        self.process(batch, deadline).await;
                    }
                    None => break,
                },
            }
        }

        info!("Writer stopped");
    }

    /// Take whatever is already queued behind `first`
    fn fill_batch(&mut self, first: TelemetryRecord) -> Vec<TelemetryRecord> {
        let mut batch = vec![first];
        while batch.len() < self.batch_max {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        batch
    }

    async fn process(&self, batch: Vec<TelemetryRecord>, deadline: Option<Instant>) {
        let timeout = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    debug!("Grace period over, spooling {} records", batch.len());
                    self.spool(batch, 0).await;
                    return;
                }
                left.min(self.timeout)
            }
            None => self.timeout,
        };

        if let Some(hold) = self.ctx.gate.remaining() {
            debug!("Auth hold active for {:?}, spooling {} records", hold, batch.len());
            self.spool(batch, 0).await;
            return;
        }

        let result = {
            let _in_flight = self.ctx.live.begin();
            match tokio::time::timeout(timeout, self.ctx.sink.write(&batch)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout),
            }
        };

        match result {
            Ok(()) => {
                self.ctx.metrics.delivered(PATH_LIVE, batch.len());
                self.ctx.live.notify_success();
                self.ctx.gate.clear();
                self.ctx
                    .health
                    .good(Subsystem::Sink, format!("delivered {} records", batch.len()));
            }
            Err(e) => {
                self.ctx
                    .metrics
                    .delivery_failures
                    .with_label_values(&[PATH_LIVE, e.kind()])
                    .inc();

                if e.is_auth() {
                    warn!(
                        "Sink rejected credentials ({}), holding deliveries for {:?}",
                        e, self.auth_backoff
                    );
                    self.ctx.gate.hold(self.auth_backoff);
                    self.ctx.health.bad(Subsystem::Sink, "sink misconfigured");
                } else {
                    warn!("Live delivery of {} records failed: {}", batch.len(), e);
                    self.ctx.health.bad(Subsystem::Sink, e.to_string());
                }
                self.spool(batch, 1).await;
            }
        }
    }

    async fn spool(&self, batch: Vec<TelemetryRecord>, attempts: u32) {
        let count = batch.len();
        let results = self
            .ctx
            .with_spool(move |spool| {
                Ok(batch
                    .into_iter()
                    .map(|record| {
                        let result = spool.enqueue(&record, attempts);
                        (record, result)
                    })
                    .collect::<Vec<_>>())
            })
            .await;
        let results = match results {
            Ok(results) => results,
            Err(e) => {
                self.ctx.metrics.dropped("spool_error", count as u64);
                error!("Failed to spool {} records: {}", count, e);
                self.ctx.health.bad(Subsystem::Spool, e.to_string());
                return;
            }
        };

        for (record, result) in results {
            match result {
                Ok(_) => {}
                Err(SpoolerError::SpoolFull(reason)) => {
                    self.ctx.metrics.dropped("spool_full", 1);
                    warn!(
                        "Dropping {} #{}: {}",
                        record.measurement(),
                        record.sequence(),
                        reason
                    );
                    self.ctx.health.bad(Subsystem::Spool, "spool full");
                }
                Err(e) => {
                    self.ctx.metrics.dropped("spool_error", 1);
                    error!(
                        "Failed to spool {} #{}: {}",
                        record.measurement(),
                        record.sequence(),
                        e
                    );
                    self.ctx.health.bad(Subsystem::Spool, e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpoolConfig;
    use crate::health::{HealthReporter, Observation};
    use crate::sink::mocks::MockSink;
    use crate::spool::segment::HEADER_LEN;
    use crate::spool::SpoolQueue;
    use crate::telemetry::metrics::Metrics;
    use crate::telemetry::record::FieldValue;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::mpsc::Receiver;

    fn record(seq: u64) -> TelemetryRecord {
        let mut fields = BTreeMap::new();
        fields.insert("satellites_used".to_string(), FieldValue::Integer(9));
        TelemetryRecord::new(
            "gnss_sky",
            "gpsd",
            seq,
            Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
            BTreeMap::new(),
            fields,
        )
    }

    struct Harness {
        writer: Writer,
        handle: WriterHandle,
        ctx: DeliveryContext,
        observations: Receiver<Observation>,
    }

    /// Writer whose context shares one metrics registry with its spool
    fn harness(sink: &MockSink, dir: &Path, capacity_bytes: u64, batch_max: usize) -> Harness {
        let metrics = Arc::new(Metrics::new().unwrap());
        let spool_config = SpoolConfig {
            dir: dir.to_path_buf(),
            capacity_bytes,
            segment_bytes: capacity_bytes.min(1_000_000),
            fsync: false,
        };
        let spool = Arc::new(SpoolQueue::open(&spool_config, metrics.clone()).unwrap());
        let (health, observations) = HealthReporter::channel(4096);
        let ctx = DeliveryContext::new(Arc::new(sink.clone()), spool, health, metrics);
        let writer_config = WriterConfig {
            queue_depth: 1024,
            auth_backoff_s: 60,
            shutdown_grace_ms: 1000,
        };
        let sink_config = SinkConfig {
            url: "http://127.0.0.1:8086".to_string(),
            token: "t".to_string(),
            org: "o".to_string(),
            bucket: "b".to_string(),
            auth_scheme: "Token".to_string(),
            timeout_ms: 2000,
            batch_max,
        };
        let (writer, handle) = Writer::new(&writer_config, &sink_config, ctx.clone());
        Harness {
            writer,
            handle,
            ctx,
            observations,
        }
    }

    fn spooled(queue: &SpoolQueue) -> Vec<(u64, u32)> {
        let mut out = Vec::new();
        while let Some(entry) = queue.peek().unwrap() {
            out.push((entry.record.sequence(), entry.attempts));
            queue.begin_attempt(&entry.id).unwrap();
            queue.ack(&entry.id).unwrap();
        }
        out
    }

    #[tokio::test]
    async fn test_queued_records_go_out_as_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MockSink::new();
        let h = harness(&sink, dir.path(), 10_000_000, 500);
        let (_tx, rx) = watch::channel(false);

        for seq in 1..=3 {
            h.handle.submit(record(seq)).await.unwrap();
        }
        drop(h.handle);
        h.writer.run(rx).await;

        assert_eq!(sink.call_count(), 1);
        assert_eq!(sink.delivered_sequences(), vec![1, 2, 3]);
        assert_eq!(
            h.ctx.metrics.records_delivered.with_label_values(&["live"]).get(),
            3
        );
        assert_eq!(h.ctx.spool.pending_entries(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_spools_with_one_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MockSink::new();
        sink.set_failure(Some(DeliveryError::Http { status: 503 }));
        let mut h = harness(&sink, dir.path(), 10_000_000, 500);
        let (_tx, rx) = watch::channel(false);

        h.handle.submit(record(1)).await.unwrap();
        h.handle.submit(record(2)).await.unwrap();
        drop(h.handle);
        h.writer.run(rx).await;

        assert_eq!(spooled(&h.ctx.spool), vec![(1, 1), (2, 1)]);
        assert!(!h.ctx.gate.is_held());
        assert_eq!(
            h.ctx
                .metrics
                .delivery_failures
                .with_label_values(&["live", "http_5xx"])
                .get(),
            1
        );

        let observation = h.observations.try_recv().unwrap();
        assert_eq!(observation.subsystem, Subsystem::Sink);
        assert!(!observation.ok);
    }

    #[tokio::test]
    async fn test_full_spool_drops_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let capacity = HEADER_LEN + SpoolQueue::framed_len(&record(1), 1).unwrap();
        let sink = MockSink::new();
        sink.set_failure(Some(DeliveryError::Connect("refused".into())));
        let h = harness(&sink, dir.path(), capacity, 500);
        let (_tx, rx) = watch::channel(false);

        h.handle.submit(record(1)).await.unwrap();
        h.handle.submit(record(2)).await.unwrap();
        drop(h.handle);
        h.writer.run(rx).await;

        let metrics = &h.ctx.metrics;
        assert_eq!(metrics.records_spooled.get(), 1);
        assert_eq!(
            metrics.records_dropped.with_label_values(&["spool_full"]).get(),
            1
        );
        assert!(h.ctx.spool.resident_bytes() <= capacity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_holds_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MockSink::new();
        sink.set_failure(Some(DeliveryError::Auth { status: 403 }));
        let h = harness(&sink, dir.path(), 1_000_000_000, 500);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = h.ctx.metrics.clone();
        let mut observations = h.observations;
        let task = tokio::spawn(h.writer.run(shutdown_rx));

        let start = Instant::now();
        let mut recovered_at = None;
        for seq in 0..720u64 {
            if seq == 570 {
                sink.set_failure(None);
                recovered_at = Some(Instant::now());
            }
            h.handle.submit(record(seq)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        drop(h.handle);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let calls = sink.calls();
        let failing: Vec<_> = calls.iter().filter(|c| !c.accepted).collect();
        assert_eq!(failing.len(), 10);
        for pair in failing.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_secs(60));
        }
        assert!(failing[0].at - start < Duration::from_secs(1));

        let first_success = calls.iter().find(|c| c.accepted).unwrap();
        let recovered_at = recovered_at.unwrap();
        assert!(first_success.at >= recovered_at);
        assert!(first_success.at - recovered_at <= Duration::from_secs(61));

        // Every record was either delivered live or spooled
        assert_eq!(
            metrics.records_delivered.with_label_values(&["live"]).get()
                + metrics.records_spooled.get(),
            720
        );

        let mut misconfigured = false;
        while let Ok(observation) = observations.try_recv() {
            misconfigured |= observation.detail == "sink misconfigured";
        }
        assert!(misconfigured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_grace_then_spool() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MockSink::new();
        sink.set_delay(Duration::from_secs(10));
        let h = harness(&sink, dir.path(), 10_000_000, 1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for seq in 1..=3 {
            h.handle.submit(record(seq)).await.unwrap();
        }
        drop(h.handle);
        shutdown_tx.send(true).unwrap();

        let started = Instant::now();
        h.writer.run(shutdown_rx).await;

        // One attempt cut short by the grace period, the rest never tried
        assert!(started.elapsed() <= Duration::from_millis(1100));
        assert_eq!(spooled(&h.ctx.spool), vec![(1, 1), (2, 0), (3, 0)]);
        assert_eq!(sink.delivered_sequences(), Vec::<u64>::new());
    }

    #[tokio::test]
    async fn test_submit_after_writer_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MockSink::new();
        let h = harness(&sink, dir.path(), 10_000_000, 500);
        drop(h.writer);

        let err = h.handle.submit(record(1)).await.unwrap_err();
        assert!(matches!(err, SpoolerError::Closed("writer")));
    }
}
