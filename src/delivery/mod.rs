//! # Delivery Module
//!
//! The two paths a record can take to the remote sink.
//!
//! This module handles:
//! - Live delivery with fallback to the spool ([`writer`])
//! - Throttled redelivery of the spool backlog ([`drainer`])
//! - The auth hold shared by both paths ([`SinkGate`])
//! - Live-path activity signalling so the drainer yields ([`LiveSignal`])

pub mod backoff;
pub mod drainer;
pub mod rate;
pub mod writer;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Result, SpoolerError};
use crate::health::HealthReporter;
use crate::sink::Sink;
use crate::spool::SpoolQueue;
use crate::telemetry::metrics::Metrics;

pub use drainer::Drainer;
pub use writer::{Writer, WriterHandle};

/// State shared by the writer and the drainer
#[derive(Clone)]
pub struct DeliveryContext {
    pub sink: Arc<dyn Sink>,
    pub spool: Arc<SpoolQueue>,
    pub gate: Arc<SinkGate>,
    pub live: Arc<LiveSignal>,
    pub health: HealthReporter,
    pub metrics: Arc<Metrics>,
}

impl DeliveryContext {
    pub fn new(
        sink: Arc<dyn Sink>,
        spool: Arc<SpoolQueue>,
        health: HealthReporter,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sink,
            spool,
            gate: Arc::new(SinkGate::new()),
            live: Arc::new(LiveSignal::new()),
            health,
            metrics,
        }
    }

    /// Run a spool operation on the blocking pool
    ///
    /// Segment appends and cursor saves hit the disk, possibly with fsync,
    /// so they stay off the async workers.
    pub async fn with_spool<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&SpoolQueue) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let spool = self.spool.clone();
        tokio::task::spawn_blocking(move || op(&spool))
            .await
            .map_err(|e| SpoolerError::Spool(format!("spool task failed: {}", e)))?
    }
}

/// Auth hold: no delivery is attempted until it expires
#[derive(Debug, Default)]
pub struct SinkGate {
    hold_until: Mutex<Option<Instant>>,
}

impl SinkGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block deliveries for `duration` from now
    pub fn hold(&self, duration: Duration) {
        *self.lock() = Some(Instant::now() + duration);
    }

    /// Time left on the hold, if one is active
    pub fn remaining(&self) -> Option<Duration> {
        let mut hold = self.lock();
        match *hold {
            Some(until) if until > Instant::now() => Some(until - Instant::now()),
            Some(_) => {
                *hold = None;
                None
            }
            None => None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.remaining().is_some()
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.hold_until.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Live-path activity shared with the drainer
#[derive(Debug, Default)]
pub struct LiveSignal {
    in_flight: AtomicUsize,
    idle: Notify,
    success: Notify,
}

/// Marks a live delivery as in flight until dropped
#[derive(Debug)]
pub struct InFlight<'a> {
    signal: &'a LiveSignal,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.signal.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.signal.idle.notify_waiters();
        }
    }
}

impl LiveSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a live delivery as started
    pub fn begin(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight { signal: self }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Wait until no live delivery is in flight
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if !self.is_busy() {
                return;
            }
            idle.await;
        }
    }

    /// Announce a successful live delivery
    pub fn notify_success(&self) {
        self.success.notify_waiters();
    }

    /// Wait for the next successful live delivery
    pub async fn success(&self) {
        self.success.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpoolConfig;
    use crate::sink::mocks::MockSink;

    fn context(dir: &std::path::Path) -> DeliveryContext {
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = SpoolConfig {
            dir: dir.to_path_buf(),
            capacity_bytes: 1 << 20,
            segment_bytes: 64 << 10,
            fsync: false,
        };
        let spool = Arc::new(SpoolQueue::open(&config, metrics.clone()).unwrap());
        let (health, _observations) = HealthReporter::channel(16);
        DeliveryContext::new(Arc::new(MockSink::new()), spool, health, metrics)
    }

    #[tokio::test]
    async fn test_spool_operations_run_off_the_runtime_thread() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let runtime_thread = std::thread::current().id();
        let spool_thread = ctx
            .with_spool(|_| Ok(std::thread::current().id()))
            .await
            .unwrap();
        assert_ne!(spool_thread, runtime_thread);

        let pending = ctx.with_spool(|spool| Ok(spool.pending_entries())).await;
        assert_eq!(pending.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spool_operation_panic_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let result: Result<()> = ctx.with_spool(|_| panic!("disk on fire")).await;
        assert!(matches!(result, Err(SpoolerError::Spool(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_hold_expires() {
        let gate = SinkGate::new();
        assert!(!gate.is_held());

        gate.hold(Duration::from_secs(60));
        assert!(gate.is_held());
        assert_eq!(gate.remaining(), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(gate.remaining(), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!gate.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_clear() {
        let gate = SinkGate::new();
        gate.hold(Duration::from_secs(60));
        gate.clear();
        assert_eq!(gate.remaining(), None);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_when_delivery_finishes() {
        let signal = Arc::new(LiveSignal::new());
        let guard_signal = signal.clone();

        let guard = guard_signal.begin();
        assert!(signal.is_busy());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!signal.is_busy());
    }

    #[tokio::test]
    async fn test_success_wakes_waiter() {
        let signal = Arc::new(LiveSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.success().await })
        };
        tokio::task::yield_now().await;

        signal.notify_success();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
