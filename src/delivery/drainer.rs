//! # Backlog Drainer
//!
//! Redelivers spooled entries one at a time, in FIFO order, without
//! competing with the live path:
//! - never sends while a live delivery is in flight
//! - never exceeds the token bucket rate
//! - never advances past an entry that failed; it backs off and retries it
//!
//! A 401/403 sets the shared auth hold, so a misconfigured sink is retried
//! at the auth backoff cadence even when no live traffic flows.

use std::slice;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::rate::TokenBucket;
use super::DeliveryContext;
use crate::config::{DrainConfig, SinkConfig};
use crate::health::Subsystem;
use crate::shutdown::stopped;
use crate::sink::DeliveryError;
use crate::spool::SpoolEntry;
use crate::telemetry::metrics::PATH_DRAIN;

/// Spool backlog delivery task
pub struct Drainer {
    ctx: DeliveryContext,
    bucket: TokenBucket,
    backoff: Backoff,
    timeout: Duration,
    idle_poll: Duration,
    auth_backoff: Duration,
}

impl Drainer {
    /// `auth_backoff` is how long deliveries are held after a 401/403
    pub fn new(
        drain: &DrainConfig,
        sink: &SinkConfig,
        auth_backoff: Duration,
        ctx: DeliveryContext,
    ) -> Self {
        Self {
            ctx,
            bucket: TokenBucket::new(drain.rate_per_sec, drain.burst),
            backoff: Backoff::from_config(drain),
            timeout: sink.timeout(),
            idle_poll: Duration::from_millis(drain.idle_poll_ms.max(1)),
            auth_backoff,
        }
    }

    /// Run until shutdown, then checkpoint the cursor
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Drainer started ({} entries pending)",
            self.ctx.spool.pending_entries()
        );

        // A head that already failed before the restart waits its backoff first
        if let Ok(Some(head)) = self.ctx.with_spool(|spool| spool.peek()).await {
            if head.retries > 0 {
                let delay = self.backoff.delay(head.retries);
                info!(
                    "Head entry has {} failed attempts, waiting {:?} before retrying",
                    head.retries, delay
                );
                self.pause(delay, true, &mut shutdown).await;
            }
        }

        while !*shutdown.borrow() {
            if !self.step(&mut shutdown).await {
                break;
            }
        }

        match self.ctx.with_spool(|spool| spool.checkpoint()).await {
            Ok(()) => info!("Drainer stopped"),
            Err(e) => error!("Failed to checkpoint spool cursor: {}", e),
        }
    }

    /// One pass of the drain loop; false once shutdown was observed
    async fn step(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if let Some(hold) = self.ctx.gate.remaining() {
            debug!("Auth hold active, drainer waiting {:?}", hold);
            // A live success clears the hold
            return self.pause(hold, true, shutdown).await;
        }

        let entry = match self.ctx.with_spool(|spool| spool.peek()).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return tokio::select! {
                    _ = self.ctx.spool.wait_for_entries() => true,
                    _ = tokio::time::sleep(self.idle_poll) => true,
                    _ = stopped(shutdown) => false,
                };
            }
            Err(e) => {
                error!("Failed to read spool head: {}", e);
                return self.pause(self.idle_poll, false, shutdown).await;
            }
        };

        tokio::select! {
            _ = async {
                self.ctx.live.wait_idle().await;
                self.bucket.acquire().await;
            } => {}
            _ = stopped(shutdown) => return false,
        }

        // The writer may have hit an auth failure while we waited
        if self.ctx.gate.is_held() {
            return true;
        }

        self.deliver(entry, shutdown).await
    }

    async fn deliver(&self, entry: SpoolEntry, shutdown: &mut watch::Receiver<bool>) -> bool {
        let id = entry.id;
        let retries = match self.ctx.with_spool(move |spool| spool.begin_attempt(&id)).await {
            Ok(retries) => retries,
            Err(e) => {
                debug!("Spool head moved before redelivery: {}", e);
                return true;
            }
        };

        let result = match tokio::time::timeout(
            self.timeout,
            self.ctx.sink.write(slice::from_ref(&entry.record)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.ctx.with_spool(move |spool| spool.ack(&id)).await {
                    // Evicted while in flight; already counted as dropped
                    debug!("Acknowledged entry is gone: {}", e);
                    return true;
                }
                self.ctx.metrics.delivered(PATH_DRAIN, 1);
                self.ctx.health.good(Subsystem::Sink, "backlog entry delivered");
                true
            }
            Err(e) => {
                self.ctx
                    .metrics
                    .delivery_failures
                    .with_label_values(&[PATH_DRAIN, e.kind()])
                    .inc();
                if let Err(err) = self
                    .ctx
                    .with_spool(move |spool| spool.record_failure(&id))
                    .await
                {
                    debug!("Failed entry is gone: {}", err);
                }

                if e.is_auth() {
                    warn!(
                        "Sink rejected credentials during redelivery ({}), holding deliveries for {:?}",
                        e, self.auth_backoff
                    );
                    self.ctx.gate.hold(self.auth_backoff);
                    self.ctx.health.bad(Subsystem::Sink, "sink misconfigured");
                    return true;
                }
                self.ctx.health.bad(Subsystem::Sink, e.to_string());

                let delay = self.backoff.delay(retries);
                warn!(
                    "Redelivery of {} #{} failed (attempt {}): {}; retrying in {:?}",
                    entry.record.measurement(),
                    entry.record.sequence(),
                    retries,
                    e,
                    delay
                );
                self.pause(delay, true, shutdown).await
            }
        }
    }

    /// Sleep for `delay`; false if shutdown arrived first
    ///
    /// With `wake_on_success`, a successful live delivery ends the sleep
    /// early since the sink is evidently back.
    async fn pause(
        &self,
        delay: Duration,
        wake_on_success: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.ctx.live.success(), if wake_on_success => {
                debug!("Live delivery succeeded, retrying backlog now");
                true
            }
            _ = stopped(shutdown) => false,
        }
    }
}
