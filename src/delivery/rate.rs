//! Token bucket limiting the drain rate.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// One token in scaled units
const TOKEN: u64 = 1000;

/// Token bucket with fractional refill rates
///
/// Tokens are stored scaled by 1000 so rates like 0.5/s refill smoothly.
/// The bucket starts full.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    /// Refill rate in thousandths of a token per second
    rate_milli: u64,
    burst: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = u64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: burst * TOKEN,
                last_refill: Instant::now(),
            }),
            rate_milli: ((rate_per_sec * 1000.0).round() as u64).max(1),
            burst,
        }
    }

    /// Take a token, or report how long until one is available
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let now = Instant::now();
        let elapsed_us = now.duration_since(state.last_refill).as_micros() as u64;
        let added = elapsed_us.saturating_mul(self.rate_milli) / 1_000_000;
        if added > 0 {
            state.tokens = (state.tokens + added).min(self.burst * TOKEN);
            state.last_refill = now;
        }

        if state.tokens < TOKEN {
            let deficit = TOKEN - state.tokens;
            let wait_us = (deficit * 1_000_000).div_ceil(self.rate_milli);
            return Err(Duration::from_micros(wait_us.max(1)));
        }

        state.tokens -= TOKEN;
        Ok(())
    }

    /// Wait for a token
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Whole tokens currently available
    pub fn available(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.tokens / TOKEN
    }
}
