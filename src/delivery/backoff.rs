//! Exponential backoff with jitter for drain retries.

use rand::Rng;
use std::time::Duration;

use crate::config::DrainConfig;

/// Backoff schedule: `base * 2^(retries - 1)`, capped at `max`, then ±jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter: f64,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, jitter: f64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &DrainConfig) -> Self {
        Self::new(config.backoff_base_ms, config.backoff_max_ms, config.backoff_jitter)
    }

    /// Delay before the next attempt after `retries` failed ones, without jitter
    pub fn ceiling(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(32) as i32;
        let ms = (self.base_ms as f64 * 2f64.powi(exponent)).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Jittered delay before the next attempt
    pub fn delay(&self, retries: u32) -> Duration {
        let ceiling = self.ceiling(retries).as_millis() as f64;
        let range = ceiling * self.jitter;
        let jitter = if range > 0.0 {
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_millis((ceiling + jitter).max(0.0) as u64)
    }
}
