//! # Remote Sink Module
//!
//! Abstraction over the remote time-series database.
//!
//! The writer and drainer only see the [`Sink`] trait; the InfluxDB v2
//! implementation lives in [`http`]. Failures are classified so callers can
//! tell an authentication problem (slow retry, surfaced as a
//! configuration fault) from a transient one (fast retry with backoff).

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::telemetry::record::TelemetryRecord;

pub use http::InfluxSink;

/// Failure of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("delivery timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("sink returned HTTP {status}")]
    Http { status: u16 },

    #[error("sink rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl DeliveryError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => DeliveryError::Auth { status },
            _ => DeliveryError::Http { status },
        }
    }

    /// Credentials or permissions are wrong; retrying soon will not help
    pub fn is_auth(&self) -> bool {
        matches!(self, DeliveryError::Auth { .. })
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Timeout => "timeout",
            DeliveryError::Connect(_) => "connect",
            DeliveryError::Http { status } if *status >= 500 => "http_5xx",
            DeliveryError::Http { .. } => "http_4xx",
            DeliveryError::Auth { .. } => "auth",
            DeliveryError::Encode(_) => "encode",
        }
    }
}

/// Destination for telemetry records
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver a batch; succeeds only if the whole batch was accepted
    async fn write(&self, records: &[TelemetryRecord]) -> Result<(), DeliveryError>;

    /// Drop cached connections so the next write starts fresh
    async fn reset(&self) {}
}
