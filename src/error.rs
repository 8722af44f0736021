//! # Error Types
//!
//! Custom error types for the GNSS spooler using `thiserror`.

use std::path::PathBuf;

use thiserror::Error;

use crate::sink::DeliveryError;
use crate::telemetry::normalizer::ValidationError;

/// Process exit code for configuration faults
pub const EXIT_CONFIG: i32 = 2;

/// Process exit code when the spool directory cannot be opened or recovered
pub const EXIT_SPOOL: i32 = 3;

/// Process exit code when required resources (listener, runtime) cannot be bound
pub const EXIT_RESOURCES: i32 = 4;

/// Main error type for the GNSS spooler
#[derive(Debug, Error)]
pub enum SpoolerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The spool directory could not be created or opened at startup
    #[error("Spool directory {path:?} unavailable: {source}")]
    SpoolInit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The spool has no room left even after evicting every closed segment
    #[error("Spool full: {0}")]
    SpoolFull(String),

    /// Spool bookkeeping errors (stale entry ids, bad cursor state)
    #[error("Spool error: {0}")]
    Spool(String),

    /// Corrupt on-disk data
    #[error("Corrupt spool data: {0}")]
    Corrupt(String),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed telemetry sample
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Remote sink delivery errors
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Status listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A task's input channel was closed during shutdown
    #[error("{0} is no longer accepting records")]
    Closed(&'static str),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl SpoolerError {
    /// Exit code reported to the service manager when this error aborts startup
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            Self::SpoolInit { .. } | Self::Corrupt(_) => EXIT_SPOOL,
            Self::Bind { .. } | Self::Metrics(_) => EXIT_RESOURCES,
            _ => 1,
        }
    }
}

/// Result type alias for the GNSS spooler
pub type Result<T> = std::result::Result<T, SpoolerError>;
