//! # GNSS Spooler Library
//!
//! Durable telemetry spooler for an unattended GNSS/PTP timing node.
//!
//! Samples from gpsd and chrony are normalized into line-protocol records
//! and written straight to a remote InfluxDB. When the sink is unreachable,
//! records land in a disk-backed spool that survives restarts and is
//! drained, throttled, once the sink is back. A health monitor tracks every
//! subsystem and escalates from service restarts to a rate-limited reboot.

pub mod config;
pub mod daemon;
pub mod delivery;
pub mod error;
pub mod health;
pub mod shutdown;
pub mod sink;
pub mod sources;
pub mod spool;
pub mod status;
pub mod telemetry;
