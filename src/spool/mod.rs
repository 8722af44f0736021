//! # Spool Module
//!
//! Disk-backed FIFO for records the live path could not deliver.
//!
//! This module handles:
//! - Segment files with checksummed, length-prefixed frames
//! - Capacity enforcement by evicting the oldest closed segments
//! - The persisted head cursor and per-entry retry counter
//! - Crash recovery (torn writes, corrupt frames, stale segments)

pub mod crc;
pub mod cursor;
pub mod queue;
pub mod segment;

use chrono::{DateTime, Utc};

use crate::telemetry::record::TelemetryRecord;

pub use cursor::EntryState;
pub use queue::SpoolQueue;

/// Address of an entry inside the spool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    pub segment_id: u64,
    /// Byte offset within the segment's entry area
    pub offset: u64,
    /// Frame length in bytes
    pub len: u64,
}

/// A spooled record as handed to the drainer
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolEntry {
    pub id: EntryId,
    pub record: TelemetryRecord,
    pub enqueued_at: DateTime<Utc>,
    /// Live delivery attempts before spooling
    pub attempts: u32,
    /// Drain attempts so far, persisted across restarts
    pub retries: u32,
    /// CRC-32 of the stored payload
    pub checksum: u32,
}
