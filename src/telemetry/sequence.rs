//! # Sequence Reservations
//!
//! Per-source high-water marks for sequence numbers, persisted as
//! `sequence.json` in the spool directory.
//!
//! The normalizer reserves numbers in blocks of [`RESERVATION`] and writes
//! the end of each block before issuing from it. A restarted process starts
//! above the last reservation even when the wall clock has stepped back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;

/// Reservation file name inside the spool directory
pub const SEQUENCE_FILE: &str = "sequence.json";

/// Numbers reserved per write
pub const RESERVATION: u64 = 10_000;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Reservations {
    sources: BTreeMap<String, u64>,
}

/// Persistent per-source sequence reservations
#[derive(Debug)]
pub struct SequenceStore {
    path: PathBuf,
    tmp_path: PathBuf,
    reserved: Reservations,
}

impl SequenceStore {
    /// Load reservations from `dir`
    ///
    /// A missing or unreadable file starts empty; the time-based seed is
    /// then the only floor.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(SEQUENCE_FILE);
        let reserved = match fs::read(&path) {
            Ok(contents) => serde_json::from_slice(&contents).unwrap_or_else(|e| {
                warn!("Sequence file {:?} is unreadable ({}), ignoring it", path, e);
                Reservations::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Reservations::default(),
            Err(e) => {
                warn!("Failed to read sequence file {:?}: {}", path, e);
                Reservations::default()
            }
        };

        Self {
            tmp_path: dir.join(format!("{}.tmp", SEQUENCE_FILE)),
            path,
            reserved,
        }
    }

    /// Highest number that may already have been issued for `source`
    pub fn reserved(&self, source: &str) -> Option<u64> {
        self.reserved.sources.get(source).copied()
    }

    /// Raise the reservation for `source` to `upto` and persist it
    ///
    /// The in-memory reservation moves even when the write fails, so a
    /// broken disk is reported once per block rather than once per record.
    pub fn reserve(&mut self, source: &str, upto: u64) -> Result<()> {
        self.reserved.sources.insert(source.to_string(), upto);
        self.save()
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.reserved)?;
        {
            let mut file = File::create(&self.tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}
