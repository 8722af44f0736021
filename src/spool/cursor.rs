//! # Spool Cursor
//!
//! Read position of the drainer plus the delivery state of the head entry,
//! persisted as `cursor.json` in the spool directory.
//!
//! Writes go to `cursor.json.tmp`, are flushed, then renamed over the old
//! file, so a crash leaves either the previous or the new cursor on disk.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;

/// Cursor file name inside the spool directory
pub const CURSOR_FILE: &str = "cursor.json";

/// Delivery state of the entry under the cursor
///
/// Delivered entries have no state of their own: acknowledging an entry
/// moves the cursor past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntryState {
    Pending { retries: u32 },
    InFlight { retries: u32 },
}

impl EntryState {
    pub fn retries(&self) -> u32 {
        match *self {
            EntryState::Pending { retries } | EntryState::InFlight { retries } => retries,
        }
    }
}

impl Default for EntryState {
    fn default() -> Self {
        EntryState::Pending { retries: 0 }
    }
}

/// Head position of the spool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub segment_id: u64,
    /// Byte offset within the segment's entry area
    pub offset: u64,
    /// Number of entries of this segment already consumed
    pub index: u32,
    #[serde(flatten)]
    pub state: EntryState,
}

impl Cursor {
    /// Cursor at the first entry of a segment
    pub fn start_of(segment_id: u64) -> Self {
        Self {
            segment_id,
            offset: 0,
            index: 0,
            state: EntryState::default(),
        }
    }
}

/// Atomic persistence for the cursor file
#[derive(Debug)]
pub struct CursorStore {
    dir: PathBuf,
    path: PathBuf,
    tmp_path: PathBuf,
    fsync: bool,
}

impl CursorStore {
    pub fn new(dir: &Path, fsync: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            path: dir.join(CURSOR_FILE),
            tmp_path: dir.join(format!("{}.tmp", CURSOR_FILE)),
            fsync,
        }
    }

    /// Load the persisted cursor
    ///
    /// A missing file yields `None`. An unreadable one is logged and also
    /// yields `None`, which restarts draining at the oldest segment.
    pub fn load(&self) -> Result<Option<Cursor>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&contents) {
            Ok(cursor) => Ok(Some(cursor)),
            Err(e) => {
                warn!(
                    "Cursor file {:?} is unreadable ({}), restarting from the oldest segment",
                    self.path, e
                );
                Ok(None)
            }
        }
    }

    /// Persist the cursor with write-to-temp, flush, rename
    pub fn save(&self, cursor: &Cursor) -> Result<()> {
        let data = serde_json::to_vec(cursor)?;

        {
            let mut file = File::create(&self.tmp_path)?;
            file.write_all(&data)?;
            if self.fsync {
                file.sync_all()?;
            }
        }

        fs::rename(&self.tmp_path, &self.path)?;

        if self.fsync {
            File::open(&self.dir)?.sync_all()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cursor_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path(), true);
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path(), true);
        let cursor = Cursor {
            segment_id: 12,
            offset: 4096,
            index: 31,
            state: EntryState::InFlight { retries: 4 },
        };

        store.save(&cursor).unwrap();
        assert_eq!(store.load().unwrap(), Some(cursor));
        assert!(!dir.path().join("cursor.json.tmp").exists());
    }

    #[test]
    fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path(), false);
        store
            .save(&Cursor {
                segment_id: 2,
                offset: 10,
                index: 1,
                state: EntryState::Pending { retries: 0 },
            })
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(CURSOR_FILE)).unwrap()).unwrap();
        assert_eq!(value["segment_id"], 2);
        assert_eq!(value["offset"], 10);
        assert_eq!(value["index"], 1);
        assert_eq!(value["state"], "pending");
        assert_eq!(value["retries"], 0);
    }

    #[test]
    fn test_garbage_cursor_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CURSOR_FILE), b"{\"segment_id\":").unwrap();
        let store = CursorStore::new(dir.path(), false);
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_entry_state_retries() {
        assert_eq!(EntryState::default(), EntryState::Pending { retries: 0 });
        assert_eq!(EntryState::InFlight { retries: 3 }.retries(), 3);
    }
}
