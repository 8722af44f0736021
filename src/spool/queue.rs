//! # Spool Queue
//!
//! Durable, capacity-bounded FIFO of telemetry records spread over segment
//! files. The writer appends at the tail, the drainer reads at the head.
//!
//! All segment-table changes happen under one mutex. The resident byte
//! count is mirrored in an atomic so health sampling never takes the lock.

use chrono::Utc;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::cursor::{Cursor, CursorStore, EntryState};
use super::segment::{
    create_segment, encode_entry, read_frame_at, scan_entries, segment_path, write_header,
    FrameRead, SegmentHeader, StoredEntry, HEADER_LEN,
};
use super::{EntryId, SpoolEntry};
use crate::config::SpoolConfig;
use crate::error::{Result, SpoolerError};
use crate::telemetry::metrics::Metrics;
use crate::telemetry::record::TelemetryRecord;

/// In-memory view of one segment file
#[derive(Debug, Clone)]
struct SegmentMeta {
    id: u64,
    path: PathBuf,
    /// Entry area length
    len: u64,
    entry_count: u32,
    /// Unconsumed entries never attempted by the live path
    unattempted: u32,
}

impl SegmentMeta {
    fn file_len(&self) -> u64 {
        HEADER_LEN + self.len
    }
}

/// Tail segment; its file is created by the first append
#[derive(Debug)]
struct ActiveSegment {
    meta: SegmentMeta,
    file: Option<File>,
}

impl ActiveSegment {
    fn new(dir: &Path, id: u64) -> Self {
        Self {
            meta: SegmentMeta {
                id,
                path: segment_path(dir, id),
                len: 0,
                entry_count: 0,
                unattempted: 0,
            },
            file: None,
        }
    }
}

/// Head entry as last returned by `peek`
#[derive(Debug, Clone, Copy)]
struct HeadInfo {
    id: EntryId,
    attempts: u32,
}

#[derive(Debug)]
struct SpoolInner {
    closed: VecDeque<SegmentMeta>,
    active: ActiveSegment,
    cursor: Cursor,
    cursor_store: CursorStore,
    next_segment_id: u64,
    head: Option<HeadInfo>,
}

/// Disk-backed spool queue
#[derive(Debug)]
pub struct SpoolQueue {
    dir: PathBuf,
    capacity: u64,
    segment_bytes: u64,
    fsync: bool,
    resident_bytes: AtomicU64,
    inner: Mutex<SpoolInner>,
    available: Notify,
    metrics: Arc<Metrics>,
}

impl SpoolQueue {
    /// Open the spool directory and recover its contents
    ///
    /// # Errors
    ///
    /// Returns [`SpoolerError::SpoolInit`] if the directory cannot be
    /// created or listed. Corrupt data is repaired, not reported.
    pub fn open(config: &SpoolConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let dir = config.dir.clone();
        fs::create_dir_all(&dir).map_err(|source| SpoolerError::SpoolInit {
            path: dir.clone(),
            source,
        })?;

        let recovered = recover(&dir, config.fsync, &metrics)?;

        let resident: u64 = recovered.closed.iter().map(SegmentMeta::file_len).sum();

        let queue = Self {
            dir,
            capacity: config.capacity_bytes,
            segment_bytes: config.segment_bytes,
            fsync: config.fsync,
            resident_bytes: AtomicU64::new(resident),
            inner: Mutex::new(recovered),
            available: Notify::new(),
            metrics,
        };

        {
            let mut inner = queue.lock();
            // Capacity may have shrunk since the last run
            while queue.resident_bytes() > queue.capacity {
                match inner.closed.front() {
                    Some(front) if front.unattempted == 0 => queue.evict_front(&mut inner)?,
                    _ => break,
                }
            }
            queue.update_resident_gauge();

            info!(
                "Spool opened at {:?}: {} closed segments, {} pending entries, {} bytes resident",
                queue.dir,
                inner.closed.len(),
                pending_in(&inner),
                queue.resident_bytes()
            );
        }

        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, SpoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record at the tail
    ///
    /// `attempts` is the number of live delivery attempts already made
    /// (0 when spooled without trying).
    ///
    /// # Errors
    ///
    /// Returns [`SpoolerError::SpoolFull`] if the frame cannot fit even after
    /// evicting every evictable closed segment.
    pub fn enqueue(&self, record: &TelemetryRecord, attempts: u32) -> Result<EntryId> {
        let stored = StoredEntry::new(record.clone(), Utc::now(), attempts);
        let frame = encode_entry(&stored)?;
        let frame_len = frame.len() as u64;

        let mut inner = self.lock();

        let rotate = inner.active.meta.entry_count > 0
            && inner.active.meta.file_len() + frame_len > self.segment_bytes;
        let new_file = rotate || inner.active.file.is_none();
        let needed = frame_len + if new_file { HEADER_LEN } else { 0 };

        while self.resident_bytes() + needed > self.capacity {
            match inner.closed.front() {
                None => {
                    return Err(SpoolerError::SpoolFull(format!(
                        "{} bytes needed, {} of {} resident and nothing closed to evict",
                        needed,
                        self.resident_bytes(),
                        self.capacity
                    )));
                }
                Some(front) if front.unattempted > 0 => {
                    return Err(SpoolerError::SpoolFull(format!(
                        "oldest segment {} holds {} entries never attempted",
                        front.id, front.unattempted
                    )));
                }
                Some(_) => self.evict_front(&mut inner)?,
            }
        }

        if rotate {
            self.rotate(&mut inner)?;
        }

        let file = match inner.active.file.take() {
            Some(file) => file,
            None => {
                let file = create_segment(&self.dir, inner.active.meta.id, self.fsync)?;
                self.resident_bytes.fetch_add(HEADER_LEN, Ordering::SeqCst);
                file
            }
        };

        let active = &mut inner.active;
        let file = active.file.insert(file);
        let offset = active.meta.len;
        if let Err(e) = append_frame(file, &frame, self.fsync) {
            // Drop any partial frame so later appends stay aligned
            let truncated = file.set_len(HEADER_LEN + offset);
            self.abandon_partial_frame(&mut inner, truncated);
            self.update_resident_gauge();
            return Err(e.into());
        }
        active.meta.len += frame_len;
        active.meta.entry_count += 1;
        if attempts == 0 {
            active.meta.unattempted += 1;
        }

        let id = EntryId {
            segment_id: active.meta.id,
            offset,
            len: frame_len,
        };

        self.resident_bytes.fetch_add(frame_len, Ordering::SeqCst);
        self.update_resident_gauge();
        self.metrics.records_spooled.inc();
        drop(inner);

        self.available.notify_one();
        Ok(id)
    }

    /// Head entry in FIFO order, without removing it
    ///
    /// Fully consumed segments are deleted on the way. A corrupt frame
    /// discards the rest of its segment.
    pub fn peek(&self) -> Result<Option<SpoolEntry>> {
        let mut inner = self.lock();

        loop {
            let cursor = inner.cursor;
            let meta = head_segment(&inner).clone();

            if cursor.offset >= meta.len {
                if inner.closed.is_empty() {
                    if meta.entry_count == 0 {
                        inner.head = None;
                        return Ok(None);
                    }
                    // Drained active segment: seal it and start a fresh one
                    self.rotate(&mut inner)?;
                }
                self.remove_front(&mut inner)?;
                continue;
            }

            match read_frame_at(&meta.path, cursor.offset, meta.len)? {
                FrameRead::Entry {
                    entry,
                    checksum,
                    frame_len,
                } => {
                    let id = EntryId {
                        segment_id: meta.id,
                        offset: cursor.offset,
                        len: frame_len,
                    };
                    inner.head = Some(HeadInfo {
                        id,
                        attempts: entry.attempts,
                    });
                    return Ok(Some(SpoolEntry {
                        id,
                        enqueued_at: entry.enqueued_at(),
                        attempts: entry.attempts,
                        retries: cursor.state.retries(),
                        checksum,
                        record: entry.record,
                    }));
                }
                FrameRead::End => {
                    inner.cursor.offset = meta.len;
                }
                FrameRead::Corrupt(reason) => {
                    let lost = meta.entry_count.saturating_sub(cursor.index);
                    error!(
                        "Corrupt entry in segment {} at offset {}: {}; discarding {} remaining entries",
                        meta.id, cursor.offset, reason, lost
                    );
                    self.metrics.spool_corrupt_entries.inc();
                    self.metrics.dropped("corrupt", lost as u64);
                    inner.cursor.offset = meta.len;
                    inner.cursor.index = meta.entry_count;
                }
            }
        }
    }

    /// Mark the head entry as in flight and persist its retry counter
    ///
    /// Returns the new retry count. Must be called before the send.
    pub fn begin_attempt(&self, id: &EntryId) -> Result<u32> {
        let mut inner = self.lock();
        check_head(&inner, id)?;

        let retries = inner.cursor.state.retries();
        let first_try = retries == 0
            && inner
                .head
                .map_or(false, |h| h.id == *id && h.attempts == 0);
        if first_try {
            let meta = head_segment_mut(&mut inner);
            meta.unattempted = meta.unattempted.saturating_sub(1);
        }

        let retries = retries + 1;
        inner.cursor.state = EntryState::InFlight { retries };
        inner.cursor_store.save(&inner.cursor)?;
        Ok(retries)
    }

    /// Return an in-flight head entry to pending after a failed send
    pub fn record_failure(&self, id: &EntryId) -> Result<()> {
        let mut inner = self.lock();
        check_head(&inner, id)?;

        let retries = inner.cursor.state.retries();
        inner.cursor.state = EntryState::Pending { retries };
        inner.cursor_store.save(&inner.cursor)?;
        Ok(())
    }

    /// Acknowledge delivery of the head entry and advance past it
    pub fn ack(&self, id: &EntryId) -> Result<()> {
        let mut inner = self.lock();
        check_head(&inner, id)?;

        inner.cursor.offset += id.len;
        inner.cursor.index += 1;
        inner.cursor.state = EntryState::Pending { retries: 0 };
        inner.head = None;
        inner.cursor_store.save(&inner.cursor)?;
        Ok(())
    }

    /// Persist the current cursor
    pub fn checkpoint(&self) -> Result<()> {
        let inner = self.lock();
        inner.cursor_store.save(&inner.cursor)?;
        debug!("Spool cursor checkpointed at {:?}", inner.cursor);
        Ok(())
    }

    /// Bytes currently held by segment files, headers included
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::SeqCst)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    /// Resident bytes as a fraction of capacity
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.resident_bytes() as f64 / self.capacity as f64
    }

    /// Entries not yet acknowledged
    pub fn pending_entries(&self) -> u64 {
        pending_in(&self.lock())
    }

    /// Wait until an enqueue happens
    ///
    /// A notification sent while nobody waits is kept for the next caller.
    pub async fn wait_for_entries(&self) {
        self.available.notified().await;
    }

    /// Length of the frame `record` would occupy
    pub fn framed_len(record: &TelemetryRecord, attempts: u32) -> Result<u64> {
        let stored = StoredEntry::new(record.clone(), Utc::now(), attempts);
        Ok(encode_entry(&stored)?.len() as u64)
    }

    /// Seal the active segment and start a new one
    fn rotate(&self, inner: &mut SpoolInner) -> Result<()> {
        let header = SegmentHeader {
            id: inner.active.meta.id,
            sealed: true,
            byte_len: inner.active.meta.len,
            entry_count: inner.active.meta.entry_count,
            unattempted: inner.active.meta.unattempted,
        };
        write_header(&inner.active.meta.path, &header)?;

        let id = inner.next_segment_id;
        inner.next_segment_id += 1;
        let sealed = std::mem::replace(&mut inner.active, ActiveSegment::new(&self.dir, id));
        debug!(
            "Sealed segment {} ({} entries, {} bytes)",
            sealed.meta.id, sealed.meta.entry_count, sealed.meta.len
        );
        inner.closed.push_back(sealed.meta);
        Ok(())
    }

    /// Seal the active segment if a failed append could not be rolled back
    ///
    /// The sealed length excludes the partial frame, so readers never reach
    /// it and later appends start in a clean file.
    fn abandon_partial_frame(&self, inner: &mut SpoolInner, truncated: std::io::Result<()>) {
        let Err(e) = truncated else {
            return;
        };
        error!(
            "Failed to drop partial frame from segment {}: {}; sealing it",
            inner.active.meta.id, e
        );
        if let Err(e) = self.rotate(inner) {
            error!("Failed to seal segment {}: {}", inner.active.meta.id, e);
        }
    }

    /// Delete the oldest closed segment and move the cursor to the next one
    fn remove_front(&self, inner: &mut SpoolInner) -> Result<()> {
        let Some(front) = inner.closed.pop_front() else {
            return Ok(());
        };

        if let Err(e) = fs::remove_file(&front.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        self.resident_bytes.fetch_sub(front.file_len(), Ordering::SeqCst);
        self.update_resident_gauge();

        let next = inner
            .closed
            .front()
            .map(|m| m.id)
            .unwrap_or(inner.active.meta.id);
        inner.cursor = Cursor::start_of(next);
        inner.head = None;
        inner.cursor_store.save(&inner.cursor)?;

        debug!("Removed drained segment {}", front.id);
        Ok(())
    }

    /// Evict the oldest closed segment to make room, counting lost entries
    fn evict_front(&self, inner: &mut SpoolInner) -> Result<()> {
        let Some(front) = inner.closed.front() else {
            return Ok(());
        };
        let lost = if front.id == inner.cursor.segment_id {
            front.entry_count.saturating_sub(inner.cursor.index)
        } else {
            front.entry_count
        };

        warn!(
            "Spool at capacity ({} of {} bytes): evicting segment {} with {} undelivered entries",
            self.resident_bytes(),
            self.capacity,
            front.id,
            lost
        );
        self.metrics.spool_evicted_segments.inc();
        self.metrics.dropped("evicted", lost as u64);

        self.remove_front(inner)
    }

    fn update_resident_gauge(&self) {
        self.metrics
            .spool_resident_bytes
            .set(self.resident_bytes() as i64);
    }
}

fn append_frame(file: &mut File, frame: &[u8], fsync: bool) -> std::io::Result<()> {
    file.write_all(frame)?;
    if fsync {
        file.sync_data()?;
    }
    Ok(())
}

fn head_segment(inner: &SpoolInner) -> &SegmentMeta {
    inner.closed.front().unwrap_or(&inner.active.meta)
}

fn head_segment_mut(inner: &mut SpoolInner) -> &mut SegmentMeta {
    match inner.closed.front_mut() {
        Some(meta) => meta,
        None => &mut inner.active.meta,
    }
}

fn check_head(inner: &SpoolInner, id: &EntryId) -> Result<()> {
    if inner.cursor.segment_id != id.segment_id || inner.cursor.offset != id.offset {
        return Err(SpoolerError::Spool(format!(
            "entry {:?} is no longer the head (cursor at segment {} offset {})",
            id, inner.cursor.segment_id, inner.cursor.offset
        )));
    }
    Ok(())
}

fn pending_in(inner: &SpoolInner) -> u64 {
    let total: u64 = inner
        .closed
        .iter()
        .map(|m| m.entry_count as u64)
        .sum::<u64>()
        + inner.active.meta.entry_count as u64;
    total.saturating_sub(inner.cursor.index as u64)
}

/// Map an I/O failure on the spool directory itself to a startup fault
fn init_error(dir: &Path, err: SpoolerError) -> SpoolerError {
    match err {
        SpoolerError::Io(source) => SpoolerError::SpoolInit {
            path: dir.to_path_buf(),
            source,
        },
        other => other,
    }
}

/// Rebuild the segment table from disk
///
/// Only failures on the directory or the cursor file abort. A damaged
/// segment is repaired from its frames, or skipped and counted.
fn recover(dir: &Path, fsync: bool, metrics: &Metrics) -> Result<SpoolInner> {
    let mut ids = Vec::new();
    let listing = fs::read_dir(dir).map_err(|e| init_error(dir, e.into()))?;
    for entry in listing {
        let entry = entry.map_err(|e| init_error(dir, e.into()))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(super::segment::parse_segment_file_name) {
            ids.push(id);
        }
    }
    ids.sort_unstable();

    let mut segments: Vec<SegmentMeta> = Vec::new();
    for id in ids.iter().copied() {
        if let Some(meta) = recover_segment(dir, id, metrics) {
            segments.push(meta);
        }
    }

    let cursor_store = CursorStore::new(dir, fsync);
    let persisted = cursor_store.load().map_err(|e| init_error(dir, e))?;

    // Segments before the cursor were drained before the crash
    if let Some(cursor) = persisted {
        segments.retain(|meta| {
            if meta.id < cursor.segment_id {
                info!("Removing segment {} consumed before restart", meta.id);
                if let Err(e) = fs::remove_file(&meta.path) {
                    warn!("Failed to remove consumed segment {:?}: {}", meta.path, e);
                }
                false
            } else {
                true
            }
        });
    }

    let next_segment_id = ids
        .iter()
        .copied()
        .chain(persisted.map(|c| c.segment_id))
        .max()
        .map_or(1, |max| max + 1);

    let active_id = next_segment_id;
    let active = ActiveSegment::new(dir, active_id);

    let head_id = segments.first().map_or(active_id, |m| m.id);
    let mut cursor = match persisted {
        Some(c) if c.segment_id == head_id => {
            let head = &segments[0];
            let mut c = c;
            if c.offset > head.len || c.index > head.entry_count {
                warn!(
                    "Cursor {:?} points past the end of segment {}, clamping",
                    c, head.id
                );
                c.offset = head.len;
                c.index = head.entry_count;
            }
            c
        }
        Some(c) => {
            debug!("Cursor segment {} is gone, starting at {}", c.segment_id, head_id);
            Cursor::start_of(head_id)
        }
        None => Cursor::start_of(head_id),
    };

    if let EntryState::InFlight { retries } = cursor.state {
        info!(
            "Entry at segment {} offset {} was in flight at shutdown, will redeliver",
            cursor.segment_id, cursor.offset
        );
        cursor.state = EntryState::Pending { retries };
    }

    // Entries before the cursor no longer protect the head segment
    if let Some(head) = segments.first_mut() {
        if cursor.offset > 0 || cursor.state.retries() > 0 {
            match count_unattempted(head, &cursor) {
                Ok(unattempted) => head.unattempted = unattempted,
                Err(e) => warn!(
                    "Failed to rescan head segment {}: {}; keeping {} unattempted",
                    head.id, e, head.unattempted
                ),
            }
        }
    }

    cursor_store.save(&cursor).map_err(|e| init_error(dir, e))?;

    Ok(SpoolInner {
        closed: segments.into_iter().collect(),
        active,
        cursor,
        cursor_store,
        next_segment_id: active_id + 1,
        head: None,
    })
}

/// Validate one segment file, repairing or removing it as needed
///
/// The file name is authoritative for the id. A header that fails its
/// checksum is rebuilt from the frames behind it, so a torn seal loses
/// nothing. Files that cannot be read are skipped and counted.
fn recover_segment(dir: &Path, id: u64, metrics: &Metrics) -> Option<SegmentMeta> {
    let path = segment_path(dir, id);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) => {
            error!("Segment {:?} is unreadable ({}), skipping it", path, e);
            metrics.spool_corrupt_entries.inc();
            return None;
        }
    };

    if (data.len() as u64) < HEADER_LEN {
        warn!("Segment {:?} is shorter than its header, removing", path);
        remove_segment_file(&path);
        return None;
    }
    let area = &data[HEADER_LEN as usize..];

    match SegmentHeader::decode(&data) {
        Ok(header) if header.id != id => {
            warn!(
                "Segment {:?} claims id {}, rebuilding its header from its entries",
                path, header.id
            );
        }
        Ok(header) if header.sealed && header.byte_len == area.len() as u64 => {
            if header.entry_count == 0 {
                remove_segment_file(&path);
                return None;
            }
            return Some(SegmentMeta {
                id,
                path,
                len: header.byte_len,
                entry_count: header.entry_count,
                unattempted: header.unattempted,
            });
        }
        Ok(_) => {}
        Err(e) => {
            warn!(
                "Segment {:?} has an unreadable header ({}), rebuilding it from its entries",
                path, e
            );
        }
    }

    let scan = scan_entries(area);

    if let Some(reason) = &scan.corruption {
        warn!(
            "Segment {} is corrupt after {} entries ({}), truncating at {} bytes",
            id, scan.entry_count, reason, scan.valid_len
        );
        metrics.spool_corrupt_entries.inc();
        let truncated = OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| {
                file.set_len(HEADER_LEN + scan.valid_len)?;
                file.sync_all()
            });
        if let Err(e) = truncated {
            // Reads stop at the recorded length, so the tail stays unreachable
            warn!("Failed to truncate segment {}: {}", id, e);
        }
    }

    if scan.entry_count == 0 {
        debug!("Segment {} holds no entries, removing", id);
        remove_segment_file(&path);
        return None;
    }

    let sealed = SegmentHeader {
        id,
        sealed: true,
        byte_len: scan.valid_len,
        entry_count: scan.entry_count,
        unattempted: scan.unattempted,
    };
    if let Err(e) = write_header(&path, &sealed) {
        warn!("Failed to seal recovered segment {}: {}; it will be rescanned", id, e);
    }
    info!(
        "Recovered segment {} with {} entries ({} never attempted)",
        id, scan.entry_count, scan.unattempted
    );

    Some(SegmentMeta {
        id,
        path,
        len: scan.valid_len,
        entry_count: scan.entry_count,
        unattempted: scan.unattempted,
    })
}

fn remove_segment_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to remove segment {:?}: {}", path, e);
    }
}

/// Count never-attempted entries at or after the cursor, excluding a head
/// entry the drainer has already tried
fn count_unattempted(meta: &SegmentMeta, cursor: &Cursor) -> Result<u32> {
    let data = fs::read(&meta.path)?;
    let end = (HEADER_LEN + meta.len).min(data.len() as u64) as usize;
    let start = (HEADER_LEN + cursor.offset).min(end as u64) as usize;
    let mut scan = scan_entries(&data[start..end]);

    if cursor.state.retries() > 0 {
        if let FrameRead::Entry { entry, .. } = super::segment::decode_frame(&data[start..end]) {
            if entry.attempts == 0 {
                scan.unattempted = scan.unattempted.saturating_sub(1);
            }
        }
    }

    Ok(scan.unattempted)
}
