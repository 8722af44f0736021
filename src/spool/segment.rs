//! # Spool Segment Format
//!
//! Segment file layout and frame codec.
//!
//! ```text
//! segment-00000000000000000042.seg
//! +------------------------+-------------------------------------------+
//! | header (36 bytes)      | frame | frame | frame | ...               |
//! +------------------------+-------------------------------------------+
//!
//! header: magic "GSPL" | version u16 | flags u16 | id u64 | byte_len u64
//!         | entry_count u32 | unattempted u32 | crc32 u32   (little endian)
//! frame:  payload_len u32 | crc32(payload) u32 | payload (JSON)
//! ```
//!
//! The header of the active segment is written unsealed with zero counts.
//! Sealing rewrites it with the final counts once the segment is closed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::crc::crc32;
use crate::error::{Result, SpoolerError};
use crate::telemetry::record::TelemetryRecord;

/// Segment file magic
pub const SEGMENT_MAGIC: &[u8; 4] = b"GSPL";

/// On-disk format version
pub const SEGMENT_VERSION: u16 = 1;

/// Header flag: segment is closed and its counts are final
pub const FLAG_SEALED: u16 = 0x0001;

/// Size of the segment header in bytes
pub const HEADER_LEN: u64 = 36;

/// Frame prefix size (length + checksum)
pub const FRAME_OVERHEAD: u64 = 8;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".seg";

/// Fixed segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub id: u64,
    pub sealed: bool,
    /// Byte length of the entry area (everything after the header)
    pub byte_len: u64,
    pub entry_count: u32,
    /// Entries spooled without any delivery attempt
    pub unattempted: u32,
}

impl SegmentHeader {
    /// Header of a freshly created, empty segment
    pub fn open(id: u64) -> Self {
        Self {
            id,
            sealed: false,
            byte_len: 0,
            entry_count: 0,
            unattempted: 0,
        }
    }

    /// Encode to the 36-byte on-disk form
    pub fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN as usize);
        buf.put_slice(SEGMENT_MAGIC);
        buf.put_u16_le(SEGMENT_VERSION);
        buf.put_u16_le(if self.sealed { FLAG_SEALED } else { 0 });
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.byte_len);
        buf.put_u32_le(self.entry_count);
        buf.put_u32_le(self.unattempted);
        let crc = crc32(&buf);
        buf.put_u32_le(crc);

        let mut out = [0u8; HEADER_LEN as usize];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode and verify a header
    ///
    /// # Errors
    ///
    /// Returns [`SpoolerError::Corrupt`] if the buffer is short, the magic or
    /// version is wrong, or the header checksum does not match.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN as usize {
            return Err(SpoolerError::Corrupt(format!(
                "Segment header too short: {} bytes",
                data.len()
            )));
        }

        let stored_crc = u32::from_le_bytes([data[32], data[33], data[34], data[35]]);
        let calculated_crc = crc32(&data[..32]);
        if stored_crc != calculated_crc {
            return Err(SpoolerError::Corrupt(format!(
                "Segment header CRC mismatch: expected 0x{:08X}, got 0x{:08X}",
                calculated_crc, stored_crc
            )));
        }

        let mut buf = &data[..32];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != SEGMENT_MAGIC {
            return Err(SpoolerError::Corrupt("Invalid segment magic".to_string()));
        }

        let version = buf.get_u16_le();
        if version != SEGMENT_VERSION {
            return Err(SpoolerError::Corrupt(format!(
                "Unsupported segment version: {}",
                version
            )));
        }

        let flags = buf.get_u16_le();

        Ok(Self {
            sealed: flags & FLAG_SEALED != 0,
            id: buf.get_u64_le(),
            byte_len: buf.get_u64_le(),
            entry_count: buf.get_u32_le(),
            unattempted: buf.get_u32_le(),
        })
    }
}

/// Payload stored in each frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub record: TelemetryRecord,
    /// Enqueue time, Unix milliseconds
    pub enqueued_at: i64,
    /// Live delivery attempts made before spooling (0 or 1)
    pub attempts: u32,
}

impl StoredEntry {
    pub fn new(record: TelemetryRecord, enqueued_at: DateTime<Utc>, attempts: u32) -> Self {
        Self {
            record,
            enqueued_at: enqueued_at.timestamp_millis(),
            attempts,
        }
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.enqueued_at)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Build a frame around an encoded payload
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD as usize + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Serialize an entry and frame it
pub fn encode_entry(entry: &StoredEntry) -> Result<Bytes> {
    let payload = serde_json::to_vec(entry)?;
    Ok(encode_frame(&payload))
}

/// Result of reading one frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRead {
    /// A valid frame
    Entry {
        entry: StoredEntry,
        checksum: u32,
        /// Total frame length including the prefix
        frame_len: u64,
    },
    /// No bytes left in the entry area
    End,
    /// Truncated frame, checksum mismatch or undecodable payload
    Corrupt(String),
}

/// Decode the frame at the start of `data`
///
/// `data` must end where the entry area ends; a frame whose declared length
/// runs past it is reported as truncated.
pub fn decode_frame(data: &[u8]) -> FrameRead {
    if data.is_empty() {
        return FrameRead::End;
    }
    if data.len() < FRAME_OVERHEAD as usize {
        return FrameRead::Corrupt(format!("Truncated frame prefix: {} bytes", data.len()));
    }

    let mut prefix = &data[..FRAME_OVERHEAD as usize];
    let len = prefix.get_u32_le() as usize;
    let stored_crc = prefix.get_u32_le();

    let end = FRAME_OVERHEAD as usize + len;
    if data.len() < end {
        return FrameRead::Corrupt(format!(
            "Truncated frame: expected {} payload bytes, {} available",
            len,
            data.len() - FRAME_OVERHEAD as usize
        ));
    }

    let payload = &data[FRAME_OVERHEAD as usize..end];
    let calculated_crc = crc32(payload);
    if calculated_crc != stored_crc {
        return FrameRead::Corrupt(format!(
            "Frame CRC mismatch: expected 0x{:08X}, got 0x{:08X}",
            calculated_crc, stored_crc
        ));
    }

    match serde_json::from_slice::<StoredEntry>(payload) {
        Ok(entry) => FrameRead::Entry {
            entry,
            checksum: stored_crc,
            frame_len: end as u64,
        },
        Err(e) => FrameRead::Corrupt(format!("Undecodable payload: {}", e)),
    }
}

/// Read the frame at `offset` within the entry area of a segment file
///
/// `area_len` bounds the read so the active segment's tail is never
/// mistaken for data.
pub fn read_frame_at(path: &Path, offset: u64, area_len: u64) -> Result<FrameRead> {
    if offset >= area_len {
        return Ok(FrameRead::End);
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(HEADER_LEN + offset))?;

    let remaining = area_len - offset;
    if remaining < FRAME_OVERHEAD {
        return Ok(FrameRead::Corrupt(format!(
            "Truncated frame prefix: {} bytes",
            remaining
        )));
    }

    let mut prefix = [0u8; FRAME_OVERHEAD as usize];
    file.read_exact(&mut prefix)?;
    let payload_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
    let frame_len = (FRAME_OVERHEAD + payload_len).min(remaining);

    let mut frame = vec![0u8; frame_len as usize];
    frame[..FRAME_OVERHEAD as usize].copy_from_slice(&prefix);
    file.read_exact(&mut frame[FRAME_OVERHEAD as usize..])?;

    Ok(decode_frame(&frame))
}

/// Summary of a frame-by-frame scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    /// Bytes of valid frames from the start of the entry area
    pub valid_len: u64,
    pub entry_count: u32,
    pub unattempted: u32,
    /// Why the scan stopped early, if it did
    pub corruption: Option<String>,
}

/// Scan an entry area, stopping at the first bad frame
pub fn scan_entries(area: &[u8]) -> ScanResult {
    let mut result = ScanResult {
        valid_len: 0,
        entry_count: 0,
        unattempted: 0,
        corruption: None,
    };

    loop {
        match decode_frame(&area[result.valid_len as usize..]) {
            FrameRead::Entry { entry, frame_len, .. } => {
                result.valid_len += frame_len;
                result.entry_count += 1;
                if entry.attempts == 0 {
                    result.unattempted += 1;
                }
            }
            FrameRead::End => break,
            FrameRead::Corrupt(reason) => {
                result.corruption = Some(reason);
                break;
            }
        }
    }

    result
}

/// File name for a segment id
pub fn segment_file_name(id: u64) -> String {
    format!("{}{:020}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX)
}

/// Path of a segment inside the spool directory
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(segment_file_name(id))
}

/// Parse a segment id from a file name
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Create a new, empty, unsealed segment file opened for appending
pub fn create_segment(dir: &Path, id: u64, fsync: bool) -> Result<File> {
    let path = segment_path(dir, id);
    let mut file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)?;
    file.write_all(&SegmentHeader::open(id).encode())?;
    if fsync {
        file.sync_all()?;
    }
    Ok(file)
}

/// Rewrite the header of a segment file in place and flush it
pub fn write_header(path: &Path, header: &SegmentHeader) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::record::FieldValue;
    use std::collections::BTreeMap;

    fn entry(seq: u64, attempts: u32) -> StoredEntry {
        let mut fields = BTreeMap::new();
        fields.insert("satellites_used".to_string(), FieldValue::Integer(7));
        let record = TelemetryRecord::new(
            "gnss_sky",
            "gpsd",
            seq,
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            BTreeMap::new(),
            fields,
        );
        StoredEntry::new(record, Utc.timestamp_opt(1_700_000_001, 0).unwrap(), attempts)
    }

    #[test]
    fn test_header_layout() {
        let header = SegmentHeader {
            id: 42,
            sealed: true,
            byte_len: 1000,
            entry_count: 10,
            unattempted: 2,
        };
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], b"GSPL");
        assert_eq!(&bytes[4..6], &[1, 0]);
        assert_eq!(&bytes[6..8], &[1, 0]);
        assert_eq!(&bytes[8..16], &42u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &1000u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &10u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &2u32.to_le_bytes());
        assert_eq!(&bytes[32..36], &crc32(&bytes[..32]).to_le_bytes());

        assert_eq!(SegmentHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_crc_mismatch() {
        let mut bytes = SegmentHeader::open(1).encode();
        bytes[10] ^= 0xFF;
        assert!(SegmentHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_header_bad_magic() {
        let mut bytes = SegmentHeader::open(1).encode();
        bytes[0] = b'X';
        let crc = crc32(&bytes[..32]);
        bytes[32..36].copy_from_slice(&crc.to_le_bytes());
        let err = SegmentHeader::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_header_too_short() {
        assert!(SegmentHeader::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_frame_decodes() {
        let e = entry(5, 1);
        let frame = encode_entry(&e).unwrap();

        match decode_frame(&frame) {
            FrameRead::Entry { entry, frame_len, checksum } => {
                assert_eq!(entry, e);
                assert_eq!(frame_len, frame.len() as u64);
                assert_eq!(checksum, crc32(&frame[8..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame_is_corrupt() {
        let frame = encode_entry(&entry(5, 1)).unwrap();
        assert!(matches!(decode_frame(&frame[..frame.len() - 3]), FrameRead::Corrupt(_)));
        assert!(matches!(decode_frame(&frame[..4]), FrameRead::Corrupt(_)));
        assert_eq!(decode_frame(&[]), FrameRead::End);
    }

    #[test]
    fn test_flipped_payload_byte_is_corrupt() {
        let mut frame = encode_entry(&entry(5, 1)).unwrap().to_vec();
        let last = frame.len() - 2;
        frame[last] ^= 0x20;
        match decode_frame(&frame) {
            FrameRead::Corrupt(reason) => assert!(reason.contains("CRC")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_valid_crc_but_bad_json_is_corrupt() {
        let frame = encode_frame(b"not json");
        match decode_frame(&frame) {
            FrameRead::Corrupt(reason) => assert!(reason.contains("Undecodable")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scan_stops_at_first_bad_frame() {
        let mut area = Vec::new();
        area.extend_from_slice(&encode_entry(&entry(1, 1)).unwrap());
        area.extend_from_slice(&encode_entry(&entry(2, 0)).unwrap());
        let good_len = area.len() as u64;
        let third = encode_entry(&entry(3, 0)).unwrap();
        area.extend_from_slice(&third[..third.len() / 2]);

        let scan = scan_entries(&area);
        assert_eq!(scan.valid_len, good_len);
        assert_eq!(scan.entry_count, 2);
        assert_eq!(scan.unattempted, 1);
        assert!(scan.corruption.is_some());
    }

    #[test]
    fn test_read_frame_at_respects_area_len() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = create_segment(dir.path(), 1, false).unwrap();
        let a = encode_entry(&entry(1, 1)).unwrap();
        let b = encode_entry(&entry(2, 1)).unwrap();
        file.write_all(&a).unwrap();
        file.write_all(&b).unwrap();

        let path = segment_path(dir.path(), 1);
        let area_len = (a.len() + b.len()) as u64;

        match read_frame_at(&path, a.len() as u64, area_len).unwrap() {
            FrameRead::Entry { entry, .. } => assert_eq!(entry.record.sequence(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(read_frame_at(&path, area_len, area_len).unwrap(), FrameRead::End);
        // Only the first frame is visible when the area is shorter
        assert!(matches!(
            read_frame_at(&path, a.len() as u64, a.len() as u64 + 4).unwrap(),
            FrameRead::Corrupt(_)
        ));
    }

    #[test]
    fn test_file_names() {
        assert_eq!(segment_file_name(7), "segment-00000000000000000007.seg");
        assert_eq!(parse_segment_file_name("segment-00000000000000000007.seg"), Some(7));
        assert_eq!(parse_segment_file_name("segment-7.seg"), None);
        assert_eq!(parse_segment_file_name("cursor.json"), None);
        assert_eq!(parse_segment_file_name("segment-0000000000000000000x.seg"), None);
    }

    #[test]
    fn test_seal_rewrites_header() {
        let dir = tempfile::tempdir().unwrap();
        create_segment(dir.path(), 3, true).unwrap();
        let path = segment_path(dir.path(), 3);

        let sealed = SegmentHeader {
            id: 3,
            sealed: true,
            byte_len: 0,
            entry_count: 0,
            unattempted: 0,
        };
        write_header(&path, &sealed).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, HEADER_LEN);
        assert_eq!(SegmentHeader::decode(&data).unwrap(), sealed);
    }
}
