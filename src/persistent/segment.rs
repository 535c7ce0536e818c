/// Immutable segment files.
///
/// A segment holds the flushed entries of one partition:
///
/// ```text
/// [magic: 8][header_len: u32][header_crc: u32][bincode SegmentHeader]
/// [frame(SegmentEntry)] ...
/// ```
///
/// The header records the partition tag, entry count, payload length and
/// payload checksum, so a segment can be validated without any other file.
/// Segments are written to a temporary name, fsynced and renamed into place,
/// so a reader never observes a partially written segment.
use super::frame::{self, FrameRead};
use super::wal::sync_dir;
use crate::error::{LakeError, LakeResult};
use crate::types::Partition;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

const SEGMENT_MAGIC: &[u8; 8] = b"RLAKESEG";
const SEGMENT_FORMAT_VERSION: u32 = 1;
const SEGMENT_EXTENSION: &str = "seg";
const TEMP_EXTENSION: &str = "tmp";
const PREAMBLE_LEN: usize = SEGMENT_MAGIC.len() + 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct SegmentHeader {
    pub format_version: u32,
    pub segment_id: u64,
    pub partition: Partition,
    pub record_count: u64,
    pub payload_len: u64,
    pub payload_crc: u32,
    pub uncompressed_bytes: u64,
    /// Segments this one replaces; they are deleted if found at startup.
    pub supersedes: Vec<u64>,
    pub created_at_ms: i64,
}

/// One stored version of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct SegmentEntry {
    pub key: String,
    pub version: u64,
    pub created_at_ms: i64,
    pub raw_len: u64,
    pub tombstone: bool,
    /// zstd-compressed value; empty for tombstones.
    pub data: Vec<u8>,
}

/// Where an entry landed in a segment file.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct EntryLocation {
    pub key: String,
    pub version: u64,
    pub raw_len: u64,
    pub stored_len: u64,
    pub tombstone: bool,
    pub offset: u64,
    pub len: u32,
}

/// Read handle on a segment.
///
/// Shared as `Arc<SegmentReader>`. Once compaction marks a segment obsolete,
/// its file is unlinked when the last reader drops its handle.
#[derive(Debug)]
pub(super) struct SegmentReader {
    header: SegmentHeader,
    path: PathBuf,
    file_len: u64,
    file: Mutex<File>,
    obsolete: AtomicBool,
}

impl SegmentReader {
    pub fn id(&self) -> u64 {
        self.header.segment_id
    }

    pub fn partition(&self) -> Partition {
        self.header.partition
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Schedule the file for deletion once no reader holds it.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Read and verify the entry framed at `offset`.
    pub fn read_entry(&self, offset: u64, len: u32) -> LakeResult<SegmentEntry> {
        let mut buf = vec![0u8; len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        match frame::read_at(&buf, 0) {
            FrameRead::Complete { payload, .. } => Ok(bincode::deserialize(payload)?),
            FrameRead::ChecksumMismatch { .. } => Err(LakeError::corruption(
                format!("{}@{}", self.path.display(), offset),
                "entry checksum mismatch",
            )),
            FrameRead::Truncated | FrameRead::BadHeader | FrameRead::End => {
                Err(LakeError::corruption(
                    format!("{}@{}", self.path.display(), offset),
                    "entry frame header is damaged",
                ))
            }
        }
    }

    /// Read and verify every entry.
    pub fn read_all(&self) -> LakeResult<Vec<SegmentEntry>> {
        let buf = {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(0))?;
            let mut buf = Vec::with_capacity(self.file_len as usize);
            file.read_to_end(&mut buf)?;
            buf
        };
        let (_, entries) = parse(&self.path, &buf)?;
        Ok(entries.into_iter().map(|(entry, _, _)| entry).collect())
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::Acquire) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(segment = self.header.segment_id, "Removed obsolete segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?self.path, error = %e, "Failed to remove obsolete segment"),
        }
    }
}

/// Path of segment `id` under `dir`.
pub(super) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:016x}.{}", id, SEGMENT_EXTENSION))
}

/// Write a new segment atomically and open it.
pub(super) fn write_segment(
    dir: &Path,
    id: u64,
    partition: Partition,
    entries: &[SegmentEntry],
    supersedes: Vec<u64>,
    created_at_ms: i64,
) -> LakeResult<(SegmentReader, Vec<EntryLocation>)> {
    let mut payload = Vec::new();
    let mut relative = Vec::with_capacity(entries.len());
    let mut uncompressed_bytes = 0u64;
    for entry in entries {
        let framed = frame::encode(&bincode::serialize(entry)?);
        relative.push((payload.len() as u64, framed.len() as u32));
        payload.extend_from_slice(&framed);
        uncompressed_bytes += entry.raw_len;
    }

    let header = SegmentHeader {
        format_version: SEGMENT_FORMAT_VERSION,
        segment_id: id,
        partition,
        record_count: entries.len() as u64,
        payload_len: payload.len() as u64,
        payload_crc: crc32fast::hash(&payload),
        uncompressed_bytes,
        supersedes,
        created_at_ms,
    };
    let header_bytes = bincode::serialize(&header)?;
    let payload_start = (PREAMBLE_LEN + header_bytes.len()) as u64;

    let final_path = segment_path(dir, id);
    let temp_path = final_path.with_extension(format!("{}.{}", SEGMENT_EXTENSION, TEMP_EXTENSION));
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(SEGMENT_MAGIC)?;
        file.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&crc32fast::hash(&header_bytes).to_le_bytes())?;
        file.write_all(&header_bytes)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, &final_path)?;
    sync_dir(dir)?;

    let locations = entries
        .iter()
        .zip(relative)
        .map(|(entry, (offset, len))| EntryLocation {
            key: entry.key.clone(),
            version: entry.version,
            raw_len: entry.raw_len,
            stored_len: entry.data.len() as u64,
            tombstone: entry.tombstone,
            offset: payload_start + offset,
            len,
        })
        .collect();

    let file_len = payload_start + header.payload_len;
    let reader = SegmentReader {
        header,
        file: Mutex::new(File::open(&final_path)?),
        path: final_path,
        file_len,
        obsolete: AtomicBool::new(false),
    };
    Ok((reader, locations))
}

/// Open and fully verify an existing segment.
pub(super) fn open_segment(path: &Path) -> LakeResult<(SegmentReader, Vec<EntryLocation>)> {
    let buf = fs::read(path)?;
    let (header, entries) = parse(path, &buf)?;
    let locations = entries
        .into_iter()
        .map(|(entry, offset, len)| EntryLocation {
            stored_len: entry.data.len() as u64,
            key: entry.key,
            version: entry.version,
            raw_len: entry.raw_len,
            tombstone: entry.tombstone,
            offset,
            len,
        })
        .collect();
    let reader = SegmentReader {
        header,
        file: Mutex::new(File::open(path)?),
        path: path.to_path_buf(),
        file_len: buf.len() as u64,
        obsolete: AtomicBool::new(false),
    };
    Ok((reader, locations))
}

/// List segment files and leftover temporaries under `dir`.
pub(super) fn list_segments(dir: &Path) -> LakeResult<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut segments = Vec::new();
    let mut temporaries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some(SEGMENT_EXTENSION) => segments.push(path),
            Some(TEMP_EXTENSION) => temporaries.push(path),
            _ => {}
        }
    }
    segments.sort();
    Ok((segments, temporaries))
}

type ParsedEntry = (SegmentEntry, u64, u32);

fn parse(path: &Path, buf: &[u8]) -> LakeResult<(SegmentHeader, Vec<ParsedEntry>)> {
    let location = path.display().to_string();
    if buf.len() < PREAMBLE_LEN || &buf[..SEGMENT_MAGIC.len()] != SEGMENT_MAGIC {
        return Err(LakeError::corruption(location, "bad segment magic"));
    }
    let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let header_len = word(SEGMENT_MAGIC.len()) as usize;
    let header_crc = word(SEGMENT_MAGIC.len() + 4);
    let payload_start = PREAMBLE_LEN + header_len;
    if buf.len() < payload_start {
        return Err(LakeError::corruption(location, "segment header is truncated"));
    }
    let header_bytes = &buf[PREAMBLE_LEN..payload_start];
    if crc32fast::hash(header_bytes) != header_crc {
        return Err(LakeError::corruption(location, "segment header checksum mismatch"));
    }
    let header: SegmentHeader = bincode::deserialize(header_bytes)?;
    if header.format_version != SEGMENT_FORMAT_VERSION {
        return Err(LakeError::corruption(
            location,
            format!("unsupported segment format {}", header.format_version),
        ));
    }

    let payload = &buf[payload_start..];
    if payload.len() as u64 != header.payload_len {
        return Err(LakeError::corruption(
            location,
            format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                header.payload_len
            ),
        ));
    }
    if crc32fast::hash(payload) != header.payload_crc {
        return Err(LakeError::corruption(location, "segment payload checksum mismatch"));
    }

    let mut entries = Vec::with_capacity(header.record_count as usize);
    let mut offset = 0usize;
    loop {
        match frame::read_at(payload, offset) {
            FrameRead::End => break,
            FrameRead::Complete { payload: bytes, next } => {
                let entry: SegmentEntry = bincode::deserialize(bytes)?;
                entries.push((
                    entry,
                    (payload_start + offset) as u64,
                    (next - offset) as u32,
                ));
                offset = next;
            }
            FrameRead::Truncated | FrameRead::BadHeader | FrameRead::ChecksumMismatch { .. } => {
                return Err(LakeError::corruption(
                    format!("{}@{}", location, payload_start + offset),
                    "segment entry frame is damaged",
                ));
            }
        }
    }
    if entries.len() as u64 != header.record_count {
        return Err(LakeError::corruption(
            location,
            format!(
                "found {} entries, header says {}",
                entries.len(),
                header.record_count
            ),
        ));
    }
    Ok((header, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(key: &str, version: u64) -> SegmentEntry {
        SegmentEntry {
            key: key.to_string(),
            version,
            created_at_ms: 1_700_000_000_000,
            raw_len: 5,
            tombstone: false,
            data: vec![version as u8; 4],
        }
    }

    #[test]
    fn test_written_segment_reopens_identically() {
        let dir = TempDir::new().unwrap();
        let entries = vec![entry("a", 1), entry("b", 2)];
        let (reader, written) =
            write_segment(dir.path(), 7, Partition::History, &entries, vec![3, 4], 0).unwrap();
        assert_eq!(reader.id(), 7);
        assert_eq!(reader.header().supersedes, vec![3, 4]);

        let (reopened, read) = open_segment(&segment_path(dir.path(), 7)).unwrap();
        assert_eq!(reopened.partition(), Partition::History);
        assert_eq!(read, written);
        assert_eq!(reopened.file_len(), reader.file_len());

        let second = &read[1];
        assert_eq!(reopened.read_entry(second.offset, second.len).unwrap(), entries[1]);
        assert_eq!(reopened.read_all().unwrap(), entries);
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let dir = TempDir::new().unwrap();
        let (reader, locations) =
            write_segment(dir.path(), 1, Partition::Code, &[entry("a", 1)], vec![], 0).unwrap();
        let path = segment_path(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            open_segment(&path),
            Err(LakeError::Corruption { .. })
        ));
        // The open handle sees the rewritten bytes too.
        let loc = &locations[0];
        assert!(matches!(
            reader.read_entry(loc.offset, loc.len),
            Err(LakeError::Corruption { .. })
        ));
    }

    #[test]
    fn test_obsolete_segment_is_unlinked_on_drop() {
        let dir = TempDir::new().unwrap();
        let (reader, _) =
            write_segment(dir.path(), 9, Partition::Metadata, &[], vec![], 0).unwrap();
        let path = segment_path(dir.path(), 9);
        assert!(path.exists());
        reader.mark_obsolete();
        drop(reader);
        assert!(!path.exists());
    }
}
