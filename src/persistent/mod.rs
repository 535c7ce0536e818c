//! Persistent Store: the cold tier and the only source of truth.
//!
//! A write-ahead-logged key/value engine:
//!
//! - every `put`/`delete` is appended to the WAL and fsynced before it is
//!   acknowledged;
//! - acknowledged values sit zstd-compressed in an in-memory memtable until
//!   `flush` writes them to immutable, checksummed segment files (one per
//!   partition) and retires the covered WAL generations;
//! - `compact` merges each partition's segments, dropping superseded versions
//!   and tombstones, and swaps the new segment in under a short write lock.
//!   Readers clone an `Arc` to the segment they need, so a segment replaced
//!   by compaction stays readable until the last in-flight read finishes.
//!
//! On open, segments are verified and loaded, compaction leftovers are
//! resolved through each segment's `supersedes` list, and the WAL is
//! replayed on top.

mod frame;
mod segment;
mod wal;

use crate::clock::Clock;
use crate::compression::{self, RatioTracker};
use crate::config::LakeConfig;
use crate::error::{LakeError, LakeResult};
use crate::types::{Partition, validate_key};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use segment::{EntryLocation, SegmentEntry, SegmentReader};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};
use wal::{Wal, WalOp, WalRecord};

const SEGMENTS_DIR: &str = "segments";
const WAL_DIR: &str = "wal";

/// Where the newest version of a key is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Memtable,
    Segment { id: u64, offset: u64, len: u32 },
}

/// Index entry for the newest version of a key.
#[derive(Debug, Clone)]
struct IndexEntry {
    partition: Partition,
    version: u64,
    tombstone: bool,
    raw_len: u64,
    stored_len: u64,
    location: Location,
}

impl IndexEntry {
    fn live(&self) -> bool {
        !self.tombstone
    }
}

/// A WAL-backed value not yet flushed to a segment.
#[derive(Debug, Clone)]
struct MemEntry {
    partition: Partition,
    version: u64,
    created_at_ms: i64,
    raw_len: u64,
    tombstone: bool,
    data: Arc<[u8]>,
}

/// A value read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub key: String,
    pub partition: Partition,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// Point-in-time view of the cold tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColdStats {
    /// Live (non-tombstoned) keys
    pub records: u64,
    /// Tombstones awaiting compaction
    pub tombstones: u64,
    pub segments: u64,
    pub segment_bytes: u64,
    pub wal_bytes: u64,
    /// Segment plus WAL bytes on disk
    pub disk_bytes: u64,
    /// Entries waiting for the next flush
    pub memtable_records: u64,
    /// Uncompressed bytes of live values
    pub raw_bytes: u64,
    /// Compressed bytes of live values
    pub stored_bytes: u64,
    pub compression_ratio: f64,
    pub last_compaction_at: Option<DateTime<Utc>>,
}

/// What a compaction run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompactionReport {
    pub partitions_compacted: usize,
    pub segments_before: usize,
    pub segments_after: usize,
    pub entries_dropped: u64,
    pub tombstones_dropped: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// The durable, compressed, write-ahead-logged store.
#[derive(Debug)]
pub struct PersistentStore {
    root: PathBuf,
    segments_dir: PathBuf,
    compression_level: i32,
    max_bytes: Option<u64>,
    flush_threshold: usize,
    clock: Arc<dyn Clock>,

    wal: Mutex<Wal>,
    last_version: AtomicU64,
    next_segment_id: AtomicU64,
    memtable: DashMap<String, MemEntry>,
    index: DashMap<String, IndexEntry>,
    segments: RwLock<BTreeMap<u64, Arc<SegmentReader>>>,

    segment_bytes: AtomicU64,
    wal_bytes: AtomicU64,
    ratio: RatioTracker,
    /// Serializes flush and compaction.
    maintenance: Mutex<()>,
    last_compaction_at: Mutex<Option<DateTime<Utc>>>,
}

impl PersistentStore {
    /// Open (or create) the store under `config.data_dir`, running recovery.
    ///
    /// Fails with [`LakeError::WalIntegrity`] or [`LakeError::Corruption`]
    /// when durable state cannot be trusted.
    pub fn open(config: &LakeConfig, clock: Arc<dyn Clock>) -> LakeResult<Self> {
        let root = config.data_dir.clone();
        let segments_dir = root.join(SEGMENTS_DIR);
        fs::create_dir_all(&segments_dir)?;

        let index: DashMap<String, IndexEntry> = DashMap::new();
        let memtable: DashMap<String, MemEntry> = DashMap::new();
        let (segments, max_segment_id, mut last_version) = load_segments(&segments_dir, &index)?;
        let segment_bytes = segments.values().map(|s| s.file_len()).sum();

        let (wal, replay) = Wal::recover(&root.join(WAL_DIR))?;
        let replayed = replay.records.len();
        for record in replay.records {
            last_version = last_version.max(record.version);
            let entry = mem_entry_from(record.partition, record.version, record.created_at_ms, record.op);
            install(&memtable, &index, None, record.key, entry);
        }

        let store = Self {
            root,
            segments_dir,
            compression_level: config.compression_level,
            max_bytes: config.max_cold_bytes,
            flush_threshold: config.memtable_flush_records.max(1),
            clock,
            wal_bytes: AtomicU64::new(wal.disk_bytes()),
            wal: Mutex::new(wal),
            last_version: AtomicU64::new(last_version),
            next_segment_id: AtomicU64::new(max_segment_id + 1),
            memtable,
            index,
            segments: RwLock::new(segments),
            segment_bytes: AtomicU64::new(segment_bytes),
            ratio: RatioTracker::new(),
            maintenance: Mutex::new(()),
            last_compaction_at: Mutex::new(None),
        };
        store.recount_ratio();

        info!(
            path = ?store.root,
            records = store.live_count(),
            segments = store.segments.read().len(),
            wal_records_replayed = replayed,
            torn_bytes_discarded = replay.truncated_bytes,
            last_version,
            "Persistent store opened"
        );
        Ok(store)
    }

    /// Root directory of the store.
    pub fn data_dir(&self) -> &Path {
        &self.root
    }

    /// Durably store `bytes` under `key`. Returns the new version.
    pub fn put(&self, partition: Partition, key: &str, bytes: &[u8]) -> LakeResult<u64> {
        self.put_inner(partition, key, bytes, None)
    }

    /// Like [`put`](Self::put), but only if the key's live version is `expected`
    /// (`None` meaning the key must not exist).
    pub fn put_expected(
        &self,
        partition: Partition,
        key: &str,
        bytes: &[u8],
        expected: Option<u64>,
    ) -> LakeResult<u64> {
        self.put_inner(partition, key, bytes, Some(expected))
    }

    fn put_inner(
        &self,
        partition: Partition,
        key: &str,
        bytes: &[u8],
        expected: Option<Option<u64>>,
    ) -> LakeResult<u64> {
        validate_key(key)?;
        let data = compression::compress(bytes, self.compression_level)?;
        let created_at_ms = self.clock.now().timestamp_millis();

        let version = {
            let mut wal = self.wal.lock();
            let current = self.index.get(key).map(|e| e.clone()).filter(IndexEntry::live);
            if let Some(expected) = expected {
                let actual = current.as_ref().map(|e| e.version);
                if actual != expected {
                    return Err(LakeError::ConcurrentModification {
                        key: key.to_string(),
                        expected,
                        actual,
                    });
                }
            }
            if let Some(existing) = current.as_ref().filter(|e| e.partition != partition) {
                return Err(LakeError::PartitionMismatch {
                    key: key.to_string(),
                    existing: existing.partition.to_string(),
                    requested: partition.to_string(),
                });
            }

            let version = self.last_version.load(Ordering::Acquire) + 1;
            let record = WalRecord {
                version,
                key: key.to_string(),
                partition,
                created_at_ms,
                op: WalOp::Put {
                    raw_len: bytes.len() as u64,
                    data,
                },
            };
            self.check_capacity(record.framed_len()?, &wal)?;
            wal.append(&record)?;
            self.last_version.store(version, Ordering::Release);
            self.wal_bytes.store(wal.disk_bytes(), Ordering::Relaxed);

            let entry = mem_entry_from(partition, version, created_at_ms, record.op);
            install(&self.memtable, &self.index, Some(&self.ratio), record.key, entry);
            version
        };

        trace!(key, %partition, version, raw = bytes.len(), "put");
        self.maybe_flush();
        Ok(version)
    }

    /// Write a tombstone for `key`. Returns the tombstone's version.
    ///
    /// Deletes are accepted even when the store is at its byte cap, since
    /// they are how space is reclaimed.
    pub fn delete(&self, key: &str) -> LakeResult<u64> {
        validate_key(key)?;
        let created_at_ms = self.clock.now().timestamp_millis();
        let version = {
            let mut wal = self.wal.lock();
            let current = self
                .index
                .get(key)
                .map(|e| e.clone())
                .filter(IndexEntry::live)
                .ok_or_else(|| LakeError::not_found(key))?;

            let version = self.last_version.load(Ordering::Acquire) + 1;
            let record = WalRecord {
                version,
                key: key.to_string(),
                partition: current.partition,
                created_at_ms,
                op: WalOp::Delete,
            };
            wal.append(&record)?;
            self.last_version.store(version, Ordering::Release);
            self.wal_bytes.store(wal.disk_bytes(), Ordering::Relaxed);

            let entry = mem_entry_from(current.partition, version, created_at_ms, record.op);
            install(&self.memtable, &self.index, Some(&self.ratio), record.key, entry);
            version
        };

        debug!(key, version, "delete");
        self.maybe_flush();
        Ok(version)
    }

    /// Latest live value of `key`.
    pub fn get(&self, key: &str) -> LakeResult<Vec<u8>> {
        self.get_entry(key).map(|v| v.bytes)
    }

    /// Latest live value of `key` with its metadata.
    pub fn get_entry(&self, key: &str) -> LakeResult<StoredValue> {
        enum Source {
            Memory(MemEntry),
            Disk(Arc<SegmentReader>, IndexEntry, u64, u32),
        }

        let source = {
            // Holding the segment set stable while resolving the location means
            // flush and compaction cannot move the entry underneath us.
            let segments = self.segments.read();
            let entry = self
                .index
                .get(key)
                .map(|e| e.clone())
                .ok_or_else(|| LakeError::not_found(key))?;
            if entry.tombstone {
                return Err(LakeError::not_found(key));
            }
            match entry.location {
                Location::Memtable => {
                    let mem = self.memtable.get(key).map(|m| m.clone()).ok_or_else(|| {
                        LakeError::corruption("memtable", format!("index references missing key '{}'", key))
                    })?;
                    Source::Memory(mem)
                }
                Location::Segment { id, offset, len } => {
                    let reader = segments.get(&id).cloned().ok_or_else(|| {
                        LakeError::corruption(
                            format!("segment {:016x}", id),
                            format!("index references missing segment for '{}'", key),
                        )
                    })?;
                    Source::Disk(reader, entry, offset, len)
                }
            }
        };

        match source {
            Source::Memory(mem) => {
                if mem.tombstone {
                    return Err(LakeError::not_found(key));
                }
                Ok(StoredValue {
                    key: key.to_string(),
                    partition: mem.partition,
                    version: mem.version,
                    created_at: from_millis(mem.created_at_ms),
                    bytes: compression::decompress(&mem.data, mem.raw_len as usize)?,
                })
            }
            Source::Disk(reader, entry, offset, len) => {
                let stored = reader.read_entry(offset, len)?;
                if stored.key != key || stored.version != entry.version {
                    return Err(LakeError::corruption(
                        format!("segment {:016x}@{}", reader.id(), offset),
                        format!(
                            "expected '{}' v{}, found '{}' v{}",
                            key, entry.version, stored.key, stored.version
                        ),
                    ));
                }
                Ok(StoredValue {
                    key: key.to_string(),
                    partition: entry.partition,
                    version: stored.version,
                    created_at: from_millis(stored.created_at_ms),
                    bytes: compression::decompress(&stored.data, stored.raw_len as usize)?,
                })
            }
        }
    }

    /// Live version of `key`, if any.
    pub fn version_of(&self, key: &str) -> Option<u64> {
        self.index
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.version)
    }

    /// Partition of a live `key`.
    pub fn partition_of(&self, key: &str) -> Option<Partition> {
        self.index
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.partition)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.version_of(key).is_some()
    }

    /// Up to `n` live keys, most recently written first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        let mut live: Vec<(u64, String)> = self
            .index
            .iter()
            .filter(|e| e.live())
            .map(|e| (e.version, e.key().clone()))
            .collect();
        live.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        live.into_iter().take(n).map(|(_, key)| key).collect()
    }

    /// Live keys of one partition, sorted.
    pub fn keys_in_partition(&self, partition: Partition) -> Vec<String> {
        let mut keys: Vec<String> = self
            .index
            .iter()
            .filter(|e| e.live() && e.partition == partition)
            .map(|e| e.key().clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// All live keys, sorted.
    pub fn live_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .index
            .iter()
            .filter(|e| e.live())
            .map(|e| e.key().clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Bytes used on disk by segments and the WAL.
    pub fn disk_bytes(&self) -> u64 {
        self.segment_bytes.load(Ordering::Relaxed) + self.wal_bytes.load(Ordering::Relaxed)
    }

    pub fn compression_ratio(&self) -> f64 {
        self.ratio.ratio()
    }

    pub fn stats(&self) -> ColdStats {
        let (mut records, mut tombstones) = (0u64, 0u64);
        for entry in self.index.iter() {
            if entry.tombstone {
                tombstones += 1;
            } else {
                records += 1;
            }
        }
        let segment_bytes = self.segment_bytes.load(Ordering::Relaxed);
        let wal_bytes = self.wal_bytes.load(Ordering::Relaxed);
        ColdStats {
            records,
            tombstones,
            segments: self.segments.read().len() as u64,
            segment_bytes,
            wal_bytes,
            disk_bytes: segment_bytes + wal_bytes,
            memtable_records: self.memtable.len() as u64,
            raw_bytes: self.ratio.raw_bytes(),
            stored_bytes: self.ratio.stored_bytes(),
            compression_ratio: self.ratio.ratio(),
            last_compaction_at: *self.last_compaction_at.lock(),
        }
    }

    /// Write all acknowledged memtable entries to segments and retire the
    /// WAL generations they came from. Returns the number of entries flushed.
    pub fn flush(&self) -> LakeResult<usize> {
        let _maintenance = self.maintenance.lock();
        self.flush_locked()
    }

    fn maybe_flush(&self) {
        if self.memtable.len() < self.flush_threshold {
            return;
        }
        let Some(_maintenance) = self.maintenance.try_lock() else {
            return;
        };
        if let Err(e) = self.flush_locked() {
            warn!(error = %e, "Automatic memtable flush failed; entries remain in the WAL");
        }
    }

    fn flush_locked(&self) -> LakeResult<usize> {
        let (sealed, cutoff) = {
            let mut wal = self.wal.lock();
            let sealed = wal.rotate()?;
            self.wal_bytes.store(wal.disk_bytes(), Ordering::Relaxed);
            (sealed, self.last_version.load(Ordering::Acquire))
        };
        if sealed.is_empty() {
            return Ok(0);
        }

        let mut by_partition: BTreeMap<Partition, Vec<SegmentEntry>> = BTreeMap::new();
        for item in self.memtable.iter() {
            if item.version > cutoff {
                continue;
            }
            by_partition
                .entry(item.partition)
                .or_default()
                .push(SegmentEntry {
                    key: item.key().clone(),
                    version: item.version,
                    created_at_ms: item.created_at_ms,
                    raw_len: item.raw_len,
                    tombstone: item.tombstone,
                    data: item.data.to_vec(),
                });
        }

        let now_ms = self.clock.now().timestamp_millis();
        let mut written: Vec<(Arc<SegmentReader>, Vec<EntryLocation>)> = Vec::new();
        for (partition, mut entries) in by_partition {
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
            match segment::write_segment(&self.segments_dir, id, partition, &entries, Vec::new(), now_ms) {
                Ok((reader, locations)) => written.push((Arc::new(reader), locations)),
                Err(e) => {
                    for (reader, _) in &written {
                        reader.mark_obsolete();
                    }
                    return Err(e);
                }
            }
        }

        let mut flushed = 0;
        {
            let mut segments = self.segments.write();
            for (reader, locations) in written {
                for location in &locations {
                    repoint(&self.index, location, reader.id(), |l| matches!(l, Location::Memtable));
                    self.memtable
                        .remove_if(&location.key, |_, m| m.version == location.version);
                }
                flushed += locations.len();
                self.segment_bytes.fetch_add(reader.file_len(), Ordering::Relaxed);
                segments.insert(reader.id(), reader);
            }
        }

        let mut wal = self.wal.lock();
        wal.retire(&sealed)?;
        self.wal_bytes.store(wal.disk_bytes(), Ordering::Relaxed);
        debug!(flushed, cutoff, generations = sealed.len(), "Memtable flushed");
        Ok(flushed)
    }

    /// Merge each partition's segments, dropping superseded versions and
    /// tombstones, then recompute the compression ratio.
    ///
    /// Reads proceed throughout: new segments are installed under a short
    /// write lock and replaced files linger until their last reader is done.
    pub fn compact(&self) -> LakeResult<CompactionReport> {
        let _maintenance = self.maintenance.lock();
        // Tombstones may only disappear once no WAL generation could replay
        // an older version of their key.
        self.flush_locked()?;

        let snapshot: Vec<Arc<SegmentReader>> = self.segments.read().values().cloned().collect();
        let mut report = CompactionReport {
            segments_before: snapshot.len(),
            bytes_before: snapshot.iter().map(|s| s.file_len()).sum(),
            ..Default::default()
        };

        let mut by_partition: BTreeMap<Partition, Vec<(Arc<SegmentReader>, Vec<SegmentEntry>)>> =
            BTreeMap::new();
        let mut holders: HashMap<String, BTreeSet<Partition>> = HashMap::new();
        for reader in snapshot {
            let entries = reader.read_all()?;
            for entry in &entries {
                holders
                    .entry(entry.key.clone())
                    .or_default()
                    .insert(reader.partition());
            }
            by_partition
                .entry(reader.partition())
                .or_default()
                .push((reader, entries));
        }

        for (partition, inputs) in by_partition {
            let input_ids: Vec<u64> = inputs.iter().map(|(r, _)| r.id()).collect();
            let input_entries: usize = inputs.iter().map(|(_, e)| e.len()).sum();
            let mut kept = Vec::new();
            let mut dropped_tombstones = Vec::new();

            for (reader, entries) in &inputs {
                for entry in entries {
                    let current = self.index.get(&entry.key).map(|e| e.clone());
                    let referenced = current.is_some_and(|c| {
                        c.version == entry.version
                            && matches!(c.location, Location::Segment { id, .. } if id == reader.id())
                    });
                    if !referenced {
                        continue;
                    }
                    if entry.tombstone {
                        let held_elsewhere = holders
                            .get(&entry.key)
                            .is_some_and(|ps| ps.iter().any(|p| *p != partition));
                        if !held_elsewhere {
                            dropped_tombstones.push((entry.key.clone(), entry.version));
                            continue;
                        }
                    }
                    kept.push(entry.clone());
                }
            }

            if inputs.len() == 1 && kept.len() == input_entries {
                continue;
            }
            kept.sort_by(|a, b| a.key.cmp(&b.key));

            let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
            let (reader, locations) = segment::write_segment(
                &self.segments_dir,
                id,
                partition,
                &kept,
                input_ids.clone(),
                self.clock.now().timestamp_millis(),
            )?;
            let reader = Arc::new(reader);

            {
                let mut segments = self.segments.write();
                for location in &locations {
                    repoint(&self.index, location, id, |l| {
                        matches!(l, Location::Segment { id, .. } if input_ids.contains(id))
                    });
                }
                for (key, version) in &dropped_tombstones {
                    self.index
                        .remove_if(key, |_, e| e.tombstone && e.version == *version);
                }
                for old in &input_ids {
                    if let Some(old) = segments.remove(old) {
                        old.mark_obsolete();
                        self.segment_bytes.fetch_sub(old.file_len(), Ordering::Relaxed);
                    }
                }
                self.segment_bytes.fetch_add(reader.file_len(), Ordering::Relaxed);
                segments.insert(id, reader);
            }

            for (_, entries) in &inputs {
                for entry in entries {
                    if let Some(ps) = holders.get_mut(&entry.key) {
                        ps.remove(&partition);
                    }
                }
            }
            for entry in &kept {
                holders.entry(entry.key.clone()).or_default().insert(partition);
            }

            report.partitions_compacted += 1;
            report.entries_dropped += (input_entries - kept.len()) as u64;
            report.tombstones_dropped += dropped_tombstones.len() as u64;
        }

        self.retire_spent_segments();
        {
            let segments = self.segments.read();
            report.segments_after = segments.len();
            report.bytes_after = segments.values().map(|s| s.file_len()).sum();
        }
        self.recount_ratio();
        *self.last_compaction_at.lock() = Some(self.clock.now());

        info!(
            partitions = report.partitions_compacted,
            segments_before = report.segments_before,
            segments_after = report.segments_after,
            entries_dropped = report.entries_dropped,
            tombstones_dropped = report.tombstones_dropped,
            compression_ratio = self.ratio.ratio(),
            "Compaction complete"
        );
        Ok(report)
    }

    /// Drop empty compaction outputs whose superseded files are gone.
    fn retire_spent_segments(&self) {
        let spent: Vec<u64> = self
            .segments
            .read()
            .values()
            .filter(|reader| is_spent(&self.segments_dir, reader))
            .map(|reader| reader.id())
            .collect();
        if spent.is_empty() {
            return;
        }
        let mut segments = self.segments.write();
        for id in spent {
            if let Some(reader) = segments.remove(&id) {
                debug!(segment = id, "Removing empty segment");
                reader.mark_obsolete();
                self.segment_bytes.fetch_sub(reader.file_len(), Ordering::Relaxed);
            }
        }
    }

    fn check_capacity(&self, needed: u64, wal: &Wal) -> LakeResult<()> {
        let Some(max) = self.max_bytes else {
            return Ok(());
        };
        let used = self.segment_bytes.load(Ordering::Relaxed) + wal.disk_bytes();
        let available = max.saturating_sub(used);
        if needed > available {
            return Err(LakeError::CapacityExceeded { needed, available });
        }
        Ok(())
    }

    fn live_count(&self) -> usize {
        self.index.iter().filter(|e| e.live()).count()
    }

    fn recount_ratio(&self) {
        let (raw, stored) = self
            .index
            .iter()
            .filter(|e| e.live())
            .fold((0u64, 0u64), |(r, s), e| (r + e.raw_len, s + e.stored_len));
        self.ratio.reset(raw, stored);
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn mem_entry_from(partition: Partition, version: u64, created_at_ms: i64, op: WalOp) -> MemEntry {
    match op {
        WalOp::Put { raw_len, data } => MemEntry {
            partition,
            version,
            created_at_ms,
            raw_len,
            tombstone: false,
            data: Arc::from(data),
        },
        WalOp::Delete => MemEntry {
            partition,
            version,
            created_at_ms,
            raw_len: 0,
            tombstone: true,
            data: Arc::from(Vec::new()),
        },
    }
}

/// Make `entry` the newest version of `key` unless something newer is there.
fn install(
    memtable: &DashMap<String, MemEntry>,
    index: &DashMap<String, IndexEntry>,
    ratio: Option<&RatioTracker>,
    key: String,
    entry: MemEntry,
) {
    let indexed = IndexEntry {
        partition: entry.partition,
        version: entry.version,
        tombstone: entry.tombstone,
        raw_len: entry.raw_len,
        stored_len: entry.data.len() as u64,
        location: Location::Memtable,
    };

    {
        let mut slot = memtable.entry(key.clone()).or_insert_with(|| entry.clone());
        if slot.version < entry.version {
            *slot = entry;
        }
    }

    let mut slot = index.entry(key).or_insert_with(|| IndexEntry {
        version: 0,
        ..indexed.clone()
    });
    if slot.version >= indexed.version {
        return;
    }
    if let Some(ratio) = ratio {
        if slot.live() && slot.version > 0 {
            ratio.remove(slot.raw_len, slot.stored_len);
        }
        if indexed.live() {
            ratio.add(indexed.raw_len, indexed.stored_len);
        }
    }
    *slot = indexed;
}

/// Point `location.key` at its new segment position if the index still
/// refers to the same version at a location accepted by `from`.
fn repoint(
    index: &DashMap<String, IndexEntry>,
    location: &EntryLocation,
    segment_id: u64,
    from: impl Fn(&Location) -> bool,
) {
    if let Some(mut entry) = index.get_mut(&location.key) {
        if entry.version == location.version && from(&entry.location) {
            entry.location = Location::Segment {
                id: segment_id,
                offset: location.offset,
                len: location.len,
            };
        }
    }
}

/// An empty segment only matters while a file it supersedes still exists.
fn is_spent(dir: &Path, reader: &SegmentReader) -> bool {
    reader.header().record_count == 0
        && reader
            .header()
            .supersedes
            .iter()
            .all(|id| !segment::segment_path(dir, *id).exists())
}

type LoadedSegments = (BTreeMap<u64, Arc<SegmentReader>>, u64, u64);

/// Verify and load every segment, resolving interrupted compactions.
fn load_segments(dir: &Path, index: &DashMap<String, IndexEntry>) -> LakeResult<LoadedSegments> {
    let (paths, temporaries) = segment::list_segments(dir)?;
    for temp in temporaries {
        warn!(path = ?temp, "Removing incomplete segment left by an interrupted write");
        fs::remove_file(temp)?;
    }

    let mut opened = Vec::with_capacity(paths.len());
    let mut superseded = BTreeSet::new();
    let mut max_id = 0;
    for path in paths {
        let (reader, locations) = segment::open_segment(&path)?;
        superseded.extend(reader.header().supersedes.iter().copied());
        max_id = max_id.max(reader.id());
        opened.push((reader, locations));
    }
    max_id = max_id.max(superseded.iter().copied().max().unwrap_or(0));

    let mut segments = BTreeMap::new();
    let mut max_version = 0;
    for (reader, locations) in opened {
        if superseded.contains(&reader.id()) {
            info!(segment = reader.id(), "Removing segment superseded by a completed compaction");
            reader.mark_obsolete();
            continue;
        }
        for location in locations {
            max_version = max_version.max(location.version);
            let candidate = IndexEntry {
                partition: reader.partition(),
                version: location.version,
                tombstone: location.tombstone,
                raw_len: location.raw_len,
                stored_len: location.stored_len,
                location: Location::Segment {
                    id: reader.id(),
                    offset: location.offset,
                    len: location.len,
                },
            };
            let mut slot = index.entry(location.key).or_insert_with(|| candidate.clone());
            if slot.version < candidate.version {
                *slot = candidate;
            }
        }
        segments.insert(reader.id(), Arc::new(reader));
    }
    segments.retain(|_, reader| {
        if is_spent(dir, reader) {
            reader.mark_obsolete();
            return false;
        }
        true
    });
    Ok((segments, max_id, max_version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tempfile::TempDir;

    fn open(dir: &Path) -> PersistentStore {
        let config = LakeConfig::new(dir).with_memtable_flush_records(1_000);
        PersistentStore::open(&config, Arc::new(SystemClock)).unwrap()
    }

    #[test]
    fn test_put_get_and_versions() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let v1 = store.put(Partition::Code, "a", b"one").unwrap();
        let v2 = store.put(Partition::Code, "a", b"two").unwrap();
        assert!(v2 > v1);
        assert_eq!(store.get("a").unwrap(), b"two");
        assert_eq!(store.version_of("a"), Some(v2));
        assert!(matches!(store.get("missing"), Err(LakeError::NotFound { .. })));
    }

    #[test]
    fn test_delete_leaves_tombstone_until_compaction() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        store.put(Partition::History, "e1", b"event").unwrap();
        store.delete("e1").unwrap();
        assert!(matches!(store.get("e1"), Err(LakeError::NotFound { .. })));
        assert!(matches!(store.delete("e1"), Err(LakeError::NotFound { .. })));
        assert_eq!(store.stats().tombstones, 1);

        let report = store.compact().unwrap();
        assert_eq!(report.tombstones_dropped, 1);
        assert_eq!(store.stats().tombstones, 0);
    }

    #[test]
    fn test_values_survive_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(dir.path());
            store.put(Partition::Code, "flushed", b"in a segment").unwrap();
            assert_eq!(store.flush().unwrap(), 1);
            store.put(Partition::Metadata, "logged", b"only in the wal").unwrap();
            assert_eq!(store.get("flushed").unwrap(), b"in a segment");
        }
        let store = open(dir.path());
        assert_eq!(store.get("flushed").unwrap(), b"in a segment");
        assert_eq!(store.get("logged").unwrap(), b"only in the wal");
        assert_eq!(store.partition_of("logged"), Some(Partition::Metadata));
        let next = store.put(Partition::Code, "new", b"x").unwrap();
        assert!(next > store.version_of("logged").unwrap());
    }

    #[test]
    fn test_compaction_keeps_latest_versions() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        for round in 0..3u8 {
            for i in 0..10 {
                store
                    .put(Partition::Code, &format!("k{}", i), &[round; 64])
                    .unwrap();
            }
            store.flush().unwrap();
        }
        assert_eq!(store.stats().segments, 3);

        let report = store.compact().unwrap();
        assert_eq!(report.segments_after, 1);
        assert_eq!(report.entries_dropped, 20);
        for i in 0..10 {
            assert_eq!(store.get(&format!("k{}", i)).unwrap(), vec![2u8; 64]);
        }
        assert!(store.stats().last_compaction_at.is_some());
    }

    #[test]
    fn test_partition_is_fixed_while_live() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        store.put(Partition::Code, "k", b"v").unwrap();
        assert!(matches!(
            store.put(Partition::Vectors, "k", b"v"),
            Err(LakeError::PartitionMismatch { .. })
        ));
        store.delete("k").unwrap();
        store.put(Partition::Vectors, "k", b"moved").unwrap();
        assert_eq!(store.partition_of("k"), Some(Partition::Vectors));
    }

    #[test]
    fn test_recreated_key_does_not_resurrect_after_compaction() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(dir.path());
            store.put(Partition::Code, "k", b"old").unwrap();
            store.flush().unwrap();
            store.delete("k").unwrap();
            store.put(Partition::Vectors, "k", b"new").unwrap();
            store.flush().unwrap();
            store.delete("k").unwrap();
            store.compact().unwrap();
            store.compact().unwrap();
        }
        let store = open(dir.path());
        assert!(matches!(store.get("k"), Err(LakeError::NotFound { .. })));
    }

    #[test]
    fn test_expected_version() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let v1 = store.put_expected(Partition::Code, "k", b"1", None).unwrap();
        assert!(matches!(
            store.put_expected(Partition::Code, "k", b"2", None),
            Err(LakeError::ConcurrentModification { actual: Some(v), .. }) if v == v1
        ));
        store.put_expected(Partition::Code, "k", b"2", Some(v1)).unwrap();
        assert_eq!(store.get("k").unwrap(), b"2");
    }

    #[test]
    fn test_compression_ratio_reported() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        let text = "pub fn handler(req: Request) -> Response { todo() }\n".repeat(40);
        store.put(Partition::Code, "src", text.as_bytes()).unwrap();
        assert!(store.compression_ratio() > 2.5);
        assert_eq!(store.stats().raw_bytes, text.len() as u64);
    }

    #[test]
    fn test_recent_and_partition_queries() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        store.put(Partition::Code, "c1", b"x").unwrap();
        store.put(Partition::History, "h1", b"x").unwrap();
        store.put(Partition::Code, "c2", b"x").unwrap();
        assert_eq!(store.recent(2), vec!["c2".to_string(), "h1".to_string()]);
        assert_eq!(store.keys_in_partition(Partition::Code), vec!["c1", "c2"]);
        assert_eq!(store.live_keys().len(), 3);
        assert!(store.contains("h1"));
    }

    fn segment_ids(store: &PersistentStore) -> Vec<u64> {
        store.segments.read().keys().copied().collect()
    }

    #[test]
    fn test_interrupted_compaction_resolves_on_open() {
        let dir = TempDir::new().unwrap();
        let segments_dir = dir.path().join(SEGMENTS_DIR);
        let (older, newer, v2) = {
            let store = open(dir.path());
            store.put(Partition::Code, "k1", b"one").unwrap();
            store.put(Partition::Code, "k3", b"doomed").unwrap();
            store.flush().unwrap();
            let v2 = store.put(Partition::Code, "k1", b"two").unwrap();
            store.put(Partition::Code, "k2", b"three").unwrap();
            store.delete("k3").unwrap();
            store.flush().unwrap();

            let ids = segment_ids(&store);
            assert_eq!(ids.len(), 2);
            let merged: Vec<SegmentEntry> = store.segments.read()[&ids[1]]
                .read_all()
                .unwrap()
                .into_iter()
                .filter(|e| !e.tombstone)
                .collect();
            assert_eq!(merged.len(), 2);

            // The merged segment lands, then the process dies before the
            // inputs are unlinked.
            segment::write_segment(&segments_dir, ids[1] + 1, Partition::Code, &merged, ids.clone(), 0)
                .unwrap();
            (ids[0], ids[1], v2)
        };
        assert!(segment::segment_path(&segments_dir, older).exists());
        assert!(segment::segment_path(&segments_dir, newer).exists());

        let store = open(dir.path());
        assert!(!segment::segment_path(&segments_dir, older).exists());
        assert!(!segment::segment_path(&segments_dir, newer).exists());
        assert_eq!(segment_ids(&store), vec![newer + 1]);
        assert_eq!(store.get("k1").unwrap(), b"two");
        assert_eq!(store.version_of("k1"), Some(v2));
        assert_eq!(store.get("k2").unwrap(), b"three");
        assert!(matches!(store.get("k3"), Err(LakeError::NotFound { .. })));
        assert!(store.put(Partition::Code, "k4", b"x").unwrap() > v2);
    }

    #[test]
    fn test_compaction_leaves_no_empty_segment() {
        let dir = TempDir::new().unwrap();
        let segments_dir = dir.path().join(SEGMENTS_DIR);
        {
            let store = open(dir.path());
            store.put(Partition::History, "e1", b"event").unwrap();
            store.flush().unwrap();
            store.delete("e1").unwrap();

            let report = store.compact().unwrap();
            assert_eq!(report.segments_after, 0);
            assert!(segment_ids(&store).is_empty());
            assert_eq!(store.stats().segment_bytes, 0);
            let (files, _) = segment::list_segments(&segments_dir).unwrap();
            assert!(files.is_empty());
        }

        // An empty segment whose inputs are already gone is dropped at open.
        segment::write_segment(&segments_dir, 42, Partition::History, &[], vec![40, 41], 0).unwrap();
        let store = open(dir.path());
        assert!(segment_ids(&store).is_empty());
        assert!(!segment::segment_path(&segments_dir, 42).exists());
        assert!(matches!(store.get("e1"), Err(LakeError::NotFound { .. })));
    }
}
