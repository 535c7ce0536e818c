//! Hybrid Controller: the only component that changes where a record lives.
//!
//! # Write path
//!
//! 1. The persistent store appends the write to its WAL and fsyncs it.
//!    Failure here fails the write, with no hot-tier side effects.
//! 2. The record is inserted into the hot tier. This is best-effort: a
//!    record that does not fit stays cold-only and the write still succeeds.
//! 3. The embedding, if any, is (re)indexed.
//!
//! # Read path
//!
//! Hot hits are served directly. A miss reads the durable copy, returns it,
//! and promotes it on that first read. Promotion is serialized per key and
//! re-checks residency and version under the lock, so concurrent readers
//! converge on a single hot copy.
//!
//! # Residency
//!
//! [`TierState`] is derived, never stored: `Evicting` while a demotion of
//! the id is in progress, otherwise `HotAndCold` if the id is hot-resident
//! and `Cold` if it is only durable.

pub mod jobs;
pub mod locks;

use crate::clock::Clock;
use crate::config::LakeConfig;
use crate::error::LakeResult;
use crate::hot::{HotRejection, HotStore};
use crate::persistent::PersistentStore;
use crate::stats::{PartitionUsage, StatsSnapshot, TierCounters};
use crate::types::{Partition, Record, RecordEnvelope, TierState, validate_key};
use crate::vector::{Embedding, SearchHit, VectorIndex};
use dashmap::DashSet;
use jobs::CheckpointStore;
use locks::KeyLocks;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub use jobs::{EvictionPhase, JobCheckpoint, JobKind, JobReport, JobTally, Step};
pub use locks::KeyGuard;

const JOBS_DIR: &str = "jobs";

/// Orchestrates the persistent store, the hot tier and the vector index.
pub struct HybridController {
    config: LakeConfig,
    clock: Arc<dyn Clock>,
    persistent: PersistentStore,
    hot: HotStore,
    vectors: VectorIndex,
    locks: KeyLocks,
    /// Ids currently being demoted
    evicting: DashSet<String>,
    counters: Arc<TierCounters>,
    checkpoints: CheckpointStore,
    sync_job: Mutex<()>,
    eviction_job: Mutex<()>,
}

impl std::fmt::Debug for HybridController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridController")
            .field("data_dir", &self.config.data_dir)
            .field("hot_records", &self.hot.len())
            .field("indexed_vectors", &self.vectors.len())
            .finish()
    }
}

impl HybridController {
    /// Open the store under `config.data_dir`.
    ///
    /// Runs persistent-store recovery, rebuilds the vector index from the
    /// durable embeddings, then warm-starts the hot tier with the
    /// `warm_start_count` most recently written records.
    pub fn open(config: LakeConfig, clock: Arc<dyn Clock>) -> LakeResult<Self> {
        config.validate()?;
        let persistent = PersistentStore::open(&config, Arc::clone(&clock))?;
        let hot = HotStore::new(&config.partitions, config.retention(), Arc::clone(&clock));
        let vectors = VectorIndex::from_config(&config.vector);
        let checkpoints = CheckpointStore::open(config.data_dir.join(JOBS_DIR))?;
        let counters = Arc::new(TierCounters::new(clock.now()));

        let controller = Self {
            config,
            clock,
            persistent,
            hot,
            vectors,
            locks: KeyLocks::new(),
            evicting: DashSet::new(),
            counters,
            checkpoints,
            sync_job: Mutex::new(()),
            eviction_job: Mutex::new(()),
        };

        let indexed = controller.rebuild_vectors();
        let warmed = controller.warm_start();
        info!(
            path = ?controller.config.data_dir,
            indexed_vectors = indexed,
            warm_started = warmed,
            "RamLake opened"
        );
        Ok(controller)
    }

    fn rebuild_vectors(&self) -> usize {
        let mut indexed = 0;
        for key in self.persistent.live_keys() {
            let embedding = self
                .persistent
                .get_entry(&key)
                .and_then(|stored| RecordEnvelope::decode(&stored.bytes))
                .and_then(|envelope| envelope.embedding.map(Embedding::new).transpose());
            match embedding {
                Ok(Some(embedding)) => match self.vectors.index(&key, embedding) {
                    Ok(()) => indexed += 1,
                    Err(e) => warn!(key = %key, error = %e, "Skipping embedding during rebuild"),
                },
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable record during rebuild"),
            }
        }
        indexed
    }

    fn warm_start(&self) -> usize {
        let count = self.config.warm_start_count;
        if count == 0 {
            return 0;
        }
        let mut warmed = 0;
        // Oldest first, so the newest write ends up most recently used.
        for key in self.persistent.recent(count).into_iter().rev() {
            match self.load_cold(&key) {
                Ok(record) => {
                    if self.insert_hot(record) {
                        warmed += 1;
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping record during warm start"),
            }
        }
        warmed
    }

    /// Durably write `payload` (and optional `embedding`) under `key`.
    ///
    /// Returns the new version once the write is durable.
    pub fn write(
        &self,
        partition: Partition,
        key: &str,
        payload: &[u8],
        embedding: Option<&[f32]>,
    ) -> LakeResult<u64> {
        self.write_inner(partition, key, payload, embedding, None)
    }

    /// Like [`write`](Self::write), but fails with
    /// [`LakeError::ConcurrentModification`](crate::LakeError::ConcurrentModification)
    /// unless the key's current version is `expected` (`None`: must not exist).
    pub fn write_if_version(
        &self,
        partition: Partition,
        key: &str,
        payload: &[u8],
        embedding: Option<&[f32]>,
        expected: Option<u64>,
    ) -> LakeResult<u64> {
        self.write_inner(partition, key, payload, embedding, Some(expected))
    }

    fn write_inner(
        &self,
        partition: Partition,
        key: &str,
        payload: &[u8],
        embedding: Option<&[f32]>,
        expected: Option<Option<u64>>,
    ) -> LakeResult<u64> {
        validate_key(key)?;
        let embedding = embedding.map(|e| self.vectors.check(e)).transpose()?;
        let envelope = RecordEnvelope {
            embedding: embedding.as_ref().map(|e| e.as_slice().to_vec()),
            payload: payload.to_vec(),
        };
        let bytes = envelope.encode()?;

        let _guard = self.locks.lock(key);
        let version = match expected {
            None => self.persistent.put(partition, key, &bytes)?,
            Some(expected) => self.persistent.put_expected(partition, key, &bytes, expected)?,
        };
        self.counters.record_write();

        let now = self.clock.now();
        let record = Record {
            id: key.to_string(),
            partition,
            payload: Arc::from(envelope.payload),
            embedding: embedding.as_ref().map(Embedding::shared),
            version,
            created_at: now,
            last_accessed_at: now,
        };
        self.insert_hot(record);

        match embedding {
            Some(embedding) => {
                if let Err(e) = self.vectors.index(key, embedding) {
                    warn!(key, error = %e, "Embedding not indexed");
                }
            }
            None => {
                self.vectors.remove(key);
            }
        }
        trace!(key, %partition, version, "write");
        Ok(version)
    }

    /// Best-effort hot insertion; a rejection leaves the record cold-only.
    fn insert_hot(&self, record: Record) -> bool {
        let id = record.id.clone();
        match self.hot.put_hot(record) {
            Ok(evicted) => {
                if !evicted.is_empty() {
                    self.counters.record_evictions(evicted.len() as u64);
                    debug!(key = %id, evicted = evicted.len(), "Made room in hot tier");
                }
                true
            }
            Err(HotRejection::TooLarge { size, capacity }) => {
                self.counters.record_hot_rejection();
                debug!(key = %id, size, capacity, "Record larger than its partition; kept cold-only");
                false
            }
        }
    }

    /// Payload of `key`, from whichever tier holds it.
    pub fn read(&self, key: &str) -> LakeResult<Vec<u8>> {
        self.read_record(key).map(|record| record.payload_vec())
    }

    /// The full record for `key`.
    pub fn read_record(&self, key: &str) -> LakeResult<Record> {
        validate_key(key)?;
        match self.read_hot(key) {
            Some(record) => Ok(record),
            None => self.read_cold(key),
        }
    }

    /// Hot-tier lookup only; counts a hit when found.
    pub fn read_hot(&self, key: &str) -> Option<Record> {
        let record = self.hot.get_hot(key)?;
        self.counters.record_hit();
        Some(record)
    }

    /// Durable lookup followed by promotion; counts a miss.
    pub fn read_cold(&self, key: &str) -> LakeResult<Record> {
        self.counters.record_miss();
        let record = self.load_cold(key)?;
        self.promote(record.clone());
        Ok(record)
    }

    fn load_cold(&self, key: &str) -> LakeResult<Record> {
        let stored = self.persistent.get_entry(key)?;
        let envelope = RecordEnvelope::decode(&stored.bytes)?;
        Ok(Record {
            id: stored.key,
            partition: stored.partition,
            payload: Arc::from(envelope.payload),
            embedding: envelope.embedding.map(Arc::from),
            version: stored.version,
            created_at: stored.created_at,
            last_accessed_at: self.clock.now(),
        })
    }

    /// Copy a freshly read cold record into the hot tier.
    ///
    /// Skipped when another reader already promoted it or when a write
    /// landed since `record` was read.
    fn promote(&self, record: Record) -> bool {
        let _guard = self.locks.lock(&record.id);
        if self.hot.contains(&record.id) {
            return false;
        }
        if self.persistent.version_of(&record.id) != Some(record.version) {
            debug!(key = %record.id, "Cold version moved during read; not promoting");
            return false;
        }
        let key = record.id.clone();
        let promoted = self.insert_hot(record);
        if promoted {
            self.counters.record_promotion();
            trace!(key = %key, "promoted");
        }
        promoted
    }

    /// Tombstone `key` and drop it from the hot tier and the vector index.
    pub fn delete(&self, key: &str) -> LakeResult<u64> {
        validate_key(key)?;
        let _guard = self.locks.lock(key);
        let version = self.persistent.delete(key)?;
        self.hot.remove_hot(key);
        self.vectors.remove(key);
        self.counters.record_delete();
        debug!(key, version, "deleted");
        Ok(version)
    }

    /// Nearest live records to `query`.
    ///
    /// Search is eventually consistent: hits are filtered against the
    /// durable tier, but a delete racing this call may still be reported.
    pub fn search(&self, query: &[f32], k: usize) -> LakeResult<Vec<SearchHit>> {
        let mut hits = self.vectors.search(query, k)?;
        hits.retain(|hit| self.persistent.contains(&hit.key));
        Ok(hits)
    }

    /// Demote `key` from the hot tier. Returns the bytes freed, or `None`
    /// if the key was not resident or has no durable copy to fall back on.
    pub fn evict(&self, key: &str) -> LakeResult<Option<u64>> {
        let _guard = self.locks.lock(key);
        let Some(hot) = self.hot.peek(key) else {
            return Ok(None);
        };
        let durable = self.persistent.version_of(key);
        if durable.is_none_or(|d| d < hot.version) {
            warn!(key, hot = hot.version, ?durable, "Refusing to evict a record that is not durable");
            self.counters.record_violation();
            return Ok(None);
        }

        self.evicting.insert(key.to_string());
        let removed = self.hot.remove_version(key, hot.version);
        self.evicting.remove(key);

        if removed {
            self.counters.record_evictions(1);
            trace!(key, "evicted");
            Ok(Some(hot.hot_size()))
        } else {
            Ok(None)
        }
    }

    /// Current residency of `key`; `None` if it does not exist.
    pub fn tier_state(&self, key: &str) -> Option<TierState> {
        if self.evicting.contains(key) {
            Some(TierState::Evicting)
        } else if self.hot.contains(key) {
            Some(TierState::HotAndCold)
        } else if self.persistent.contains(key) {
            Some(TierState::Cold)
        } else {
            None
        }
    }

    /// Live keys stored under `partition`, whatever their residency.
    pub fn list_partition(&self, partition: Partition) -> Vec<String> {
        self.persistent.keys_in_partition(partition)
    }

    /// Point-in-time view of both tiers.
    pub fn stats(&self) -> StatsSnapshot {
        let now = self.clock.now();
        let cold = self.persistent.stats();
        let counters = self.counters.values();
        let hot_usage_per_partition: Vec<PartitionUsage> = self
            .hot
            .pressures()
            .into_iter()
            .map(|p| PartitionUsage {
                partition: p.partition,
                usage_bytes: p.usage_bytes,
                capacity_bytes: p.capacity_bytes,
                records: p.records,
            })
            .collect();
        let hot_records = hot_usage_per_partition
            .iter()
            .map(|u| u.records as u64)
            .sum();

        StatsSnapshot {
            hot_usage_per_partition,
            cold_usage_bytes: cold.disk_bytes,
            hit_rate: self.counters.hit_rate(),
            sync_lag_seconds: self.counters.sync_lag_seconds(now),
            compression_ratio: cold.compression_ratio,
            cold_records: cold.records,
            hot_records,
            hot_hits: counters.hot_hits,
            hot_misses: counters.hot_misses,
            promotions: counters.promotions,
            evictions: counters.evictions,
            hot_rejections: counters.hot_rejections,
            writes: counters.writes,
            deletes: counters.deletes,
            sync_violations: counters.sync_violations,
            indexed_vectors: self.vectors.len() as u64,
            last_sync_at: self.counters.last_sync_at(),
            last_compaction_at: cold.last_compaction_at,
            taken_at: now,
        }
    }

    /// Flush the memtable to segments.
    pub fn flush(&self) -> LakeResult<usize> {
        self.persistent.flush()
    }

    /// Compact the persistent store.
    pub fn compact(&self) -> LakeResult<crate::persistent::CompactionReport> {
        self.persistent.compact()
    }

    pub fn config(&self) -> &LakeConfig {
        &self.config
    }

    pub fn counters(&self) -> &Arc<TierCounters> {
        &self.counters
    }

    pub fn persistent(&self) -> &PersistentStore {
        &self.persistent
    }

    pub fn hot(&self) -> &HotStore {
        &self.hot
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }
}
