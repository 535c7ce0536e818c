/// Background sync and eviction as resumable, batch-limited jobs.
///
/// A job never runs as one long loop. Each call to a `*_step` method does
/// at most one batch, then writes the job's checkpoint (the last id it
/// processed, plus running totals) to `jobs/<name>.json`. A run that is
/// cancelled or crashes picks up after that id the next time a step runs.
/// The checkpoint is deleted when a pass completes.
///
/// Steps are idempotent: re-running a batch whose checkpoint write was lost
/// only re-checks records that are already consistent.
use super::HybridController;
use crate::error::{LakeError, LakeResult};
use crate::hot::EvictionReason;
use crate::types::{Partition, RecordEnvelope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Which background job a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Sync,
    Eviction,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Eviction => "eviction",
        }
    }
}

/// Eviction works through each partition in two phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPhase {
    /// Records past the retention window
    Retention,
    /// Least recently used records while over the high watermark
    Pressure,
}

/// Running totals of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTally {
    /// Hot records compared against the durable tier
    pub checked: u64,
    /// Hot copies dropped because the durable version moved on
    pub dropped_stale: u64,
    /// Hot-only records written back to the durable tier
    pub flushed: u64,
    pub violations: u64,
    pub evicted_expired: u64,
    pub evicted_lru: u64,
    pub bytes_freed: u64,
    /// Eviction candidates left in place (already gone or not durable)
    pub skipped: u64,
}

/// Persisted progress of an unfinished pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    /// Eviction only: partition being worked on
    pub partition: Option<Partition>,
    /// Eviction only: phase within `partition`
    pub phase: Option<EvictionPhase>,
    /// Eviction only: the pressure phase has started draining
    #[serde(default)]
    pub draining: bool,
    /// Last id handled
    pub last_id: Option<String>,
    pub processed: u64,
    pub batches: u64,
    pub tally: JobTally,
}

impl JobCheckpoint {
    pub fn fresh(job: JobKind, started_at: DateTime<Utc>) -> Self {
        let (partition, phase) = match job {
            JobKind::Sync => (None, None),
            JobKind::Eviction => (Some(Partition::ALL[0]), Some(EvictionPhase::Retention)),
        };
        Self {
            job,
            started_at,
            partition,
            phase,
            draining: false,
            last_id: None,
            processed: 0,
            batches: 0,
            tally: JobTally::default(),
        }
    }

    fn report(self, finished_at: DateTime<Utc>) -> JobReport {
        JobReport {
            job: self.job,
            started_at: self.started_at,
            finished_at,
            processed: self.processed,
            batches: self.batches,
            tally: self.tally,
        }
    }
}

/// Summary of a completed pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: u64,
    pub batches: u64,
    pub tally: JobTally,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// More batches remain; the checkpoint has been saved.
    Continue,
    /// The pass finished and its checkpoint was cleared.
    Done(JobReport),
}

/// Checkpoint files under one directory.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> LakeResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, job: JobKind) -> PathBuf {
        self.dir.join(format!("{}.json", job.name()))
    }

    /// Saved checkpoint for `job`, if any.
    ///
    /// An unreadable checkpoint is discarded with a warning: the pass starts
    /// over, which only costs repeated (idempotent) work.
    pub fn load(&self, job: JobKind) -> LakeResult<Option<JobCheckpoint>> {
        let path = self.path(job);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<JobCheckpoint>(&bytes) {
            Ok(checkpoint) if checkpoint.job == job => Ok(Some(checkpoint)),
            Ok(_) | Err(_) => {
                warn!(path = ?path, "Discarding unreadable job checkpoint");
                Ok(None)
            }
        }
    }

    /// Atomically replace the checkpoint for `checkpoint.job`.
    pub fn save(&self, checkpoint: &JobCheckpoint) -> LakeResult<()> {
        let path = self.path(checkpoint.job);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(io::Error::from)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn clear(&self, job: JobKind) -> LakeResult<()> {
        match fs::remove_file(self.path(job)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl HybridController {
    fn checkpoint_or_fresh(&self, job: JobKind) -> LakeResult<JobCheckpoint> {
        Ok(self
            .checkpoints
            .load(job)?
            .unwrap_or_else(|| JobCheckpoint::fresh(job, self.clock.now())))
    }

    /// One batch of the sync pass.
    ///
    /// Walks hot-resident ids in id order. A hot copy older than the durable
    /// version is dropped; a hot copy with no durable counterpart (or a newer
    /// one) is an invariant violation: it is logged and written back. When no
    /// ids remain, the memtable is flushed to segments and the pass is done.
    pub fn sync_step(&self) -> LakeResult<Step> {
        let _job = self.sync_job.lock();
        let mut checkpoint = self.checkpoint_or_fresh(JobKind::Sync)?;
        let batch = self
            .hot
            .ids_after(checkpoint.last_id.as_deref(), self.config.job_batch_size);

        if batch.is_empty() {
            self.persistent.flush()?;
            let now = self.clock.now();
            self.counters.record_sync(now);
            self.checkpoints.clear(JobKind::Sync)?;
            let report = checkpoint.report(now);
            info!(
                checked = report.tally.checked,
                dropped_stale = report.tally.dropped_stale,
                violations = report.tally.violations,
                batches = report.batches,
                "Sync pass complete"
            );
            return Ok(Step::Done(report));
        }

        for id in batch {
            self.sync_one(&id, &mut checkpoint.tally)?;
            checkpoint.processed += 1;
            checkpoint.last_id = Some(id);
        }
        checkpoint.batches += 1;
        self.checkpoints.save(&checkpoint)?;
        Ok(Step::Continue)
    }

    fn sync_one(&self, id: &str, tally: &mut JobTally) -> LakeResult<()> {
        let _guard = self.locks.lock(id);
        let Some(hot) = self.hot.peek(id) else {
            return Ok(());
        };
        tally.checked += 1;

        match self.persistent.version_of(id) {
            Some(durable) if durable == hot.version => {}
            Some(durable) if durable > hot.version => {
                debug!(key = id, hot = hot.version, durable, "Dropping stale hot copy");
                self.hot.remove_version(id, hot.version);
                tally.dropped_stale += 1;
            }
            durable => {
                warn!(
                    key = id,
                    hot = hot.version,
                    ?durable,
                    "Hot record has no durable counterpart; writing it back"
                );
                self.counters.record_violation();
                tally.violations += 1;

                let envelope = RecordEnvelope {
                    embedding: hot.embedding.as_ref().map(|e| e.to_vec()),
                    payload: hot.payload.to_vec(),
                };
                match self.persistent.put(hot.partition, id, &envelope.encode()?) {
                    Ok(version) => {
                        let mut record = hot;
                        record.version = version;
                        self.insert_hot(record);
                        tally.flushed += 1;
                    }
                    Err(LakeError::PartitionMismatch { .. }) => {
                        // The durable record wins; the hot copy is unusable.
                        self.hot.remove_version(id, hot.version);
                        tally.dropped_stale += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Run the sync pass to completion, resuming any saved checkpoint.
    pub fn run_sync_pass(&self) -> LakeResult<JobReport> {
        loop {
            if let Step::Done(report) = self.sync_step()? {
                return Ok(report);
            }
        }
    }

    /// One batch of the eviction pass.
    ///
    /// Partitions are visited in order. In each, expired records go first;
    /// then, if utilisation is above the high watermark, least recently used
    /// records are demoted until it is at or below the low watermark.
    pub fn eviction_step(&self) -> LakeResult<Step> {
        let _job = self.eviction_job.lock();
        let mut checkpoint = self.checkpoint_or_fresh(JobKind::Eviction)?;
        let limit = self.config.job_batch_size;

        let Some(partition) = checkpoint.partition else {
            return self.finish_eviction(checkpoint);
        };

        let (candidates, reason) = match checkpoint.phase.unwrap_or(EvictionPhase::Retention) {
            EvictionPhase::Retention => {
                let expired = match self.hot.retention_cutoff() {
                    Some(cutoff) => self.hot.expired(partition, cutoff, limit),
                    None => Vec::new(),
                };
                (expired, EvictionReason::Expired)
            }
            EvictionPhase::Pressure => {
                let pressure = self.hot.pressure(partition);
                let high = self.config.eviction_high_watermark;
                if pressure.utilization() > high {
                    checkpoint.draining = true;
                }
                let target =
                    (pressure.capacity_bytes as f64 * self.config.eviction_low_watermark) as u64;
                let excess = pressure.usage_bytes.saturating_sub(target);
                let victims = if checkpoint.draining && excess > 0 {
                    self.hot.lru_victims(partition, excess, limit)
                } else {
                    Vec::new()
                };
                (victims, EvictionReason::LeastRecentlyUsed)
            }
        };

        let mut evicted_any = false;
        for id in candidates {
            match self.evict(&id)? {
                Some(bytes) => {
                    evicted_any = true;
                    checkpoint.tally.bytes_freed += bytes;
                    match reason {
                        EvictionReason::Expired => checkpoint.tally.evicted_expired += 1,
                        EvictionReason::LeastRecentlyUsed => checkpoint.tally.evicted_lru += 1,
                    }
                }
                None => checkpoint.tally.skipped += 1,
            }
            checkpoint.processed += 1;
            checkpoint.last_id = Some(id);
        }

        // A batch that freed nothing ends its phase, so undemotable records
        // cannot stall the pass.
        if !evicted_any {
            advance(&mut checkpoint);
        }
        checkpoint.batches += 1;
        self.checkpoints.save(&checkpoint)?;
        Ok(Step::Continue)
    }

    fn finish_eviction(&self, checkpoint: JobCheckpoint) -> LakeResult<Step> {
        self.checkpoints.clear(JobKind::Eviction)?;
        let report = checkpoint.report(self.clock.now());
        info!(
            expired = report.tally.evicted_expired,
            lru = report.tally.evicted_lru,
            bytes_freed = report.tally.bytes_freed,
            batches = report.batches,
            "Eviction pass complete"
        );
        Ok(Step::Done(report))
    }

    /// Run the eviction pass to completion, resuming any saved checkpoint.
    pub fn run_eviction_pass(&self) -> LakeResult<JobReport> {
        loop {
            if let Step::Done(report) = self.eviction_step()? {
                return Ok(report);
            }
        }
    }
}

fn advance(checkpoint: &mut JobCheckpoint) {
    checkpoint.last_id = None;
    checkpoint.draining = false;
    match checkpoint.phase {
        Some(EvictionPhase::Retention) => checkpoint.phase = Some(EvictionPhase::Pressure),
        _ => {
            let next = checkpoint
                .partition
                .and_then(|p| Partition::ALL.get(p.index() + 1).copied());
            checkpoint.partition = next;
            checkpoint.phase = next.map(|_| EvictionPhase::Retention);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LakeConfig;
    use chrono::Duration;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn controller(dir: &TempDir, clock: Arc<ManualClock>, batch: usize) -> HybridController {
        let mut config = LakeConfig::new(dir.path());
        config.job_batch_size = batch;
        HybridController::open(config, clock).unwrap()
    }

    #[test]
    fn test_checkpoint_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("jobs")).unwrap();
        assert!(store.load(JobKind::Sync).unwrap().is_none());

        let mut checkpoint = JobCheckpoint::fresh(JobKind::Sync, Utc::now());
        checkpoint.last_id = Some("k42".to_string());
        checkpoint.processed = 42;
        store.save(&checkpoint).unwrap();
        assert_eq!(store.load(JobKind::Sync).unwrap(), Some(checkpoint));
        assert!(store.load(JobKind::Eviction).unwrap().is_none());

        store.clear(JobKind::Sync).unwrap();
        store.clear(JobKind::Sync).unwrap();
        assert!(store.load(JobKind::Sync).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_checkpoint_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("eviction.json"), b"{ not json").unwrap();
        assert!(store.load(JobKind::Eviction).unwrap().is_none());
    }

    #[test]
    fn test_sync_resumes_without_reprocessing() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let lake = controller(&dir, clock, 2);
        for key in ["a", "b", "c", "d", "e"] {
            lake.write(Partition::Code, key, b"body", None).unwrap();
        }

        assert_eq!(lake.sync_step().unwrap(), Step::Continue);
        let saved = lake.checkpoints.load(JobKind::Sync).unwrap().unwrap();
        assert_eq!(saved.last_id.as_deref(), Some("b"));
        assert_eq!(saved.processed, 2);

        let report = lake.run_sync_pass().unwrap();
        assert_eq!(report.processed, 5);
        assert_eq!(report.tally.checked, 5);
        assert_eq!(report.tally.violations, 0);
        assert!(lake.checkpoints.load(JobKind::Sync).unwrap().is_none());
        assert!(lake.counters.last_sync_at().is_some());
    }

    #[test]
    fn test_sync_checkpoint_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        {
            let lake = controller(&dir, clock.clone(), 1);
            lake.write(Partition::Code, "a", b"x", None).unwrap();
            lake.write(Partition::Code, "b", b"y", None).unwrap();
            assert_eq!(lake.sync_step().unwrap(), Step::Continue);
        }
        let lake = controller(&dir, clock, 1);
        let saved = lake.checkpoints.load(JobKind::Sync).unwrap().unwrap();
        assert_eq!(saved.last_id.as_deref(), Some("a"));
        let report = lake.run_sync_pass().unwrap();
        assert_eq!(report.processed, 1);
    }

    #[test]
    fn test_eviction_pass_demotes_expired_records() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let lake = controller(&dir, clock.clone(), 3);
        for i in 0..10 {
            lake.write(Partition::History, &format!("event-{}", i), b"payload", None)
                .unwrap();
        }
        assert_eq!(lake.hot.len(), 10);

        clock.advance(Duration::hours(25));
        let report = lake.run_eviction_pass().unwrap();
        assert_eq!(report.tally.evicted_expired, 10);
        assert!(lake.hot.is_empty());
        assert_eq!(lake.read("event-3").unwrap(), b"payload");
        assert!(lake.checkpoints.load(JobKind::Eviction).unwrap().is_none());
    }

    #[test]
    fn test_eviction_drains_to_low_watermark() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let mut config = LakeConfig::new(dir.path()).with_capacity(Partition::Code, 1_000);
        config.job_batch_size = 4;
        config.eviction_high_watermark = 0.9;
        config.eviction_low_watermark = 0.5;
        let lake = HybridController::open(config, clock).unwrap();

        // 95 records of 10 bytes: 95% full
        for i in 0..95 {
            lake.write(Partition::Code, &format!("k{:03}", i), b"123456", None)
                .unwrap();
        }
        assert_eq!(lake.hot.pressure(Partition::Code).usage_bytes, 950);

        let report = lake.run_eviction_pass().unwrap();
        assert_eq!(report.tally.evicted_lru, 45);
        assert_eq!(lake.hot.pressure(Partition::Code).usage_bytes, 500);
        assert!(!lake.hot.contains("k000"));
        assert!(lake.hot.contains("k094"));
    }

    #[test]
    fn test_advance_walks_all_partitions() {
        let mut checkpoint = JobCheckpoint::fresh(JobKind::Eviction, Utc::now());
        let mut visited = Vec::new();
        while let Some(partition) = checkpoint.partition {
            visited.push((partition, checkpoint.phase));
            advance(&mut checkpoint);
        }
        assert_eq!(visited.len(), 8);
        assert_eq!(visited[1], (Partition::Vectors, Some(EvictionPhase::Pressure)));
        assert_eq!(visited[7], (Partition::Metadata, Some(EvictionPhase::Pressure)));
    }
}
