/// Core RamLake handle.
///
/// This module provides the user-facing async API. It wraps the
/// [`HybridController`] so callers never block an async executor on disk:
/// anything that may touch the persistent store runs on Tokio's blocking
/// pool, while hot-tier hits, vector search and stats are answered inline.
///
/// Background sync, eviction and compaction are started explicitly with
/// [`RamLake::start_background`] and stopped with [`RamLake::shutdown`].
use crate::clock::{Clock, SystemClock};
use crate::config::LakeConfig;
use crate::controller::{HybridController, JobReport, Step};
use crate::error::{LakeError, LakeResult};
use crate::persistent::CompactionReport;
use crate::stats::StatsSnapshot;
use crate::types::{Partition, Record, TierState, validate_key};
use crate::vector::SearchHit;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// The main RamLake instance.
///
/// A hybrid tiered store: every write is durable in the persistent tier
/// before it returns, and recently written or read records are also kept in
/// a partitioned RAM tier for fast access.
///
/// # Thread Safety
///
/// `RamLake` is cheap to clone and every clone shares the same store.
///
/// # Example
///
/// ```ignore
/// use ramlake::{LakeConfig, Partition, RamLake};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let lake = RamLake::open(LakeConfig::new("/var/lib/ramlake")).await?;
///     lake.start_background().await;
///
///     lake.write(Partition::Code, "src/main.rs", b"fn main() {}".to_vec(), None).await?;
///     let bytes = lake.read("src/main.rs").await?;
///     assert_eq!(bytes, b"fn main() {}");
///
///     lake.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RamLake {
    controller: Arc<HybridController>,
    background: Arc<Mutex<Option<Background>>>,
}

/// Handles of the running background tasks.
struct Background {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Sync,
    Eviction,
    Compaction,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Sync => "sync",
            Job::Eviction => "eviction",
            Job::Compaction => "compaction",
        }
    }
}

impl std::fmt::Debug for RamLake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamLake")
            .field("controller", &self.controller)
            .field("background", &self.is_background_running())
            .finish()
    }
}

impl RamLake {
    /// Open (or create) a store, running crash recovery first.
    pub async fn open(config: LakeConfig) -> LakeResult<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open with an explicit time source (tests use [`ManualClock`](crate::clock::ManualClock)).
    pub async fn open_with_clock(config: LakeConfig, clock: Arc<dyn Clock>) -> LakeResult<Self> {
        let controller = tokio::task::spawn_blocking(move || HybridController::open(config, clock))
            .await
            .map_err(|e| LakeError::TaskFailed(e.to_string()))??;
        Ok(Self::from_controller(Arc::new(controller)))
    }

    /// Wrap an already opened controller.
    pub fn from_controller(controller: Arc<HybridController>) -> Self {
        Self {
            controller,
            background: Arc::new(Mutex::new(None)),
        }
    }

    /// The underlying controller, for synchronous callers.
    pub fn controller(&self) -> &Arc<HybridController> {
        &self.controller
    }

    async fn blocking<T, F>(&self, f: F) -> LakeResult<T>
    where
        F: FnOnce(&HybridController) -> LakeResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || f(&controller))
            .await
            .map_err(|e| LakeError::TaskFailed(e.to_string()))?
    }

    /// Durably store `payload` under `key` and return its version.
    ///
    /// Resolves once the write is in the WAL and fsynced. Hot-tier residency
    /// is best-effort and never fails the write.
    pub async fn write(
        &self,
        partition: Partition,
        key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        embedding: Option<Vec<f32>>,
    ) -> LakeResult<u64> {
        let key = key.into();
        let payload = payload.into();
        self.blocking(move |c| c.write(partition, &key, &payload, embedding.as_deref()))
            .await
    }

    /// Write only if the key's current version is `expected`
    /// (`None`: the key must not exist).
    pub async fn write_if_version(
        &self,
        partition: Partition,
        key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        embedding: Option<Vec<f32>>,
        expected: Option<u64>,
    ) -> LakeResult<u64> {
        let key = key.into();
        let payload = payload.into();
        self.blocking(move |c| {
            c.write_if_version(partition, &key, &payload, embedding.as_deref(), expected)
        })
        .await
    }

    /// Payload of `key`. Identical bytes whichever tier serves it.
    pub async fn read(&self, key: &str) -> LakeResult<Vec<u8>> {
        self.read_record(key).await.map(|record| record.payload_vec())
    }

    /// The record for `key`, with version and timestamps.
    pub async fn read_record(&self, key: &str) -> LakeResult<Record> {
        validate_key(key)?;
        if let Some(record) = self.controller.read_hot(key) {
            return Ok(record);
        }
        let key = key.to_string();
        self.blocking(move |c| c.read_cold(&key)).await
    }

    /// Up to `k` records whose embeddings are nearest to `query`.
    pub fn search(&self, query: &[f32], k: usize) -> LakeResult<Vec<SearchHit>> {
        self.controller.search(query, k)
    }

    /// Tombstone `key` in every tier.
    pub async fn delete(&self, key: &str) -> LakeResult<u64> {
        let key = key.to_string();
        self.blocking(move |c| c.delete(&key)).await
    }

    /// Read-only snapshot of tier usage and counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.controller.stats()
    }

    pub fn tier_state(&self, key: &str) -> Option<TierState> {
        self.controller.tier_state(key)
    }

    /// Live keys stored under `partition`, sorted.
    pub fn list_partition(&self, partition: Partition) -> Vec<String> {
        self.controller.list_partition(partition)
    }

    /// Compact the persistent store now.
    pub async fn compact(&self) -> LakeResult<CompactionReport> {
        self.blocking(|c| c.compact()).await
    }

    /// Flush buffered cold writes to segment files now.
    pub async fn flush(&self) -> LakeResult<usize> {
        self.blocking(|c| c.flush()).await
    }

    /// Run one full sync pass now.
    pub async fn run_sync(&self) -> LakeResult<JobReport> {
        self.blocking(|c| c.run_sync_pass()).await
    }

    /// Run one full eviction pass now.
    pub async fn run_eviction(&self) -> LakeResult<JobReport> {
        self.blocking(|c| c.run_eviction_pass()).await
    }

    pub fn is_background_running(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Spawn the periodic sync, eviction and compaction tasks.
    ///
    /// Each pass runs in batches on the blocking pool and yields between
    /// them. Calling this while the tasks are already running does nothing.
    pub async fn start_background(&self) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }
        let (shutdown_tx, _) = broadcast::channel(1);
        let config = self.controller.config();
        let jobs = [
            (Job::Sync, config.sync_interval()),
            (Job::Eviction, config.eviction_interval()),
            (Job::Compaction, config.compaction_interval()),
        ];
        let handles = jobs
            .into_iter()
            .map(|(job, period)| {
                spawn_job(
                    Arc::clone(&self.controller),
                    job,
                    period,
                    shutdown_tx.subscribe(),
                )
            })
            .collect();
        *background = Some(Background {
            shutdown_tx,
            handles,
        });
        tracing::info!("Background tasks started");
    }

    /// Stop background tasks, wait for them, and flush the memtable.
    ///
    /// An interrupted pass keeps its checkpoint and resumes next time.
    pub async fn shutdown(&self) -> LakeResult<()> {
        let background = self.background.lock().take();
        if let Some(background) = background {
            let _ = background.shutdown_tx.send(());
            for handle in background.handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Background task ended abnormally");
                }
            }
        }
        self.flush().await?;
        tracing::info!("RamLake shut down");
        Ok(())
    }
}

fn spawn_job(
    controller: Arc<HybridController>,
    job: Job,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !run_pass(&controller, job, &mut shutdown_rx).await {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
        tracing::debug!(job = job.name(), "Background task stopped");
    })
}

/// Drive one pass batch by batch. Returns false if shutdown was requested.
async fn run_pass(
    controller: &Arc<HybridController>,
    job: Job,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> bool {
    loop {
        let c = Arc::clone(controller);
        let step = tokio::task::spawn_blocking(move || match job {
            Job::Sync => c.sync_step(),
            Job::Eviction => c.eviction_step(),
            Job::Compaction => c.compact().map(|report| {
                tracing::debug!(
                    partitions = report.partitions_compacted,
                    dropped = report.entries_dropped,
                    "Scheduled compaction finished"
                );
                Step::Continue
            }),
        })
        .await;

        match step {
            Ok(Ok(Step::Continue)) if matches!(job, Job::Compaction) => return true,
            Ok(Ok(Step::Continue)) => {}
            Ok(Ok(Step::Done(report))) => {
                tracing::debug!(job = job.name(), processed = report.processed, "Pass finished");
                return true;
            }
            Ok(Err(e)) => {
                tracing::error!(job = job.name(), error = %e, "Background pass failed");
                return true;
            }
            Err(e) => {
                tracing::error!(job = job.name(), error = %e, "Background task panicked");
                return true;
            }
        }

        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
            return false;
        }
        tokio::task::yield_now().await;
    }
}
