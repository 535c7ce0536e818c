/// Tier counters and the read-only stats snapshot.
///
/// [`TierCounters`] belongs to one controller instance and is shared by
/// handle; nothing here is process-global. Monitoring gets an immutable
/// [`StatsSnapshot`] value and never a reference into live state.
use crate::types::Partition;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Live counters updated by the controller.
#[derive(Debug)]
pub struct TierCounters {
    hot_hits: AtomicU64,
    hot_misses: AtomicU64,
    promotions: AtomicU64,
    evictions: AtomicU64,
    hot_rejections: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    sync_violations: AtomicU64,
    /// Milliseconds since the epoch; `i64::MIN` until the first sync
    last_sync_ms: AtomicI64,
    opened_at_ms: i64,
}

impl TierCounters {
    pub fn new(opened_at: DateTime<Utc>) -> Self {
        Self {
            hot_hits: AtomicU64::new(0),
            hot_misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            hot_rejections: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            sync_violations: AtomicU64::new(0),
            last_sync_ms: AtomicI64::new(i64::MIN),
            opened_at_ms: opened_at.timestamp_millis(),
        }
    }

    pub fn record_hit(&self) {
        self.hot_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.hot_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_hot_rejection(&self) {
        self.hot_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_violation(&self) {
        self.sync_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self, at: DateTime<Utc>) {
        self.last_sync_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn hot_hits(&self) -> u64 {
        self.hot_hits.load(Ordering::Relaxed)
    }

    pub fn hot_misses(&self) -> u64 {
        self.hot_misses.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn sync_violations(&self) -> u64 {
        self.sync_violations.load(Ordering::Relaxed)
    }

    /// Hits over lookups since open; 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hot_hits();
        let total = hits + self.hot_misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        match self.last_sync_ms.load(Ordering::Relaxed) {
            i64::MIN => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Seconds since the last completed sync (or since open, if none yet).
    pub fn sync_lag_seconds(&self, now: DateTime<Utc>) -> f64 {
        let since = match self.last_sync_ms.load(Ordering::Relaxed) {
            i64::MIN => self.opened_at_ms,
            ms => ms,
        };
        ((now.timestamp_millis() - since).max(0)) as f64 / 1000.0
    }
}

/// Hot-tier occupancy of one partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionUsage {
    pub partition: Partition,
    pub usage_bytes: u64,
    pub capacity_bytes: u64,
    pub records: usize,
}

/// Immutable point-in-time view of both tiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// One entry per partition, in partition order
    pub hot_usage_per_partition: Vec<PartitionUsage>,
    /// Bytes the persistent store occupies on disk
    pub cold_usage_bytes: u64,
    /// Hot hits / (hits + misses) since open
    pub hit_rate: f64,
    /// Seconds since the last completed background sync
    pub sync_lag_seconds: f64,
    /// Uncompressed / compressed bytes of live cold values
    pub compression_ratio: f64,
    pub cold_records: u64,
    pub hot_records: u64,
    pub hot_hits: u64,
    pub hot_misses: u64,
    pub promotions: u64,
    pub evictions: u64,
    pub hot_rejections: u64,
    pub writes: u64,
    pub deletes: u64,
    pub sync_violations: u64,
    pub indexed_vectors: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_compaction_at: Option<DateTime<Utc>>,
    pub taken_at: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Usage entry for `partition`.
    pub fn hot_usage(&self, partition: Partition) -> Option<&PartitionUsage> {
        self.hot_usage_per_partition
            .iter()
            .find(|u| u.partition == partition)
    }

    /// Hot bytes across all partitions.
    pub fn total_hot_bytes(&self) -> u64 {
        self.hot_usage_per_partition
            .iter()
            .map(|u| u.usage_bytes)
            .sum()
    }

    /// JSON rendering for external monitors.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Counter fields that [`StatsSnapshot`] copies verbatim.
pub(crate) struct CounterValues {
    pub hot_hits: u64,
    pub hot_misses: u64,
    pub promotions: u64,
    pub evictions: u64,
    pub hot_rejections: u64,
    pub writes: u64,
    pub deletes: u64,
    pub sync_violations: u64,
}

impl TierCounters {
    pub(crate) fn values(&self) -> CounterValues {
        CounterValues {
            hot_hits: self.hot_hits(),
            hot_misses: self.hot_misses(),
            promotions: self.promotions(),
            evictions: self.evictions(),
            hot_rejections: self.hot_rejections.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            sync_violations: self.sync_violations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_hit_rate() {
        let counters = TierCounters::new(Utc::now());
        assert_eq!(counters.hit_rate(), 0.0);
        counters.record_hit();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        assert!((counters.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sync_lag() {
        let opened = Utc::now();
        let counters = TierCounters::new(opened);
        assert!(counters.last_sync_at().is_none());
        assert_eq!(counters.sync_lag_seconds(opened + Duration::seconds(90)), 90.0);

        counters.record_sync(opened + Duration::seconds(60));
        assert!(counters.last_sync_at().is_some());
        assert_eq!(counters.sync_lag_seconds(opened + Duration::seconds(90)), 30.0);
    }
}
