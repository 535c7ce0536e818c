//! Configuration for a RamLake instance.
//!
//! Every option has a sensible default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! data_dir = "/var/lib/ramlake"
//! retention_hours = 24
//! sync_interval_seconds = 300
//! compression_level = 3
//! warm_start_count = 1000
//!
//! [partitions]
//! vectors = 67108864
//! code = 134217728
//! history = 33554432
//! metadata = 16777216
//!
//! [vector]
//! m = 16
//! dimensions = 384
//! ```

use crate::error::{LakeError, LakeResult};
use crate::types::Partition;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted retention window (1000 years).
pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 1000;

/// Longest accepted background interval (one year).
pub const MAX_INTERVAL_SECONDS: u64 = 60 * 60 * 24 * 365;

/// Hot-tier capacity of each partition, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionCapacities {
    pub vectors: u64,
    pub code: u64,
    pub history: u64,
    pub metadata: u64,
}

impl PartitionCapacities {
    /// Same capacity for every partition.
    pub fn uniform(capacity_bytes: u64) -> Self {
        Self {
            vectors: capacity_bytes,
            code: capacity_bytes,
            history: capacity_bytes,
            metadata: capacity_bytes,
        }
    }

    /// Split a total hot-tier budget according to `allocation`.
    pub fn from_allocation(total_bytes: u64, allocation: &StoreAllocation) -> LakeResult<Self> {
        allocation.validate()?;
        let share = |fraction: f64| (total_bytes as f64 * fraction).round() as u64;
        Ok(Self {
            vectors: share(allocation.vectors),
            code: share(allocation.code),
            history: share(allocation.history),
            metadata: share(allocation.metadata),
        })
    }

    /// Capacity of one partition.
    pub fn get(&self, partition: Partition) -> u64 {
        match partition {
            Partition::Vectors => self.vectors,
            Partition::Code => self.code,
            Partition::History => self.history,
            Partition::Metadata => self.metadata,
        }
    }

    /// Set the capacity of one partition.
    pub fn set(&mut self, partition: Partition, capacity_bytes: u64) {
        match partition {
            Partition::Vectors => self.vectors = capacity_bytes,
            Partition::Code => self.code = capacity_bytes,
            Partition::History => self.history = capacity_bytes,
            Partition::Metadata => self.metadata = capacity_bytes,
        }
    }

    /// Sum over all partitions.
    pub fn total(&self) -> u64 {
        Partition::ALL.iter().map(|p| self.get(*p)).sum()
    }
}

impl Default for PartitionCapacities {
    fn default() -> Self {
        // 256 MiB split like the default allocation
        Self {
            vectors: 80_530_636,
            code: 107_374_182,
            history: 53_687_091,
            metadata: 26_843_545,
        }
    }
}

/// Fractional split of a total hot-tier budget across partitions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreAllocation {
    pub vectors: f64,
    pub code: f64,
    pub history: f64,
    pub metadata: f64,
}

impl Default for StoreAllocation {
    fn default() -> Self {
        Self {
            vectors: 0.3,
            code: 0.4,
            history: 0.2,
            metadata: 0.1,
        }
    }
}

impl StoreAllocation {
    /// Fractions must be non-negative and sum to 1.0.
    pub fn validate(&self) -> LakeResult<()> {
        let parts = [self.vectors, self.code, self.history, self.metadata];
        if parts.iter().any(|f| !f.is_finite() || *f < 0.0) {
            return Err(LakeError::InvalidConfig {
                reason: "allocation fractions must be finite and non-negative".to_string(),
            });
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > 0.001 {
            return Err(LakeError::InvalidConfig {
                reason: format!("allocation must sum to 1.0, got {}", sum),
            });
        }
        Ok(())
    }
}

/// Which ANN structure backs the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// Hierarchical navigable small world graph
    #[default]
    Hnsw,
    /// Brute-force scan (exact, for small collections)
    Flat,
}

/// Vector index options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Which index structure to use
    pub backend: VectorBackend,
    /// Maximum connections per HNSW node
    pub m: usize,
    /// Candidate list size while inserting
    pub ef_construction: usize,
    /// Candidate list size while searching
    pub ef_search: usize,
    /// Required embedding dimension; `None` locks to the first one indexed
    pub dimensions: Option<usize>,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Hnsw,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            dimensions: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LakeConfig {
    /// Directory holding the WAL, segments and job checkpoints
    pub data_dir: PathBuf,
    /// Hot-tier capacity per partition
    pub partitions: PartitionCapacities,
    /// Hot residency is not guaranteed past this age
    pub retention_hours: u64,
    /// Period of the background sync pass
    pub sync_interval_seconds: u64,
    /// Period of the background eviction pass
    pub eviction_interval_seconds: u64,
    /// Period of background compaction
    pub compaction_interval_seconds: u64,
    /// zstd level used for cold-tier values (1..=22)
    pub compression_level: i32,
    /// Most recently written records to load into RAM at startup
    pub warm_start_count: usize,
    /// Optional cap on cold-tier disk usage
    pub max_cold_bytes: Option<u64>,
    /// Memtable entries that trigger a flush to a segment
    pub memtable_flush_records: usize,
    /// Records handled per background batch
    pub job_batch_size: usize,
    /// Partition utilisation that triggers LRU eviction
    pub eviction_high_watermark: f64,
    /// Utilisation LRU eviction drains down to
    pub eviction_low_watermark: f64,
    /// Vector index options
    pub vector: VectorConfig,
}

impl Default for LakeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("ramlake-data"),
            partitions: PartitionCapacities::default(),
            retention_hours: 24,
            sync_interval_seconds: 300,
            eviction_interval_seconds: 60,
            compaction_interval_seconds: 3600,
            compression_level: 3,
            warm_start_count: 0,
            max_cold_bytes: None,
            memtable_flush_records: 4096,
            job_batch_size: 256,
            eviction_high_watermark: 0.95,
            eviction_low_watermark: 0.85,
            vector: VectorConfig::default(),
        }
    }
}

impl LakeConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> LakeResult<Self> {
        let config: LakeConfig = toml::from_str(source).map_err(|e| LakeError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> LakeResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> LakeResult<String> {
        toml::to_string_pretty(self).map_err(|e| LakeError::InvalidConfig {
            reason: e.to_string(),
        })
    }

    /// Builder: set one partition's capacity.
    pub fn with_capacity(mut self, partition: Partition, capacity_bytes: u64) -> Self {
        self.partitions.set(partition, capacity_bytes);
        self
    }

    /// Builder: set the retention window.
    pub fn with_retention_hours(mut self, hours: u64) -> Self {
        self.retention_hours = hours;
        self
    }

    /// Builder: set the warm-start count.
    pub fn with_warm_start(mut self, count: usize) -> Self {
        self.warm_start_count = count;
        self
    }

    /// Builder: set the memtable flush threshold.
    pub fn with_memtable_flush_records(mut self, records: usize) -> Self {
        self.memtable_flush_records = records;
        self
    }

    /// Builder: cap cold-tier disk usage.
    pub fn with_max_cold_bytes(mut self, bytes: u64) -> Self {
        self.max_cold_bytes = Some(bytes);
        self
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.min(MAX_RETENTION_HOURS) as i64)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds.min(MAX_INTERVAL_SECONDS))
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_seconds.min(MAX_INTERVAL_SECONDS))
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_seconds.min(MAX_INTERVAL_SECONDS))
    }

    /// Check every option; the first problem found is reported.
    pub fn validate(&self) -> LakeResult<()> {
        let invalid = |reason: String| Err(LakeError::InvalidConfig { reason });

        for partition in Partition::ALL {
            if self.partitions.get(partition) == 0 {
                return invalid(format!("partition '{}' has zero capacity", partition));
            }
        }
        if !(1..=MAX_RETENTION_HOURS).contains(&self.retention_hours) {
            return invalid(format!(
                "retention_hours must be within 1..={}, got {}",
                MAX_RETENTION_HOURS, self.retention_hours
            ));
        }
        for (name, seconds) in [
            ("sync_interval_seconds", self.sync_interval_seconds),
            ("eviction_interval_seconds", self.eviction_interval_seconds),
            ("compaction_interval_seconds", self.compaction_interval_seconds),
        ] {
            if !(1..=MAX_INTERVAL_SECONDS).contains(&seconds) {
                return invalid(format!(
                    "{} must be within 1..={}, got {}",
                    name, MAX_INTERVAL_SECONDS, seconds
                ));
            }
        }
        if !(1..=22).contains(&self.compression_level) {
            return invalid(format!(
                "compression_level must be within 1..=22, got {}",
                self.compression_level
            ));
        }
        if self.memtable_flush_records == 0 {
            return invalid("memtable_flush_records must be positive".to_string());
        }
        if self.job_batch_size == 0 {
            return invalid("job_batch_size must be positive".to_string());
        }
        let (low, high) = (self.eviction_low_watermark, self.eviction_high_watermark);
        if !(0.0 < low && low < high && high <= 1.0) {
            return invalid(format!(
                "watermarks must satisfy 0 < low < high <= 1, got low={} high={}",
                low, high
            ));
        }
        if self.vector.m < 2 {
            return invalid("vector.m must be at least 2".to_string());
        }
        if self.vector.ef_construction == 0 || self.vector.ef_search == 0 {
            return invalid("vector ef parameters must be positive".to_string());
        }
        if self.vector.dimensions == Some(0) {
            return invalid("vector.dimensions must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LakeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retention_hours, 24);
        assert_eq!(config.sync_interval_seconds, 300);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = LakeConfig::from_toml_str("").unwrap();
        assert_eq!(config, LakeConfig::default());
    }

    #[test]
    fn test_toml_overrides() {
        let config = LakeConfig::from_toml_str(
            r#"
            data_dir = "/tmp/lake"
            retention_hours = 2
            compression_level = 9
            warm_start_count = 50

            [partitions]
            code = 4096

            [vector]
            backend = "flat"
            dimensions = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/lake"));
        assert_eq!(config.retention_hours, 2);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.warm_start_count, 50);
        assert_eq!(config.partitions.code, 4096);
        assert_eq!(
            config.partitions.vectors,
            PartitionCapacities::default().vectors
        );
        assert_eq!(config.vector.backend, VectorBackend::Flat);
        assert_eq!(config.vector.dimensions, Some(8));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = LakeConfig::new("/data").with_capacity(Partition::History, 1234);
        let text = config.to_toml_string().unwrap();
        assert_eq!(LakeConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = LakeConfig::default();
        config.compression_level = 40;
        assert!(matches!(
            config.validate(),
            Err(LakeError::InvalidConfig { .. })
        ));

        let config = LakeConfig::default().with_capacity(Partition::Metadata, 0);
        assert!(config.validate().is_err());

        let mut config = LakeConfig::default();
        config.eviction_low_watermark = 0.99;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_time_bounds() {
        let longest = LakeConfig::default().with_retention_hours(MAX_RETENTION_HOURS);
        assert!(longest.validate().is_ok());
        assert_eq!(longest.retention(), chrono::Duration::hours(MAX_RETENTION_HOURS as i64));

        for hours in [0, MAX_RETENTION_HOURS + 1, 3_000_000_000, u64::MAX] {
            let config = LakeConfig::default().with_retention_hours(hours);
            assert!(
                matches!(config.validate(), Err(LakeError::InvalidConfig { .. })),
                "retention_hours {} accepted",
                hours
            );
        }

        let mut config = LakeConfig::default();
        config.sync_interval_seconds = MAX_INTERVAL_SECONDS;
        assert!(config.validate().is_ok());
        config.eviction_interval_seconds = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.eviction_interval(), Duration::from_secs(MAX_INTERVAL_SECONDS));

        let mut config = LakeConfig::default();
        config.compaction_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allocation_split() {
        let caps = PartitionCapacities::from_allocation(1000, &StoreAllocation::default()).unwrap();
        assert_eq!(caps.vectors, 300);
        assert_eq!(caps.code, 400);
        assert_eq!(caps.history, 200);
        assert_eq!(caps.metadata, 100);

        let skewed = StoreAllocation {
            vectors: 0.5,
            code: 0.5,
            history: 0.5,
            metadata: 0.0,
        };
        assert!(PartitionCapacities::from_allocation(1000, &skewed).is_err());
    }
}
