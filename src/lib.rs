//! # RamLake: Hybrid Tiered Memory Store
//!
//! RamLake keeps recently written and frequently read artifacts (code
//! fragments, embeddings, event history, metadata) in RAM, backed by a
//! durable, compressed, write-ahead-logged store that is the only source of
//! truth.
//!
//! - **Durable first** - a write returns only after it is fsynced to the WAL
//! - **Partitioned RAM tier** - four fixed-capacity partitions, each with its own lock
//! - **Transparent tiers** - reads return identical bytes from RAM or disk
//! - **Vector search** - approximate nearest neighbours across both tiers
//!
//! ## Quick Start
//!
//! ```ignore
//! use ramlake::{LakeConfig, Partition, RamLake};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     ramlake::logging::try_init_from_env();
//!     let lake = RamLake::open(LakeConfig::new("./lake")).await?;
//!
//!     lake.write(Partition::Vectors, "doc-1", b"hello".to_vec(), Some(vec![0.1, 0.9])).await?;
//!     let hits = lake.search(&[0.1, 0.8], 5)?;
//!     println!("{:?}", hits);
//!
//!     println!("{:?}", lake.stats());
//!     lake.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **RamLake API** (`core`) - async handle, background task lifecycle
//! 2. **Hybrid Controller** (`controller`) - write/read/promote/evict, sync and eviction jobs
//! 3. **Hot Store** (`hot`) - the partitioned RAM tier
//! 4. **Persistent Store** (`persistent`) - WAL, segments, compaction, recovery
//! 5. **Vector Index** (`vector`) - HNSW or flat ANN over embeddings
//!
//! A record is never hot-only: it is `Cold` (durable) or `HotAndCold`
//! (durable with a RAM copy), and `Evicting` only while being demoted.

pub mod clock;
pub mod compression;
pub mod config;
pub mod controller;
mod core;
mod error;
pub mod hot;
pub mod logging;
pub mod persistent;
pub mod stats;
pub mod types;
pub mod vector;

// Public API exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LakeConfig, PartitionCapacities, StoreAllocation, VectorBackend, VectorConfig};
pub use controller::{HybridController, JobReport, JobTally};
pub use core::RamLake;
pub use error::{LakeError, LakeResult};
pub use persistent::{ColdStats, CompactionReport};
pub use stats::{PartitionUsage, StatsSnapshot};
pub use types::{Partition, Record, TierState};
pub use vector::{Embedding, SearchHit};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use ramlake::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::LakeConfig;
    pub use crate::core::RamLake;
    pub use crate::error::{LakeError, LakeResult};
    pub use crate::stats::StatsSnapshot;
    pub use crate::types::{Partition, Record, TierState};
    pub use crate::vector::SearchHit;
}
