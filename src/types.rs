/// Common types used throughout RamLake.
///
/// These are the records that move between tiers, the partitions that
/// subdivide the hot tier, and the residency states the controller tracks.
use crate::error::{LakeError, LakeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Longest key accepted by the store, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// A logical category of data.
///
/// Each partition has its own hot-tier capacity and lock. The persistent
/// tier is not capacity-partitioned, but every durable entry is tagged with
/// its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Embedding-heavy records
    Vectors,
    /// Source code fragments
    Code,
    /// Event history
    History,
    /// Relations and other small metadata
    Metadata,
}

impl Partition {
    /// All partitions, in tag order.
    pub const ALL: [Partition; 4] = [
        Partition::Vectors,
        Partition::Code,
        Partition::History,
        Partition::Metadata,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Vectors => "vectors",
            Partition::Code => "code",
            Partition::History => "history",
            Partition::Metadata => "metadata",
        }
    }

    /// Position in [`Partition::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Partition::Vectors => 0,
            Partition::Code => 1,
            Partition::History => 2,
            Partition::Metadata => 3,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Partition {
    type Err = LakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vectors" | "vector" => Ok(Partition::Vectors),
            "code" => Ok(Partition::Code),
            "history" => Ok(Partition::History),
            "metadata" => Ok(Partition::Metadata),
            other => Err(LakeError::InvalidConfig {
                reason: format!("unknown partition '{}'", other),
            }),
        }
    }
}

/// Where a record currently lives.
///
/// There is no hot-only state: a record is acknowledged only once it is
/// durable, so residency is always "cold" or "cold plus a RAM copy".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierState {
    /// Durable only.
    Cold,
    /// Durable and memory-resident.
    HotAndCold,
    /// Being demoted from the hot tier; returns to `Cold`.
    Evicting,
}

impl fmt::Display for TierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierState::Cold => write!(f, "cold"),
            TierState::HotAndCold => write!(f, "hot+cold"),
            TierState::Evicting => write!(f, "evicting"),
        }
    }
}

/// A stored artifact.
///
/// Payload and embedding are `Arc`-wrapped so hot-tier hits and promotions
/// share one allocation instead of copying bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Unique, immutable key
    pub id: String,
    /// Partition this record belongs to
    pub partition: Partition,
    /// Opaque payload
    pub payload: Arc<[u8]>,
    /// Optional embedding used by the vector index
    pub embedding: Option<Arc<[f32]>>,
    /// Store-wide monotonic version of this content
    pub version: u64,
    /// When this version was written
    pub created_at: DateTime<Utc>,
    /// Last time the record was served
    pub last_accessed_at: DateTime<Utc>,
}

impl Record {
    /// Bytes this record occupies in the hot tier.
    ///
    /// Counts key, payload and embedding components (4 bytes each).
    pub fn hot_size(&self) -> u64 {
        let embedding = self.embedding.as_ref().map_or(0, |e| e.len() * 4);
        (self.id.len() + self.payload.len() + embedding) as u64
    }

    /// Payload copied out as a `Vec`.
    pub fn payload_vec(&self) -> Vec<u8> {
        self.payload.to_vec()
    }
}

/// Durable encoding of a record's content.
///
/// The persistent store treats values as opaque bytes; the controller packs
/// payload and embedding together so both survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    /// Optional embedding
    pub embedding: Option<Vec<f32>>,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl RecordEnvelope {
    /// Encode to bytes.
    pub fn encode(&self) -> LakeResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from bytes produced by [`RecordEnvelope::encode`].
    pub fn decode(bytes: &[u8]) -> LakeResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Reject keys that cannot be stored.
pub fn validate_key(key: &str) -> LakeResult<()> {
    if key.is_empty() {
        return Err(LakeError::InvalidKey {
            reason: "key must not be empty".to_string(),
        });
    }
    if key.len() > MAX_KEY_LEN {
        return Err(LakeError::InvalidKey {
            reason: format!("key is {} bytes, limit is {}", key.len(), MAX_KEY_LEN),
        });
    }
    Ok(())
}
