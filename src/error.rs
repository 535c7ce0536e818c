/// Error types for RamLake operations.
///
/// Every failure mode a caller can observe is a variant of [`LakeError`].
/// Hot-tier pressure is deliberately absent: the hot tier degrades to
/// cold-only residency instead of failing an operation.
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for RamLake operations.
///
/// All fallible operations return `Result<T, LakeError>`, so callers can
/// pattern-match on the exact failure (for example retrying on
/// [`LakeError::ConcurrentModification`] or freeing space on
/// [`LakeError::CapacityExceeded`]).
#[derive(Error, Debug)]
pub enum LakeError {
    /// Disk-level failure in the persistent store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A checksum or structural check failed while reading durable data.
    #[error("Corruption detected in {location}: {reason}")]
    Corruption {
        /// File (and offset, when known) where the check failed
        location: String,
        /// What did not match
        reason: String,
    },

    /// The persistent store has no room left for the write.
    #[error("Persistent store capacity exceeded: need {needed} bytes, {available} available")]
    CapacityExceeded {
        /// Bytes the rejected write would have consumed
        needed: u64,
        /// Bytes still available under the configured cap
        available: u64,
    },

    /// Key does not exist (or has been deleted).
    #[error("Key '{key}' not found")]
    NotFound {
        /// The key that was queried
        key: String,
    },

    /// A conditional write observed a different version than expected.
    #[error(
        "Concurrent modification of '{key}': expected version {expected:?}, found {actual:?}"
    )]
    ConcurrentModification {
        /// The key being written
        key: String,
        /// Version the caller based its write on
        expected: Option<u64>,
        /// Version currently durable
        actual: Option<u64>,
    },

    /// The write-ahead log failed its integrity check during recovery.
    ///
    /// This is fatal: the store refuses to open rather than guess at a
    /// plausible recovered state.
    #[error("Write-ahead log {path:?} failed integrity check at offset {offset}: {reason}")]
    WalIntegrity {
        /// WAL generation file
        path: PathBuf,
        /// Byte offset of the failing frame
        offset: u64,
        /// What failed
        reason: String,
    },

    /// A live key was written under a partition other than its own.
    #[error("Key '{key}' belongs to partition '{existing}', not '{requested}'")]
    PartitionMismatch {
        /// The key being written
        key: String,
        /// Partition the key currently lives in
        existing: String,
        /// Partition the caller asked for
        requested: String,
    },

    /// The key is not acceptable (empty or too long).
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected
        reason: String,
    },

    /// The embedding is empty, non-finite or of the wrong dimension.
    #[error("Invalid embedding: {reason}")]
    InvalidEmbedding {
        /// Why the embedding was rejected
        reason: String,
    },

    /// Configuration failed validation.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Which option is wrong and why
        reason: String,
    },

    /// Binary encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A blocking or background task panicked or was cancelled.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl LakeError {
    /// Shorthand for a [`LakeError::NotFound`].
    pub fn not_found(key: impl Into<String>) -> Self {
        LakeError::NotFound { key: key.into() }
    }

    /// Shorthand for a [`LakeError::Corruption`].
    pub fn corruption(location: impl Into<String>, reason: impl Into<String>) -> Self {
        LakeError::Corruption {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may succeed by retrying the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LakeError::CapacityExceeded { .. } | LakeError::ConcurrentModification { .. }
        )
    }
}

/// Result type alias for RamLake operations.
pub type LakeResult<T> = Result<T, LakeError>;
