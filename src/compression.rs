//! Value compression for the cold tier.
//!
//! Values are compressed individually with zstd so a point read only
//! decompresses the entry it needs. The level trades CPU for space; typical
//! text and code payloads land around 2.5-3x at the default level 3.

use crate::error::{LakeError, LakeResult};
use std::sync::atomic::{AtomicU64, Ordering};

/// Compress `data` at `level`.
pub fn compress(data: &[u8], level: i32) -> LakeResult<Vec<u8>> {
    Ok(zstd::bulk::compress(data, level)?)
}

/// Decompress `data`, which must expand to exactly `raw_len` bytes.
pub fn decompress(data: &[u8], raw_len: usize) -> LakeResult<Vec<u8>> {
    let out = zstd::bulk::decompress(data, raw_len)
        .map_err(|e| LakeError::corruption("compressed value", e.to_string()))?;
    if out.len() != raw_len {
        return Err(LakeError::corruption(
            "compressed value",
            format!("expected {} bytes after decompression, got {}", raw_len, out.len()),
        ));
    }
    Ok(out)
}

/// Running raw/stored byte totals for live values.
#[derive(Debug, Default)]
pub struct RatioTracker {
    raw_bytes: AtomicU64,
    stored_bytes: AtomicU64,
}

impl RatioTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a value becoming live.
    pub fn add(&self, raw: u64, stored: u64) {
        self.raw_bytes.fetch_add(raw, Ordering::Relaxed);
        self.stored_bytes.fetch_add(stored, Ordering::Relaxed);
    }

    /// Account for a value being superseded or deleted.
    pub fn remove(&self, raw: u64, stored: u64) {
        saturating_sub(&self.raw_bytes, raw);
        saturating_sub(&self.stored_bytes, stored);
    }

    /// Replace both totals (after a full recount).
    pub fn reset(&self, raw: u64, stored: u64) {
        self.raw_bytes.store(raw, Ordering::Relaxed);
        self.stored_bytes.store(stored, Ordering::Relaxed);
    }

    pub fn raw_bytes(&self) -> u64 {
        self.raw_bytes.load(Ordering::Relaxed)
    }

    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes.load(Ordering::Relaxed)
    }

    /// raw / stored, or 1.0 when nothing is stored.
    pub fn ratio(&self) -> f64 {
        let stored = self.stored_bytes();
        if stored == 0 {
            1.0
        } else {
            self.raw_bytes() as f64 / stored as f64
        }
    }
}

fn saturating_sub(counter: &AtomicU64, by: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(by))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_decompress_inverts_compress(
            payload in proptest::collection::vec(any::<u8>(), 0..4096),
            level in 1i32..=19,
        ) {
            let packed = compress(&payload, level).unwrap();
            let unpacked = decompress(&packed, payload.len()).unwrap();
            prop_assert_eq!(unpacked, payload);
        }
    }

    #[test]
    fn test_repetitive_payload_compresses() {
        let payload = "fn main() { println!(\"hello\"); }\n".repeat(200);
        let packed = compress(payload.as_bytes(), 3).unwrap();
        assert!(packed.len() * 3 < payload.len());
    }

    #[test]
    fn test_wrong_length_is_reported() {
        let packed = compress(b"abcdef", 3).unwrap();
        assert!(decompress(&packed, 3).is_err());
    }

    #[test]
    fn test_ratio_tracker() {
        let tracker = RatioTracker::new();
        assert_eq!(tracker.ratio(), 1.0);
        tracker.add(300, 100);
        assert!((tracker.ratio() - 3.0).abs() < f64::EPSILON);
        tracker.remove(300, 100);
        tracker.remove(1, 1);
        assert_eq!(tracker.raw_bytes(), 0);
        assert_eq!(tracker.ratio(), 1.0);
    }
}
