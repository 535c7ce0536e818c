/// Per-key mutual exclusion.
///
/// Writes, promotions, evictions and deletes of the same id are serialized
/// through one lock per key. Unrelated keys never share a lock. Entries are
/// created on demand and reclaimed once nobody holds or waits on them, so
/// the table only grows with the number of keys currently in flight.
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;

/// Table of per-key locks.
#[derive(Debug, Default)]
pub struct KeyLocks {
    table: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        // Cloned while the shard is locked, so reclamation cannot race it.
        Arc::clone(
            self.table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Block until `key` is exclusively ours.
    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        let guard = self.slot(key).lock_arc();
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn reclaim(&self, key: &str) {
        self.table
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
    }

    /// Keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Exclusive hold on one key; released on drop.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.reclaim(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_entries_are_reclaimed() {
        let locks = KeyLocks::new();
        {
            let guard = locks.lock("a");
            assert_eq!(guard.key(), "a");
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let a = locks.lock("a");
        let b = locks.lock("b");
        assert_eq!(locks.len(), 2);
        drop(a);
        assert_eq!(locks.len(), 1);
        drop(b);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _guard = locks.lock("shared");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(locks.is_empty());
    }
}
