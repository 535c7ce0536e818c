/// Hot Store: the memory-resident tier ("RAM-Lake").
///
/// Four fixed-capacity partitions (vectors, code, history, metadata), each
/// behind its own lock so traffic on one partition never contends with
/// another. A global directory maps id → partition, keeping `get_hot` O(1).
///
/// ## Eviction Policy
///
/// Two-phase, applied when an insert would overflow its partition:
///
/// 1. Records that entered the hot tier longer ago than the retention window
///    go first, oldest first, regardless of how recently they were read.
/// 2. If that is not enough, least-recently-accessed records follow.
///
/// This component never checks durability; the controller only inserts
/// records that are already durable, so dropping one loses nothing.
use crate::clock::Clock;
use crate::config::PartitionCapacities;
use crate::types::{Partition, Record};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tracing::trace;

/// Why a record left the hot tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvictionReason {
    /// Older than the retention window
    Expired,
    /// Least recently accessed under space pressure
    LeastRecentlyUsed,
}

/// A record pushed out of the hot tier to make room.
#[derive(Debug, Clone, PartialEq)]
pub struct Evicted {
    pub id: String,
    pub partition: Partition,
    pub version: u64,
    pub bytes: u64,
    pub reason: EvictionReason,
}

/// Why `put_hot` declined a record. Never surfaced to callers of the store:
/// the record simply stays cold-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotRejection {
    /// The record alone exceeds its partition's capacity.
    TooLarge { size: u64, capacity: u64 },
}

/// Side-effect-free view of one partition's occupancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionPressure {
    pub partition: Partition,
    pub capacity_bytes: u64,
    pub usage_bytes: u64,
    pub records: usize,
    /// Hot-tier arrival time of the oldest resident record
    pub oldest_arrival: Option<DateTime<Utc>>,
}

impl PartitionPressure {
    /// Fraction of capacity in use (0.0 for a zero-capacity partition).
    pub fn utilization(&self) -> f64 {
        if self.capacity_bytes == 0 {
            0.0
        } else {
            self.usage_bytes as f64 / self.capacity_bytes as f64
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.usage_bytes)
    }
}

#[derive(Debug)]
struct HotEntry {
    record: Record,
    size: u64,
    lru_tick: u64,
    arrival_seq: u64,
    arrived_at: DateTime<Utc>,
}

/// One partition's state; only touched under its mutex.
#[derive(Debug)]
struct PartitionState {
    partition: Partition,
    capacity: u64,
    usage: u64,
    entries: HashMap<String, HotEntry>,
    /// Access order: oldest tick first.
    lru: BTreeMap<u64, String>,
    /// Arrival order: oldest first.
    arrivals: BTreeMap<u64, String>,
    /// Id order, for resumable scans.
    ids: BTreeSet<String>,
    tick: u64,
}

impl PartitionState {
    fn new(partition: Partition, capacity: u64) -> Self {
        Self {
            partition,
            capacity,
            usage: 0,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            arrivals: BTreeMap::new(),
            ids: BTreeSet::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn insert(&mut self, record: Record, size: u64, now: DateTime<Utc>) {
        let lru_tick = self.next_tick();
        let arrival_seq = self.next_tick();
        let id = record.id.clone();
        self.lru.insert(lru_tick, id.clone());
        self.arrivals.insert(arrival_seq, id.clone());
        self.ids.insert(id.clone());
        self.usage += size;
        self.entries.insert(
            id,
            HotEntry {
                record,
                size,
                lru_tick,
                arrival_seq,
                arrived_at: now,
            },
        );
    }

    fn remove(&mut self, id: &str) -> Option<HotEntry> {
        let entry = self.entries.remove(id)?;
        self.lru.remove(&entry.lru_tick);
        self.arrivals.remove(&entry.arrival_seq);
        self.ids.remove(id);
        self.usage -= entry.size;
        Some(entry)
    }

    fn touch(&mut self, id: &str, now: DateTime<Utc>) -> Option<Record> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(id)?;
        self.lru.remove(&entry.lru_tick);
        self.lru.insert(tick, id.to_string());
        entry.lru_tick = tick;
        entry.record.last_accessed_at = now;
        Some(entry.record.clone())
    }

    /// Oldest arrival, if it is at or before `cutoff`.
    fn oldest_expired(&self, cutoff: DateTime<Utc>) -> Option<String> {
        let (_, id) = self.arrivals.iter().next()?;
        let entry = self.entries.get(id)?;
        (entry.arrived_at <= cutoff).then(|| id.clone())
    }

    fn least_recent(&self) -> Option<String> {
        self.lru.values().next().cloned()
    }

    fn pressure(&self) -> PartitionPressure {
        PartitionPressure {
            partition: self.partition,
            capacity_bytes: self.capacity,
            usage_bytes: self.usage,
            records: self.entries.len(),
            oldest_arrival: self
                .arrivals
                .values()
                .next()
                .and_then(|id| self.entries.get(id))
                .map(|e| e.arrived_at),
        }
    }
}

/// The hot tier.
#[derive(Debug)]
pub struct HotStore {
    partitions: [Mutex<PartitionState>; 4],
    directory: DashMap<String, Partition>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl HotStore {
    /// Create an empty hot tier.
    pub fn new(capacities: &PartitionCapacities, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        let partitions =
            Partition::ALL.map(|p| Mutex::new(PartitionState::new(p, capacities.get(p))));
        Self {
            partitions,
            directory: DashMap::new(),
            retention,
            clock,
        }
    }

    fn slot(&self, partition: Partition) -> &Mutex<PartitionState> {
        &self.partitions[partition.index()]
    }

    /// Insert or overwrite `record` in its partition.
    ///
    /// Makes room first using the two-phase policy and returns what was
    /// evicted. A copy of the same id in another partition is dropped.
    pub fn put_hot(&self, record: Record) -> Result<Vec<Evicted>, HotRejection> {
        let size = record.hot_size();
        let partition = record.partition;
        let now = self.clock.now();

        if let Some(previous) = self.directory.get(&record.id).map(|p| *p) {
            if previous != partition {
                self.slot(previous).lock().remove(&record.id);
            }
        }

        let mut evicted = Vec::new();
        let mut state = self.slot(partition).lock();
        if size > state.capacity {
            state.remove(&record.id);
            self.directory.remove_if(&record.id, |_, p| *p == partition);
            return Err(HotRejection::TooLarge {
                size,
                capacity: state.capacity,
            });
        }
        state.remove(&record.id);

        let cutoff = now.checked_sub_signed(self.retention);
        while state.usage + size > state.capacity {
            let (victim, reason) = match cutoff.and_then(|c| state.oldest_expired(c)) {
                Some(id) => (id, EvictionReason::Expired),
                None => match state.least_recent() {
                    Some(id) => (id, EvictionReason::LeastRecentlyUsed),
                    None => break,
                },
            };
            if let Some(entry) = state.remove(&victim) {
                self.directory.remove_if(&victim, |_, p| *p == partition);
                trace!(id = %victim, %partition, ?reason, "hot eviction");
                evicted.push(Evicted {
                    id: victim,
                    partition,
                    version: entry.record.version,
                    bytes: entry.size,
                    reason,
                });
            }
        }

        let id = record.id.clone();
        state.insert(record, size, now);
        self.directory.insert(id, partition);
        Ok(evicted)
    }

    /// Look up `id`, marking it as just accessed.
    pub fn get_hot(&self, id: &str) -> Option<Record> {
        let partition = self.directory.get(id).map(|p| *p)?;
        let now = self.clock.now();
        self.slot(partition).lock().touch(id, now)
    }

    /// Look up `id` without touching recency.
    pub fn peek(&self, id: &str) -> Option<Record> {
        let partition = self.directory.get(id).map(|p| *p)?;
        self.slot(partition)
            .lock()
            .entries
            .get(id)
            .map(|e| e.record.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.directory.contains_key(id)
    }

    /// Drop `id` from memory. The persistent copy is untouched.
    pub fn remove_hot(&self, id: &str) -> Option<Record> {
        let partition = self.directory.get(id).map(|p| *p)?;
        let removed = self.slot(partition).lock().remove(id);
        self.directory.remove_if(id, |_, p| *p == partition);
        removed.map(|e| e.record)
    }

    /// Drop `id` only if the resident copy is exactly `version`.
    pub fn remove_version(&self, id: &str, version: u64) -> bool {
        let Some(partition) = self.directory.get(id).map(|p| *p) else {
            return false;
        };
        let mut state = self.slot(partition).lock();
        if state.entries.get(id).map(|e| e.record.version) != Some(version) {
            return false;
        }
        state.remove(id);
        self.directory.remove_if(id, |_, p| *p == partition);
        true
    }

    /// Occupancy of one partition.
    pub fn pressure(&self, partition: Partition) -> PartitionPressure {
        self.slot(partition).lock().pressure()
    }

    /// Occupancy of all partitions, in [`Partition::ALL`] order.
    pub fn pressures(&self) -> Vec<PartitionPressure> {
        Partition::ALL.iter().map(|p| self.pressure(*p)).collect()
    }

    /// Up to `limit` ids in `partition` that arrived at or before `cutoff`,
    /// oldest first.
    pub fn expired(&self, partition: Partition, cutoff: DateTime<Utc>, limit: usize) -> Vec<String> {
        let state = self.slot(partition).lock();
        state
            .arrivals
            .values()
            .take_while(|id| state.entries.get(*id).is_some_and(|e| e.arrived_at <= cutoff))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Least-recently-accessed ids in `partition` whose sizes add up to at
    /// least `bytes` (or all of them), capped at `limit`.
    pub fn lru_victims(&self, partition: Partition, bytes: u64, limit: usize) -> Vec<String> {
        let state = self.slot(partition).lock();
        let mut freed = 0u64;
        let mut victims = Vec::new();
        for id in state.lru.values() {
            if freed >= bytes || victims.len() >= limit {
                break;
            }
            if let Some(entry) = state.entries.get(id) {
                freed += entry.size;
                victims.push(id.clone());
            }
        }
        victims
    }

    /// Up to `limit` resident ids strictly after `after`, in id order across
    /// all partitions.
    pub fn ids_after(&self, after: Option<&str>, limit: usize) -> Vec<String> {
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };
        let mut ids: Vec<String> = Vec::new();
        for slot in &self.partitions {
            let state = slot.lock();
            ids.extend(
                state
                    .ids
                    .range((lower.clone(), Bound::Unbounded))
                    .take(limit)
                    .cloned(),
            );
        }
        ids.sort_unstable();
        ids.truncate(limit);
        ids
    }

    /// Total resident records.
    pub fn len(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    /// Total resident bytes.
    pub fn usage_bytes(&self) -> u64 {
        self.partitions.iter().map(|s| s.lock().usage).sum()
    }

    /// Arrival time at or before which a record is expired; `None` when the
    /// window reaches back past the earliest representable time.
    pub fn retention_cutoff(&self) -> Option<DateTime<Utc>> {
        self.clock.now().checked_sub_signed(self.retention)
    }
}
