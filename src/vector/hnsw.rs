//! HNSW (Hierarchical Navigable Small World) index for approximate nearest neighbor search.
//!
//! HNSW is a graph-based ANN algorithm that provides O(log n) search complexity
//! with high recall (>95%).
//!
//! # Features
//!
//! - Multi-layer graph structure for efficient navigation
//! - Configurable M (max connections) and ef (search scope) parameters
//! - Thread-safe: searches run concurrently, graph mutations are serialized
//!
//! # Example
//!
//! ```ignore
//! use ramlake::vector::{Embedding, HnswConfig, HnswIndex};
//!
//! let index = HnswIndex::new(HnswConfig::default());
//! index.add("doc1", Embedding::new(vec![0.1, 0.9])?);
//! let hits = index.search(&query, 10, 50);
//! ```

use super::types::{Embedding, SearchHit, rank};
use crate::config::VectorConfig;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Layers preallocated for the graph; assigned levels are capped below this.
const MAX_LAYERS: usize = 16;

/// Configuration for HNSW index.
#[derive(Debug, Clone, Copy)]
pub struct HnswConfig {
    /// Maximum number of connections per node (default: 16)
    pub m: usize,
    /// Size of dynamic candidate list during construction (default: 200)
    pub ef_construction: usize,
    /// Size of dynamic candidate list during search (default: 50)
    pub ef_search: usize,
    /// Probability decay factor for layer assignment (default: 1.0 / ln(M))
    pub m_l: f64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self::with_m(16)
    }
}

impl HnswConfig {
    /// Create a new config with custom M.
    pub fn with_m(m: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            ef_construction: 200,
            ef_search: 50,
            m_l: 1.0 / (m as f64).ln(),
        }
    }

    /// Set ef_construction.
    pub fn ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef.max(1);
        self
    }

    /// Set ef_search.
    pub fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef.max(1);
        self
    }
}

impl From<&VectorConfig> for HnswConfig {
    fn from(config: &VectorConfig) -> Self {
        HnswConfig::with_m(config.m)
            .ef_construction(config.ef_construction)
            .ef_search(config.ef_search)
    }
}

/// A node in the HNSW graph.
#[derive(Debug, Clone)]
struct Node {
    embedding: Embedding,
    /// Highest layer this node exists in
    max_layer: usize,
}

/// A layer in the HNSW graph.
#[derive(Debug, Default)]
struct Layer {
    /// Node id -> neighbor ids
    edges: HashMap<String, Vec<String>>,
}

impl Layer {
    fn add_edge(&mut self, from: &str, to: &str) {
        let neighbors = self.edges.entry(from.to_string()).or_default();
        if !neighbors.iter().any(|n| n == to) {
            neighbors.push(to.to_string());
        }
    }

    fn neighbors(&self, node_id: &str) -> &[String] {
        self.edges.get(node_id).map_or(&[], |v| v.as_slice())
    }
}

/// Search candidate for priority queue (min-heap on distance).
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    distance: f32,
    id: String,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .distance
            .partial_cmp(&self.distance) // Reverse for min-heap
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// HNSW (Hierarchical Navigable Small World) index.
pub struct HnswIndex {
    config: HnswConfig,
    nodes: DashMap<String, Node>,
    /// Layer structure: layer_index -> Layer
    layers: Vec<RwLock<Layer>>,
    /// Entry point (a node on the highest layer)
    entry_point: RwLock<Option<String>>,
    max_layer: AtomicUsize,
    rng: Mutex<StdRng>,
    /// Serializes inserts and removals; searches never take it.
    writer: Mutex<()>,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("config", &self.config)
            .field("num_nodes", &self.nodes.len())
            .field("max_layer", &self.max_layer.load(Ordering::Relaxed))
            .field("entry_point", &*self.entry_point.read())
            .finish()
    }
}

impl HnswIndex {
    /// Create a new HNSW index with the given configuration.
    pub fn new(config: HnswConfig) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
            layers: (0..MAX_LAYERS).map(|_| RwLock::new(Layer::default())).collect(),
            entry_point: RwLock::new(None),
            max_layer: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(42)),
            writer: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Get the number of vectors in the index.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Assign a random layer to a new node.
    ///
    /// Each extra level is reached with probability exp(-1 / m_l) = 1 / M.
    fn random_layer(&self) -> usize {
        let mut rng = self.rng.lock();
        let uniform = Uniform::from(0.0..1.0);
        let promote = (-1.0 / self.config.m_l).exp();
        let mut level = 0;
        while level < MAX_LAYERS - 1 {
            let r: f64 = uniform.sample(&mut *rng);
            if r < promote {
                level += 1;
            } else {
                break;
            }
        }
        level
    }

    /// Insert or replace the embedding stored under `id`.
    pub fn add(&self, id: &str, embedding: Embedding) {
        let _writer = self.writer.lock();
        if self.nodes.contains_key(id) {
            self.remove_locked(id);
        }

        let layer = self.random_layer();
        let previous_entry = self.entry_point.read().clone();
        self.nodes.insert(
            id.to_string(),
            Node {
                embedding: embedding.clone(),
                max_layer: layer,
            },
        );

        let Some(mut curr_ep) = previous_entry else {
            *self.entry_point.write() = Some(id.to_string());
            self.max_layer.store(layer, Ordering::Relaxed);
            return;
        };

        let (mut curr_dist, entry_max_layer) = match self.nodes.get(&curr_ep) {
            Some(node) => (node.embedding.distance(&embedding), node.max_layer),
            None => (f32::MAX, 0),
        };

        // Greedy descent through the layers above the new node's level
        for lc in ((layer + 1)..=entry_max_layer).rev() {
            let (new_ep, new_dist) = self.search_layer_greedy(&curr_ep, &embedding, lc);
            if new_dist < curr_dist {
                curr_ep = new_ep;
                curr_dist = new_dist;
            }
        }

        // Connect on every layer both the node and the graph share
        for lc in (0..=layer.min(entry_max_layer)).rev() {
            let mut neighbors =
                self.search_layer(&curr_ep, &embedding, self.config.ef_construction, lc);
            neighbors.retain(|(nid, _)| nid != id);
            neighbors.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            if let Some((closest, _)) = neighbors.first() {
                curr_ep = closest.clone();
            }
            for (neighbor_id, _) in neighbors.iter().take(self.config.m) {
                {
                    let mut layer_guard = self.layers[lc].write();
                    layer_guard.add_edge(id, neighbor_id);
                    layer_guard.add_edge(neighbor_id, id);
                }
                self.prune_connections(lc, neighbor_id);
            }
        }

        if layer > entry_max_layer {
            *self.entry_point.write() = Some(id.to_string());
            self.max_layer.store(layer, Ordering::Relaxed);
        }
    }

    /// Greedy walk toward the single closest node on `layer`.
    fn search_layer_greedy(&self, entry_point: &str, query: &Embedding, layer: usize) -> (String, f32) {
        let mut best_id = entry_point.to_string();
        let mut best_dist = match self.nodes.get(entry_point) {
            Some(node) => node.embedding.distance(query),
            None => return (best_id, f32::MAX),
        };
        loop {
            let neighbors = self.layers[layer].read().neighbors(&best_id).to_vec();
            let mut improved = false;
            for neighbor_id in neighbors {
                if let Some(node) = self.nodes.get(&neighbor_id) {
                    let dist = node.embedding.distance(query);
                    if dist < best_dist {
                        best_dist = dist;
                        best_id = neighbor_id.clone();
                        improved = true;
                    }
                }
            }
            if !improved {
                return (best_id, best_dist);
            }
        }
    }

    /// Beam search on one layer; returns up to `ef` (id, distance) pairs, unordered.
    fn search_layer(
        &self,
        entry_point: &str,
        query: &Embedding,
        ef: usize,
        layer: usize,
    ) -> Vec<(String, f32)> {
        let mut visited = HashSet::new();
        let mut candidates = BinaryHeap::new();
        let mut best = BinaryHeap::new();

        let entry_dist = match self.nodes.get(entry_point) {
            Some(n) => n.embedding.distance(query),
            None => return Vec::new(),
        };
        visited.insert(entry_point.to_string());
        candidates.push(Candidate {
            distance: entry_dist,
            id: entry_point.to_string(),
        });
        // Max-heap on distance via negation: peek() is the worst kept result
        best.push(Candidate {
            distance: -entry_dist,
            id: entry_point.to_string(),
        });

        while let Some(curr) = candidates.pop() {
            let worst_best = best
                .peek()
                .map(|c: &Candidate| -c.distance)
                .unwrap_or(f32::MAX);
            if curr.distance > worst_best && best.len() >= ef {
                break;
            }

            let neighbors = self.layers[layer].read().neighbors(&curr.id).to_vec();
            for neighbor_id in neighbors {
                if !visited.insert(neighbor_id.clone()) {
                    continue;
                }
                let Some(neighbor_node) = self.nodes.get(&neighbor_id) else {
                    continue;
                };
                let dist = neighbor_node.embedding.distance(query);
                let worst_best = best
                    .peek()
                    .map(|c: &Candidate| -c.distance)
                    .unwrap_or(f32::MAX);
                if dist < worst_best || best.len() < ef {
                    candidates.push(Candidate {
                        distance: dist,
                        id: neighbor_id.clone(),
                    });
                    best.push(Candidate {
                        distance: -dist,
                        id: neighbor_id,
                    });
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        best.into_iter().map(|c| (c.id, -c.distance)).collect()
    }

    /// Keep at most 2*M closest neighbors of `node_id` on `layer`.
    fn prune_connections(&self, layer: usize, node_id: &str) {
        let max_connections = self.config.m * 2;
        let neighbors: Vec<String> = self.layers[layer].read().neighbors(node_id).to_vec();
        if neighbors.len() <= max_connections {
            return;
        }
        let Some(node) = self.nodes.get(node_id).map(|n| n.embedding.clone()) else {
            return;
        };

        let mut neighbor_dists: Vec<(String, f32)> = neighbors
            .into_iter()
            .filter_map(|nid| {
                let dist = self.nodes.get(&nid)?.embedding.distance(&node);
                Some((nid, dist))
            })
            .collect();
        neighbor_dists.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        neighbor_dists.truncate(max_connections);

        let kept: Vec<String> = neighbor_dists.into_iter().map(|(id, _)| id).collect();
        self.layers[layer].write().edges.insert(node_id.to_string(), kept);
    }

    /// Remove a vector from the index. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let _writer = self.writer.lock();
        self.remove_locked(id)
    }

    fn remove_locked(&self, id: &str) -> bool {
        let Some((_, node)) = self.nodes.remove(id) else {
            return false;
        };

        for lc in 0..=node.max_layer {
            let mut layer_guard = self.layers[lc].write();
            let orphaned = layer_guard.edges.remove(id).unwrap_or_default();
            for neighbors in layer_guard.edges.values_mut() {
                neighbors.retain(|n| n != id);
            }
            // Reconnect former neighbors so the layer stays navigable
            for (i, a) in orphaned.iter().enumerate() {
                if let Some(b) = orphaned.get(i + 1) {
                    layer_guard.add_edge(a, b);
                    layer_guard.add_edge(b, a);
                }
            }
        }

        let was_entry = self.entry_point.read().as_deref() == Some(id);
        if was_entry {
            let mut max_layer = 0;
            let mut new_ep = None;
            for entry in self.nodes.iter() {
                if new_ep.is_none() || entry.value().max_layer > max_layer {
                    max_layer = entry.value().max_layer;
                    new_ep = Some(entry.key().clone());
                }
            }
            *self.entry_point.write() = new_ep;
            self.max_layer.store(max_layer, Ordering::Relaxed);
        }
        true
    }

    /// Search for the `k` nearest neighbors of `query`, best first.
    pub fn search(&self, query: &Embedding, k: usize, ef: usize) -> Vec<SearchHit> {
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let Some(entry_point) = self.entry_point.read().clone() else {
            return Vec::new();
        };
        let Some((mut curr_dist, entry_max_layer)) = self
            .nodes
            .get(&entry_point)
            .map(|n| (n.embedding.distance(query), n.max_layer))
        else {
            return Vec::new();
        };

        let ef = ef.max(k);
        let mut curr_ep = entry_point;
        for lc in (1..=entry_max_layer).rev() {
            let (new_ep, new_dist) = self.search_layer_greedy(&curr_ep, query, lc);
            if new_dist < curr_dist {
                curr_ep = new_ep;
                curr_dist = new_dist;
            }
        }

        let mut candidates = self.search_layer(&curr_ep, query, ef, 0);
        candidates.retain(|(_, dist)| *dist < f32::MAX);
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .take(k)
            .map(|(id, dist)| SearchHit::new(id, 1.0 - dist))
            .collect();
        rank(&mut hits);
        hits
    }

    /// Clear all vectors from the index.
    pub fn clear(&self) {
        let _writer = self.writer.lock();
        self.nodes.clear();
        for layer in &self.layers {
            layer.write().edges.clear();
        }
        *self.entry_point.write() = None;
        self.max_layer.store(0, Ordering::Relaxed);
    }
}

impl super::index::AnnIndex for HnswIndex {
    fn insert(&self, key: &str, embedding: Embedding) {
        self.add(key, embedding);
    }

    fn remove(&self, key: &str) -> bool {
        HnswIndex::remove(self, key)
    }

    fn search(&self, query: &Embedding, k: usize) -> Vec<SearchHit> {
        HnswIndex::search(self, query, k, self.config.ef_search)
    }

    fn len(&self) -> usize {
        HnswIndex::len(self)
    }

    fn clear(&self) {
        HnswIndex::clear(self);
    }
}
