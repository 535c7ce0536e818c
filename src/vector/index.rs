//! Vector indexing for approximate nearest neighbor search.
//!
//! [`AnnIndex`] abstracts over the indexing strategy. [`HnswIndex`] is the
//! default; [`FlatIndex`] does exact brute-force search and suits small
//! collections and tests. [`VectorIndex`] is the handle the controller uses:
//! it validates embeddings, pins the dimension, and dispatches to a backend.

use super::hnsw::{HnswConfig, HnswIndex};
use super::types::{Embedding, SearchHit, rank};
use crate::config::{VectorBackend, VectorConfig};
use crate::error::{LakeError, LakeResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// An approximate nearest neighbor index over keyed embeddings.
pub trait AnnIndex: Send + Sync {
    /// Insert or replace the embedding for `key`.
    fn insert(&self, key: &str, embedding: Embedding);

    /// Remove `key`; returns whether it was present.
    fn remove(&self, key: &str) -> bool;

    /// Up to `k` nearest keys, best first.
    fn search(&self, query: &Embedding, k: usize) -> Vec<SearchHit>;

    /// Number of indexed embeddings.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything.
    fn clear(&self);
}

/// A flat (brute-force) vector index.
///
/// Compares the query against every embedding, so results are exact and
/// query cost is O(n).
#[derive(Debug, Default)]
pub struct FlatIndex {
    vectors: DashMap<String, Embedding>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnnIndex for FlatIndex {
    fn insert(&self, key: &str, embedding: Embedding) {
        self.vectors.insert(key.to_string(), embedding);
    }

    fn remove(&self, key: &str) -> bool {
        self.vectors.remove(key).is_some()
    }

    fn search(&self, query: &Embedding, k: usize) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = self
            .vectors
            .iter()
            .filter_map(|entry| {
                query
                    .cosine_similarity(entry.value())
                    .map(|score| SearchHit::new(entry.key().clone(), score))
            })
            .collect();
        rank(&mut hits);
        hits.truncate(k);
        hits
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn clear(&self) {
        self.vectors.clear();
    }
}

/// A thread-safe, cheaply cloneable handle to an ANN index.
///
/// Embeddings stay indexed regardless of where their record currently lives,
/// so search covers hot and cold records alike.
#[derive(Clone)]
pub struct VectorIndex {
    inner: Arc<dyn AnnIndex>,
    /// Fixed by configuration or by the first indexed embedding.
    dimensions: Arc<RwLock<Option<usize>>>,
    configured_dimensions: Option<usize>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("len", &self.len())
            .field("dimensions", &*self.dimensions.read())
            .finish()
    }
}

impl VectorIndex {
    /// Build the backend named by `config`.
    pub fn from_config(config: &VectorConfig) -> Self {
        let inner: Arc<dyn AnnIndex> = match config.backend {
            VectorBackend::Hnsw => Arc::new(HnswIndex::new(HnswConfig::from(config))),
            VectorBackend::Flat => Arc::new(FlatIndex::new()),
        };
        Self::with_backend(inner, config.dimensions)
    }

    /// Exact search backend with no fixed dimension.
    pub fn new_flat() -> Self {
        Self::with_backend(Arc::new(FlatIndex::new()), None)
    }

    pub fn with_backend(inner: Arc<dyn AnnIndex>, dimensions: Option<usize>) -> Self {
        Self {
            inner,
            dimensions: Arc::new(RwLock::new(dimensions)),
            configured_dimensions: dimensions,
        }
    }

    /// Validate `data` against the index dimension without indexing it.
    pub fn check(&self, data: &[f32]) -> LakeResult<Embedding> {
        let embedding = Embedding::new(data.to_vec())?;
        if let Some(expected) = *self.dimensions.read() {
            if embedding.dimensions() != expected {
                return Err(LakeError::InvalidEmbedding {
                    reason: format!(
                        "expected {} dimensions, got {}",
                        expected,
                        embedding.dimensions()
                    ),
                });
            }
        }
        Ok(embedding)
    }

    /// Index (or re-index) `key`.
    pub fn index(&self, key: &str, embedding: Embedding) -> LakeResult<()> {
        {
            let mut dimensions = self.dimensions.write();
            match *dimensions {
                Some(expected) if expected != embedding.dimensions() => {
                    return Err(LakeError::InvalidEmbedding {
                        reason: format!(
                            "expected {} dimensions, got {}",
                            expected,
                            embedding.dimensions()
                        ),
                    });
                }
                Some(_) => {}
                None => *dimensions = Some(embedding.dimensions()),
            }
        }
        self.inner.insert(key, embedding);
        Ok(())
    }

    /// Remove `key`; removing an absent key is a no-op.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.remove(key)
    }

    /// Up to `k` nearest keys to `query`, best first.
    pub fn search(&self, query: &[f32], k: usize) -> LakeResult<Vec<SearchHit>> {
        let query = self.check(query)?;
        Ok(self.inner.search(&query, k))
    }

    pub fn dimensions(&self) -> Option<usize> {
        *self.dimensions.read()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop every embedding; an unconfigured dimension is forgotten too.
    pub fn clear(&self) {
        self.inner.clear();
        *self.dimensions.write() = self.configured_dimensions;
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::from_config(&VectorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(data: Vec<f32>) -> Embedding {
        Embedding::new(data).unwrap()
    }

    #[test]
    fn test_flat_index_add_and_search() {
        let index = FlatIndex::new();
        index.insert("doc1", embedding(vec![1.0, 0.0, 0.0]));
        index.insert("doc2", embedding(vec![0.0, 1.0, 0.0]));
        index.insert("doc3", embedding(vec![0.0, 0.0, 1.0]));

        let results = index.search(&embedding(vec![0.9, 0.1, 0.0]), 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].key, "doc1");
        assert!(results[0].score > 0.9);
    }

    #[test]
    fn test_flat_index_remove() {
        let index = FlatIndex::new();
        index.insert("doc1", embedding(vec![1.0, 0.0]));
        assert!(index.remove("doc1"));
        assert!(!index.remove("doc1"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_vector_index_pins_dimension() {
        let index = VectorIndex::new_flat();
        index.index("doc1", embedding(vec![1.0, 0.0])).unwrap();
        assert_eq!(index.dimensions(), Some(2));
        assert!(matches!(
            index.index("doc2", embedding(vec![1.0, 0.0, 0.0])),
            Err(LakeError::InvalidEmbedding { .. })
        ));
        assert!(index.search(&[1.0, 0.0, 0.0], 1).is_err());
        assert!(index.search(&[f32::NAN, 0.0], 1).is_err());

        index.clear();
        assert_eq!(index.dimensions(), None);
    }

    #[test]
    fn test_vector_index_clone_shares_state() {
        let index = VectorIndex::new_flat();
        index.index("doc1", embedding(vec![1.0, 0.0])).unwrap();
        let cloned = index.clone();
        cloned.remove("doc1");
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_backends_agree_on_nearest() {
        let configs = [
            VectorConfig {
                backend: VectorBackend::Flat,
                ..Default::default()
            },
            VectorConfig::default(),
        ];
        for config in configs {
            let index = VectorIndex::from_config(&config);
            index.index("east", embedding(vec![1.0, 0.0])).unwrap();
            index.index("north", embedding(vec![0.0, 1.0])).unwrap();
            index.index("west", embedding(vec![-1.0, 0.0])).unwrap();
            let hits = index.search(&[0.8, 0.3], 2).unwrap();
            assert_eq!(hits[0].key, "east", "backend {:?}", config.backend);
            assert_eq!(hits[1].key, "north");
        }
    }
}
