//! Embedding and search result types.

use crate::error::{LakeError, LakeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A validated embedding.
///
/// Components are shared (`Arc<[f32]>`) with the record that carries them,
/// and the magnitude is computed once so cosine scoring only needs a dot
/// product per comparison.
#[derive(Clone)]
pub struct Embedding {
    data: Arc<[f32]>,
    magnitude: f32,
}

impl Embedding {
    /// Validate and wrap `data`.
    ///
    /// Rejects empty vectors and non-finite components.
    pub fn new(data: impl Into<Arc<[f32]>>) -> LakeResult<Self> {
        let data = data.into();
        if data.is_empty() {
            return Err(LakeError::InvalidEmbedding {
                reason: "embedding has no components".to_string(),
            });
        }
        if let Some(pos) = data.iter().position(|x| !x.is_finite()) {
            return Err(LakeError::InvalidEmbedding {
                reason: format!("component {} is not finite", pos),
            });
        }
        let magnitude = data.iter().map(|&x| x * x).sum::<f32>().sqrt();
        Ok(Self { data, magnitude })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Shared handle to the components.
    pub fn shared(&self) -> Arc<[f32]> {
        Arc::clone(&self.data)
    }

    pub fn dimensions(&self) -> usize {
        self.data.len()
    }

    pub fn magnitude(&self) -> f32 {
        self.magnitude
    }

    /// Cosine similarity in [-1, 1], or None if dimensions differ.
    ///
    /// A zero vector is orthogonal to everything.
    pub fn cosine_similarity(&self, other: &Embedding) -> Option<f32> {
        if self.dimensions() != other.dimensions() {
            return None;
        }
        if self.magnitude == 0.0 || other.magnitude == 0.0 {
            return Some(0.0);
        }
        let dot: f32 = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .sum();
        Some(dot / (self.magnitude * other.magnitude))
    }

    /// Cosine distance (1 - similarity); incompatible vectors are infinitely far.
    pub fn distance(&self, other: &Embedding) -> f32 {
        self.cosine_similarity(other)
            .map_or(f32::MAX, |s| 1.0 - s)
    }
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("dimensions", &self.dimensions())
            .field("magnitude", &self.magnitude)
            .finish()
    }
}

impl PartialEq for Embedding {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Record key
    pub key: String,
    /// Cosine similarity to the query (higher is closer)
    pub score: f32,
}

impl SearchHit {
    pub fn new(key: impl Into<String>, score: f32) -> Self {
        Self {
            key: key.into(),
            score,
        }
    }
}

/// Sort hits by score, highest first, then by key for stable output.
pub(crate) fn rank(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = Embedding::new(vec![1.0, 0.0]).unwrap();
        let b = Embedding::new(vec![0.0, 1.0]).unwrap();
        let c = Embedding::new(vec![2.0, 0.0]).unwrap();
        assert_eq!(a.cosine_similarity(&b), Some(0.0));
        assert!((a.cosine_similarity(&c).unwrap() - 1.0).abs() < 1e-6);
        assert!(a.distance(&c).abs() < 1e-6);

        let three = Embedding::new(vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(a.cosine_similarity(&three), None);
        assert_eq!(a.distance(&three), f32::MAX);
    }

    #[test]
    fn test_invalid_embeddings_rejected() {
        assert!(Embedding::new(Vec::<f32>::new()).is_err());
        assert!(Embedding::new(vec![1.0, f32::NAN]).is_err());
        assert!(Embedding::new(vec![f32::INFINITY]).is_err());
    }

    #[test]
    fn test_zero_vector_is_orthogonal() {
        let zero = Embedding::new(vec![0.0, 0.0]).unwrap();
        let a = Embedding::new(vec![1.0, 1.0]).unwrap();
        assert_eq!(zero.cosine_similarity(&a), Some(0.0));
    }

    #[test]
    fn test_rank_orders_by_score_then_key() {
        let mut hits = vec![
            SearchHit::new("b", 0.5),
            SearchHit::new("a", 0.5),
            SearchHit::new("c", 0.9),
        ];
        rank(&mut hits);
        let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }
}
