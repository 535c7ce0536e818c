//! Vector storage and similarity search over record embeddings.
//!
//! Embeddings are indexed when a record is written with one and removed
//! when the record is deleted. The index is independent of tier residency:
//! evicting a record from the hot tier leaves its embedding searchable.
//!
//! Search is eventually consistent with writes and deletes; a key deleted
//! concurrently with a search may still appear in that search's results.
//!
//! # Example
//!
//! ```
//! use ramlake::vector::VectorIndex;
//! use ramlake::vector::Embedding;
//!
//! let index = VectorIndex::new_flat();
//! index.index("doc1", Embedding::new(vec![0.1, 0.9]).unwrap()).unwrap();
//! let hits = index.search(&[0.1, 0.8], 5).unwrap();
//! assert_eq!(hits[0].key, "doc1");
//! ```

mod hnsw;
mod index;
mod types;

pub use hnsw::{HnswConfig, HnswIndex};
pub use index::{AnnIndex, FlatIndex, VectorIndex};
pub use types::{Embedding, SearchHit};
