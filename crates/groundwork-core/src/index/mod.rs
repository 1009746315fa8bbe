//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the seam between the pipeline and the
//! similarity-search backend. Implementations own their locking: every
//! method takes `&self`, mutations (`build`, `add`, `load`) are exclusive,
//! and searches may run concurrently with each other but never observe a
//! half-applied mutation.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`build`](VectorIndex::build) | Replace the whole index |
//! | [`add`](VectorIndex::add) | Append entries |
//! | [`search`](VectorIndex::search) | Top-k by similarity, ties by chunk id |
//! | [`keyword_search`](VectorIndex::keyword_search) | Top-k by BM25 over chunk text |
//! | [`persist`](VectorIndex::persist) | Atomically write to a directory |
//! | [`load`](VectorIndex::load) | Replace contents from a directory |

pub mod flat;
pub mod keyword;
pub mod persist;

use std::cmp::Ordering;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::models::{IndexEntry, RetrievalResult};

pub use flat::FlatIndex;
pub use keyword::Bm25Params;

/// Similarity function. Must match how the embeddings were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Dot,
}

/// A similarity-search backend over chunk embeddings.
///
/// All vectors in one index share [`dims`](VectorIndex::dims); anything
/// else is rejected with [`IndexError::DimensionMismatch`], never coerced.
pub trait VectorIndex: Send + Sync {
    /// Vector dimensionality this index accepts.
    fn dims(&self) -> usize;

    /// Number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any entry belongs to the given document.
    fn contains_document(&self, document_id: &str) -> bool;

    /// Replace the entire index with `entries`.
    fn build(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError>;

    /// Append `entries` to the index.
    fn add(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError>;

    /// Return up to `k` results ordered by descending score, ties broken
    /// by ascending chunk id. An empty index yields an empty list.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>, IndexError>;

    /// Return up to `k` results scored by BM25 against chunk text, in the
    /// same order as [`search`](VectorIndex::search). Chunks sharing no
    /// term with `query` are left out.
    fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, IndexError>;

    /// Write the index and its chunk sidecar under `location`.
    fn persist(&self, location: &Path) -> Result<(), IndexError>;

    /// Replace the index contents with what is stored under `location`.
    fn load(&self, location: &Path) -> Result<(), IndexError>;
}

/// Result ordering shared by all backends: score descending, then chunk
/// id ascending.
pub fn rank_order(a_score: f32, a_id: &str, b_score: f32, b_id: &str) -> Ordering {
    b_score.total_cmp(&a_score).then_with(|| a_id.cmp(b_id))
}

/// Reject any entry whose vector length differs from `dims`.
pub fn check_dims(dims: usize, entries: &[IndexEntry]) -> Result<(), IndexError> {
    match entries.iter().find(|e| e.vector.len() != dims) {
        Some(bad) => Err(IndexError::DimensionMismatch {
            id: bad.chunk.id.clone(),
            expected: dims,
            actual: bad.vector.len(),
        }),
        None => Ok(()),
    }
}
