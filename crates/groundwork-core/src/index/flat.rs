//! Exact brute-force [`VectorIndex`] backend.
//!
//! Stores entries in a `Vec` behind a `std::sync::RwLock` and scores every
//! entry on each search. Vector norms are computed once at insertion so
//! cosine search costs one dot product per entry. BM25 term statistics are
//! maintained under the same lock for keyword search.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::embedding::{cosine_with_norms, dot, l2_norm};
use crate::error::IndexError;
use crate::models::{IndexEntry, RetrievalResult};

use super::keyword::{Bm25Params, KeywordIndex};
use super::persist;
use super::{check_dims, rank_order, Metric, VectorIndex};

#[derive(Default)]
struct Inner {
    entries: Vec<IndexEntry>,
    norms: Vec<f32>,
    keywords: KeywordIndex,
    documents: HashSet<String>,
}

impl Inner {
    fn from_entries(entries: Vec<IndexEntry>) -> Self {
        let mut inner = Inner::default();
        inner.extend(entries);
        inner
    }

    fn extend(&mut self, entries: Vec<IndexEntry>) {
        self.entries.reserve(entries.len());
        self.norms.reserve(entries.len());
        for entry in entries {
            self.norms.push(l2_norm(&entry.vector));
            self.keywords.push(&entry.chunk.text);
            self.documents.insert(entry.chunk.document_id.clone());
            self.entries.push(entry);
        }
    }

    /// Sort `(score, position)` pairs into result order and keep the top `k`.
    fn top_k(&self, mut scored: Vec<(f32, usize)>, k: usize) -> Vec<RetrievalResult> {
        scored.sort_by(|a, b| {
            rank_order(
                a.0,
                &self.entries[a.1].chunk.id,
                b.0,
                &self.entries[b.1].chunk.id,
            )
        });
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(score, i)| RetrievalResult {
                chunk: self.entries[i].chunk.clone(),
                score,
            })
            .collect()
    }
}

/// In-memory exact index.
pub struct FlatIndex {
    dims: usize,
    metric: Metric,
    model: String,
    bm25: Bm25Params,
    inner: RwLock<Inner>,
    persist_lock: Mutex<()>,
}

impl FlatIndex {
    pub fn new(dims: usize, metric: Metric) -> Self {
        Self {
            dims,
            metric,
            model: String::new(),
            bm25: Bm25Params::default(),
            inner: RwLock::new(Inner::default()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Label persisted indexes with the embedding model that produced them.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_bm25(mut self, params: Bm25Params) -> Self {
        self.bm25 = params;
        self
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VectorIndex for FlatIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn len(&self) -> usize {
        self.read().entries.len()
    }

    fn contains_document(&self, document_id: &str) -> bool {
        self.read().documents.contains(document_id)
    }

    fn build(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        check_dims(self.dims, &entries)?;
        let fresh = Inner::from_entries(entries);
        let count = fresh.entries.len();
        *self.write() = fresh;
        info!(entries = count, "index rebuilt");
        Ok(())
    }

    fn add(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        check_dims(self.dims, &entries)?;
        let count = entries.len();
        let mut inner = self.write();
        inner.extend(entries);
        debug!(added = count, total = inner.entries.len(), "index extended");
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>, IndexError> {
        if query.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                id: "query".to_string(),
                expected: self.dims,
                actual: query.len(),
            });
        }

        let inner = self.read();
        if k == 0 || inner.entries.is_empty() {
            return Ok(Vec::new());
        }

        let query_norm = l2_norm(query);
        let scored: Vec<(f32, usize)> = inner
            .entries
            .iter()
            .zip(inner.norms.iter())
            .enumerate()
            .map(|(i, (entry, &norm))| {
                let score = match self.metric {
                    Metric::Cosine => cosine_with_norms(query, query_norm, &entry.vector, norm),
                    Metric::Dot => dot(query, &entry.vector),
                };
                (score, i)
            })
            .collect();
        Ok(inner.top_k(scored, k))
    }

    fn keyword_search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, IndexError> {
        let inner = self.read();
        if k == 0 || inner.entries.is_empty() {
            return Ok(Vec::new());
        }
        let scored = inner.keywords.score(query, self.bm25);
        Ok(inner.top_k(scored, k))
    }

    fn persist(&self, location: &Path) -> Result<(), IndexError> {
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let encoded = {
            let inner = self.read();
            persist::encode(self.dims, self.metric, &self.model, &inner.entries)
        };
        let generation = persist::write_generation(location, &encoded)?;
        info!(
            path = %location.display(),
            generation,
            entries = encoded.entry_count(),
            "index persisted"
        );
        Ok(())
    }

    fn load(&self, location: &Path) -> Result<(), IndexError> {
        let snapshot = persist::read_snapshot(location, self.dims)?;
        if snapshot.metric != self.metric {
            warn!(
                stored = ?snapshot.metric,
                configured = ?self.metric,
                "persisted index was built for a different metric"
            );
        }
        if !self.model.is_empty() && !snapshot.model.is_empty() && snapshot.model != self.model {
            warn!(
                stored = %snapshot.model,
                configured = %self.model,
                "persisted index was built with a different embedding model"
            );
        }
        let count = snapshot.entries.len();
        *self.write() = Inner::from_entries(snapshot.entries);
        info!(path = %location.display(), entries = count, "index loaded");
        Ok(())
    }
}
