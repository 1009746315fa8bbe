//! Error taxonomy for the ingest and query pipelines.
//!
//! Each stage has its own error type so callers can tell a bad input file
//! (reported per document, batch continues) from a broken backend or a
//! corrupt index (operation aborts). [`PipelineError`] wraps them all for
//! the orchestrator's public operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::PipelineState;

/// Boxed underlying cause, so backend errors of any type can be carried.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A source could not be turned into a document.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("source not found: {source_id}")]
    NotFound { source_id: String },

    #[error("unsupported source {source_id}: {reason}")]
    Unsupported { source_id: String, reason: String },

    #[error("failed to read {source_id}")]
    Unreadable {
        source_id: String,
        #[source]
        cause: BoxError,
    },

    #[error("empty document: {source_id}")]
    Empty { source_id: String },

    #[error("no readable documents in batch ({failures} failed)")]
    NoReadableDocuments { failures: usize },
}

impl IngestionError {
    /// The offending source, when the error concerns a single one.
    pub fn source_id(&self) -> Option<&str> {
        match self {
            IngestionError::NotFound { source_id }
            | IngestionError::Unsupported { source_id, .. }
            | IngestionError::Unreadable { source_id, .. }
            | IngestionError::Empty { source_id } => Some(source_id),
            IngestionError::NoReadableDocuments { .. } => None,
        }
    }
}

/// The embedding backend failed or returned unusable vectors.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding model {model} unavailable")]
    Unavailable {
        model: String,
        #[source]
        cause: BoxError,
    },

    #[error("embedding model {model} timed out after {timeout_ms}ms")]
    Timeout { model: String, timeout_ms: u64 },

    #[error("embedding model {model} returned {actual} dims, expected {expected}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    #[error("embedding model {model} returned {actual} vectors for {expected} inputs")]
    CountMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    #[error("embedding model {model} returned a non-finite value")]
    NonFinite { model: String },
}

/// The vector index rejected an operation or its persisted form is bad.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector dimension mismatch for {id}: expected {expected}, got {actual}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },

    #[error("no persisted index at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("corrupt index at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("index at {} holds {vectors} vectors but {entries} sidecar entries", path.display())]
    CountMismatch {
        path: PathBuf,
        vectors: usize,
        entries: usize,
    },

    #[error("index I/O failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },
}

/// Retrieval produced nothing usable.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("question is empty")]
    EmptyQuestion,

    #[error("no results for query")]
    NoResults,
}

/// The generation backend could not produce an answer.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation with {model} failed after {attempts} attempt(s)")]
    Exhausted {
        model: String,
        attempts: u32,
        #[source]
        cause: BoxError,
    },

    #[error("generation with {model} rejected")]
    Rejected {
        model: String,
        #[source]
        cause: BoxError,
    },
}

impl GenerationError {
    pub fn attempts(&self) -> u32 {
        match self {
            GenerationError::Exhausted { attempts, .. } => *attempts,
            GenerationError::Rejected { .. } => 1,
        }
    }
}

/// An operation was requested in a state that cannot serve it.
#[derive(Debug, Error)]
#[error("cannot {operation} while pipeline is {state}")]
pub struct StateError {
    pub state: PipelineState,
    pub operation: &'static str,
}

/// Umbrella error for orchestrator operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}
