//! Core data models that flow through the ingest and query pipelines.
//!
//! Documents are transient: the loader creates them, the splitter turns
//! them into [`Chunk`]s and they are dropped. Chunks live on inside the
//! vector index as [`IndexEntry`] values; everything produced at query
//! time ([`RetrievalResult`], [`Prompt`], [`Answer`]) is per-request.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A raw document read from a configured source.
#[derive(Debug, Clone)]
pub struct Document {
    /// Content-addressed identifier, see [`Document::new`].
    pub id: String,
    /// Path (or other identifier) of the source this text came from.
    pub source: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    /// Create a document whose id is derived from its source and text.
    ///
    /// The id is the first 16 hex characters of `SHA-256(source NUL text)`,
    /// so an unchanged file always maps to the same id and any edit to it
    /// produces a new one.
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        let source = source.into();
        let text = text.into();
        let id = document_id(&source, &text);
        Self {
            id,
            source,
            text,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn document_id(source: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Character offsets `[start, end)` of a chunk inside its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A contiguous, bounded segment of a document: the unit of embedding
/// and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Source path of the parent document, kept for attribution.
    pub source: String,
    pub chunk_index: usize,
    pub text: String,
    pub span: Span,
}

impl Chunk {
    /// Stable chunk id: `<document_id>:<index>` with the index zero-padded
    /// so ids order by position within a document.
    pub fn make_id(document_id: &str, chunk_index: usize) -> String {
        format!("{}:{:05}", document_id, chunk_index)
    }
}

/// One chunk and its embedding, as stored in a vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A chunk returned by similarity search, with its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub score: f32,
}

/// A fully assembled generation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// The context block as inserted into the template.
    pub context: String,
    pub question: String,
    /// The rendered prompt text sent to the model.
    pub text: String,
    /// Ids of the chunks that made it into the context, in rank order.
    pub sources: Vec<String>,
}

/// Generated text plus bookkeeping about how it was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    pub text: String,
    pub model: String,
    /// Backend calls made for this answer (0 when served from cache).
    pub attempts: u32,
    pub cached: bool,
}

/// Lifecycle states of the pipeline orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Indexing,
    Ready,
    Querying,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Indexing => "indexing",
            PipelineState::Ready => "ready",
            PipelineState::Querying => "querying",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}
