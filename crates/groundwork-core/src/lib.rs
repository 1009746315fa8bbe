//! # groundwork core
//!
//! Synchronous building blocks shared by the groundwork pipeline: data
//! models, the deterministic text splitter, vector utilities, the
//! [`VectorIndex`](index::VectorIndex) abstraction with its exact backend
//! and on-disk format, prompt assembly, and the typed error taxonomy.
//!
//! This crate has no async runtime or network dependencies. Everything
//! that talks to a model backend lives in the `groundwork` app crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod prompt;

pub use error::{
    EmbeddingError, GenerationError, IndexError, IngestionError, PipelineError, RetrievalError,
    StateError,
};
pub use models::{
    Answer, Chunk, Document, IndexEntry, PipelineState, Prompt, RetrievalResult, Span,
};
