//! # Groundwork
//!
//! A local-first retrieval-augmented generation pipeline.
//!
//! Groundwork ingests documents from local paths, splits them into
//! overlapping chunks, embeds the chunks into a persisted vector index, and
//! answers questions by retrieving the closest chunks and handing them to a
//! language model as grounding context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌─────────────┐
//! │  Loader  │──▶│ Splitter │──▶│ Embedding │──▶│ VectorIndex │
//! │ FS walk  │   │  chunks  │   │  client   │   │ flat + disk │
//! └──────────┘   └──────────┘   └───────────┘   └──────┬──────┘
//!                                                      │ vector / bm25
//!                 ┌──────────┐   ┌────────────┐        │
//!    answer ◀─────│Generation│◀──│   Prompt   │◀───────┘
//!                 │  client  │   │  builder   │
//!                 └──────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gw ingest ./docs              # index a directory
//! gw search "refund policy"     # retrieval only
//! gw query "How do refunds work?"
//! gw status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`loader`] | Directory walking and document loading |
//! | [`extract`] | Text extraction for PDF and DOCX |
//! | [`embedding`] | Embedding backends and batching client |
//! | [`generation`] | Generation backends and retrying client |
//! | [`cache`] | Answer cache (memory or SQLite) |
//! | [`db`] | SQLite connection for the answer cache |
//! | [`pipeline`] | Ingest and query orchestration |
//! | [`search`] | Retrieval strategies and hybrid score blending |
//! | [`logging`] | Tracing subscriber setup |
//!
//! Splitting, indexing, prompt assembly and the error types live in the
//! `groundwork-core` crate.

pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod search;
