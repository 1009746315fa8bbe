//! Pipeline orchestrator: the ingest and query flows over one index.
//!
//! ```text
//! ingest: DocumentLoader → TextSplitter → EmbeddingClient → VectorIndex.build/add → persist
//! query:  retrieve (vector | bm25 | hybrid) → PromptBuilder → GenerationClient
//! ```
//!
//! # Lifecycle
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Idle, Ready, Failed | ingest starts | Indexing |
//! | Indexing | ingest succeeds | Ready |
//! | Indexing | embedding or index error | Failed |
//! | Indexing | no readable documents | previous state |
//! | Ready | query or search starts | Querying |
//! | Querying | last in-flight query ends | Ready |
//!
//! Queries are accepted only while Ready (or already Querying); ingest is
//! rejected while any query is in flight. Rejections are [`StateError`]s,
//! never queued.
//!
//! # Deduplication
//!
//! Document ids are content addressed. [`IngestMode::Incremental`] skips
//! documents whose id is already indexed and adds the rest;
//! [`IngestMode::Rebuild`] re-embeds every document and replaces the index.
//! In both modes a document reached through overlapping sources is
//! indexed once.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use groundwork_core::chunk::TextSplitter;
use groundwork_core::index::{FlatIndex, VectorIndex};
use groundwork_core::prompt::PromptBuilder;
use groundwork_core::{
    Answer, IndexEntry, IndexError, IngestionError, PipelineError, PipelineState,
    RetrievalError, RetrievalResult, StateError,
};

use crate::cache::{create_cache, AnswerCache};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder, EmbeddingClient};
use crate::generation::{create_generator, GenerationClient, Generator};
use crate::loader::DocumentLoader;
use crate::search::{self, RetrievalStrategy};

/// How an ingest treats the existing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Replace the index with exactly the ingested documents.
    Rebuild,
    /// Keep existing entries; add documents not already indexed.
    Incremental,
}

/// Outcome of one ingest call.
#[derive(Debug)]
pub struct IngestReport {
    pub mode: IngestMode,
    pub documents_indexed: usize,
    /// Documents already indexed (incremental) or reached twice in one batch.
    pub documents_skipped: usize,
    pub chunks_indexed: usize,
    /// Per-document failures; these never abort the batch.
    pub failures: Vec<IngestionError>,
    /// Entries in the index after the ingest.
    pub index_entries: usize,
}

/// Per-call overrides for [`Pipeline::query_with`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    /// Per-attempt generation deadline.
    pub generation_timeout: Option<Duration>,
}

/// A generated answer and the chunks that grounded it.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub question: String,
    pub answer: Answer,
    /// Chunk ids included in the prompt, in rank order.
    pub sources: Vec<String>,
    /// Every retrieved result, including any dropped by the context budget.
    pub retrieved: Vec<RetrievalResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub entries: usize,
    pub dims: usize,
    pub embedding_model: String,
    pub generation_model: String,
    pub strategy: RetrievalStrategy,
    pub index_path: PathBuf,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Lifecycle {
    state: PipelineState,
    in_flight: usize,
    last_error: Option<String>,
}

/// The RAG orchestrator. Owns one embedding client, one generation client
/// and one vector index.
pub struct Pipeline {
    config: Config,
    loader: DocumentLoader,
    splitter: TextSplitter,
    prompts: PromptBuilder,
    embedder: EmbeddingClient,
    generator: GenerationClient,
    index: Arc<dyn VectorIndex>,
    lifecycle: Mutex<Lifecycle>,
}

impl Pipeline {
    /// Assemble a pipeline with an empty in-memory index, in state Idle.
    pub fn new(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let splitter = TextSplitter::new(
            config.chunking.chunk_size,
            config.chunking.chunk_overlap,
            config.chunking.splitter,
        )?;
        let mut prompts = PromptBuilder::new(config.retrieval.max_context_chars);
        if let Some(template) = &config.prompt.template {
            prompts = prompts.with_template(template.clone())?;
        }
        let loader = DocumentLoader::new(Vec::new(), &config.sources)
            .context("Invalid [sources] glob pattern")?;

        let index = FlatIndex::new(embedder.dims(), config.index.metric)
            .with_model(embedder.model_name())
            .with_bm25(config.retrieval.bm25());

        Ok(Self {
            embedder: EmbeddingClient::new(embedder, &config.embedding),
            generator: GenerationClient::new(generator, &config.generation),
            index: Arc::new(index),
            loader,
            splitter,
            prompts,
            lifecycle: Mutex::new(Lifecycle {
                state: PipelineState::Idle,
                in_flight: 0,
                last_error: None,
            }),
            config,
        })
    }

    /// [`Pipeline::new`], then restore the index persisted at `index.path`.
    ///
    /// A missing index leaves the pipeline Idle. Any other load failure
    /// leaves it Failed with the error recorded; ingest recovers it.
    pub fn open(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let pipeline = Self::new(config, embedder, generator)?;
        pipeline.restore();
        Ok(pipeline)
    }

    /// Build backends and cache from `config`, then [`Pipeline::open`].
    pub async fn from_config(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let cache = create_cache(&config.cache).await?;
        Ok(Self::open(config, embedder, generator)?.with_cache(cache))
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn AnswerCache>>) -> Self {
        self.generator = self.generator.with_cache(cache);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.lock().state
    }

    pub fn status(&self) -> PipelineStatus {
        let lifecycle = self.lock();
        PipelineStatus {
            state: lifecycle.state,
            entries: self.index.len(),
            dims: self.index.dims(),
            embedding_model: self.embedder.model_name().to_string(),
            generation_model: self.generator.model_name().to_string(),
            strategy: self.config.retrieval.strategy,
            index_path: self.config.index.path.clone(),
            last_error: lifecycle.last_error.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn restore(&self) {
        let path = &self.config.index.path;
        let mut lifecycle = self.lock();
        match self.index.load(path) {
            Ok(()) => {
                lifecycle.state = PipelineState::Ready;
                info!(path = %path.display(), entries = self.index.len(), "pipeline ready");
            }
            Err(IndexError::NotFound { .. }) => {
                debug!(path = %path.display(), "no persisted index; pipeline idle");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "persisted index unusable; pipeline failed");
                lifecycle.state = PipelineState::Failed;
                lifecycle.last_error = Some(error_chain(&e));
            }
        }
    }

    // ============ Ingest ============

    /// Load, split, embed and index `sources`, then persist the index.
    ///
    /// Unreadable or unsupported documents are collected in the report.
    /// The call fails only when nothing in the batch was readable, or on
    /// an embedding or index error (which leaves the pipeline Failed).
    pub async fn ingest(
        &self,
        sources: Vec<PathBuf>,
        mode: IngestMode,
    ) -> Result<IngestReport, PipelineError> {
        let previous = {
            let mut lifecycle = self.lock();
            if lifecycle.state == PipelineState::Indexing || lifecycle.in_flight > 0 {
                return Err(StateError {
                    state: lifecycle.state,
                    operation: "ingest",
                }
                .into());
            }
            let previous = lifecycle.state;
            lifecycle.state = PipelineState::Indexing;
            previous
        };
        let mut guard = IngestGuard {
            pipeline: self,
            previous,
            outcome: None,
        };

        let span = info_span!("ingest", mode = ?mode, sources = sources.len());
        let result = self.run_ingest(sources, mode).instrument(span).await;
        guard.outcome = Some(match &result {
            Ok(_) => IngestOutcome::Ready,
            Err(PipelineError::Ingestion(_)) => IngestOutcome::Unchanged,
            Err(e) => IngestOutcome::Failed(error_chain(e)),
        });
        result
    }

    async fn run_ingest(
        &self,
        sources: Vec<PathBuf>,
        mode: IngestMode,
    ) -> Result<IngestReport, PipelineError> {
        let mut failures = Vec::new();
        let mut chunks = Vec::new();
        let mut documents_indexed = 0;
        let mut documents_skipped = 0;
        let mut seen = HashSet::new();

        for item in self.loader.for_sources(sources).documents() {
            let doc = match item {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, "skipping document");
                    failures.push(e);
                    continue;
                }
            };
            if !seen.insert(doc.id.clone()) {
                debug!(source = %doc.source, "reached twice in this batch; skipping");
                documents_skipped += 1;
                continue;
            }
            if mode == IngestMode::Incremental && self.index.contains_document(&doc.id) {
                debug!(source = %doc.source, "unchanged; skipping");
                documents_skipped += 1;
                continue;
            }
            let doc_chunks = self.splitter.split(&doc);
            if doc_chunks.is_empty() {
                let e = IngestionError::Empty {
                    source_id: doc.source.clone(),
                };
                warn!(error = %e, "skipping document");
                failures.push(e);
                continue;
            }
            debug!(source = %doc.source, chunks = doc_chunks.len(), "document split");
            documents_indexed += 1;
            chunks.extend(doc_chunks);
        }

        if documents_indexed == 0 && documents_skipped == 0 && !failures.is_empty() {
            return Err(IngestionError::NoReadableDocuments {
                failures: failures.len(),
            }
            .into());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        info!(
            documents = documents_indexed,
            chunks = texts.len(),
            model = %self.embedder.model_name(),
            "embedding chunks"
        );
        let vectors = self.embedder.embed(&texts).await?;

        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry { chunk, vector })
            .collect();
        let chunks_indexed = entries.len();

        match mode {
            IngestMode::Rebuild => self.index.build(entries)?,
            IngestMode::Incremental => self.index.add(entries)?,
        }
        self.index.persist(&self.config.index.path)?;

        let report = IngestReport {
            mode,
            documents_indexed,
            documents_skipped,
            chunks_indexed,
            failures,
            index_entries: self.index.len(),
        };
        info!(
            indexed = report.documents_indexed,
            skipped = report.documents_skipped,
            failed = report.failures.len(),
            chunks = report.chunks_indexed,
            entries = report.index_entries,
            "ingest complete"
        );
        Ok(report)
    }

    // ============ Query ============

    pub async fn query(&self, question: &str) -> Result<QueryResponse, PipelineError> {
        self.query_with(question, QueryOptions::default()).await
    }

    /// Retrieve context for `question` and generate a grounded answer.
    pub async fn query_with(
        &self,
        question: &str,
        options: QueryOptions,
    ) -> Result<QueryResponse, PipelineError> {
        let _guard = self.begin_query("query")?;
        let query_id = Uuid::new_v4().to_string();
        let span = info_span!("query", query_id = %query_id);

        self.answer(question, options, query_id)
            .instrument(span)
            .await
    }

    async fn answer(
        &self,
        question: &str,
        options: QueryOptions,
        query_id: String,
    ) -> Result<QueryResponse, PipelineError> {
        let top_k = options.top_k.unwrap_or(self.config.retrieval.top_k);
        let retrieved = self.retrieve(question, top_k).await?;
        if retrieved.is_empty() && !self.config.retrieval.generate_without_context {
            return Err(RetrievalError::NoResults.into());
        }

        let prompt = self.prompts.build(&retrieved, question.trim());
        debug!(
            included = prompt.sources.len(),
            retrieved = retrieved.len(),
            chars = prompt.text.len(),
            "prompt assembled"
        );

        let answer = match options.generation_timeout {
            Some(timeout) => self.generator.generate_with_timeout(&prompt, timeout).await?,
            None => self.generator.generate(&prompt).await?,
        };
        info!(
            attempts = answer.attempts,
            cached = answer.cached,
            sources = prompt.sources.len(),
            "query answered"
        );

        Ok(QueryResponse {
            query_id,
            question: question.to_string(),
            answer,
            sources: prompt.sources,
            retrieved,
        })
    }

    /// Retrieval only: the top `k` chunks for `question`, best first.
    pub async fn search(
        &self,
        question: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, PipelineError> {
        let _guard = self.begin_query("search")?;
        self.retrieve(question, k).await
    }

    async fn retrieve(
        &self,
        question: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, PipelineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RetrievalError::EmptyQuestion.into());
        }
        let strategy = self.config.retrieval.strategy;
        let mut results = match strategy {
            RetrievalStrategy::Vector => {
                let vector = self.embedder.embed_query(question).await?;
                self.index.search(&vector, k)?
            }
            RetrievalStrategy::Bm25 => self.index.keyword_search(question, k)?,
            RetrievalStrategy::Hybrid => {
                let candidates = k.max(self.config.retrieval.candidate_k);
                let vector = self.embedder.embed_query(question).await?;
                let semantic = self.index.search(&vector, candidates)?;
                let keyword = self.index.keyword_search(question, candidates)?;
                debug!(
                    keyword = keyword.len(),
                    vector = semantic.len(),
                    "hybrid candidates"
                );
                search::blend(&keyword, &semantic, self.config.retrieval.hybrid_alpha(), k)
            }
        };
        if let Some(min_score) = self.config.retrieval.min_score {
            results.retain(|r| r.score >= min_score);
        }
        debug!(k, strategy = ?strategy, hits = results.len(), "retrieval complete");
        Ok(results)
    }

    fn begin_query(&self, operation: &'static str) -> Result<QueryGuard<'_>, StateError> {
        let mut lifecycle = self.lock();
        match lifecycle.state {
            PipelineState::Ready | PipelineState::Querying => {
                lifecycle.in_flight += 1;
                lifecycle.state = PipelineState::Querying;
                Ok(QueryGuard { pipeline: self })
            }
            state => Err(StateError { state, operation }),
        }
    }
}

/// Holds the pipeline in Querying; the last guard dropped returns it to Ready.
struct QueryGuard<'a> {
    pipeline: &'a Pipeline,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.pipeline.lock();
        lifecycle.in_flight = lifecycle.in_flight.saturating_sub(1);
        if lifecycle.in_flight == 0 && lifecycle.state == PipelineState::Querying {
            lifecycle.state = PipelineState::Ready;
        }
    }
}

enum IngestOutcome {
    Ready,
    Unchanged,
    Failed(String),
}

/// Settles the state when an ingest ends. An ingest dropped mid-flight
/// leaves the pipeline Failed, since the index may be half written.
struct IngestGuard<'a> {
    pipeline: &'a Pipeline,
    previous: PipelineState,
    outcome: Option<IngestOutcome>,
}

impl Drop for IngestGuard<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.pipeline.lock();
        match self.outcome.take() {
            Some(IngestOutcome::Ready) => {
                lifecycle.state = PipelineState::Ready;
                lifecycle.last_error = None;
            }
            Some(IngestOutcome::Unchanged) => lifecycle.state = self.previous,
            Some(IngestOutcome::Failed(message)) => {
                lifecycle.state = PipelineState::Failed;
                lifecycle.last_error = Some(message);
            }
            None => {
                lifecycle.state = PipelineState::Failed;
                lifecycle.last_error = Some("ingest cancelled".to_string());
            }
        }
    }
}

/// `error: cause: cause` rendering for status, logs and CLI output.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
