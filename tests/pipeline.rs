//! End-to-end pipeline tests against in-process backends.
//!
//! The hash embedder gives deterministic, offline vectors where texts
//! sharing words score higher; generation is mocked so prompts and attempt
//! counts can be inspected.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use groundwork::cache::{AnswerCache, MemoryCache};
use groundwork::config::Config;
use groundwork::embedding::{Embedder, HashEmbedder};
use groundwork::generation::Generator;
use groundwork::pipeline::{IngestMode, Pipeline, QueryOptions};
use groundwork::search::RetrievalStrategy;
use groundwork_core::prompt::NO_CONTEXT;
use groundwork_core::{
    GenerationError, IngestionError, PipelineError, PipelineState, RetrievalError, StateError,
};

const DIMS: usize = 512;

/// Records every prompt and answers with a fixed string.
#[derive(Default)]
struct Recorder {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl Generator for Recorder {
    fn model_name(&self) -> &str {
        "recorder"
    }
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok("grounded answer".to_string())
    }
}

/// Always unreachable; counts attempts.
#[derive(Default)]
struct Unreachable {
    calls: AtomicUsize,
}

#[async_trait]
impl Generator for Unreachable {
    fn model_name(&self) -> &str {
        "unreachable"
    }
    async fn generate(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("connection refused")
    }
}

/// Hash embedder that can be switched into failure.
struct Switchable {
    inner: HashEmbedder,
    failing: AtomicBool,
}

#[async_trait]
impl Embedder for Switchable {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("embedding backend unreachable");
        }
        self.inner.embed_batch(texts).await
    }
}

fn config(root: &Path) -> Config {
    let mut config = Config::default();
    config.index.path = root.join("index");
    config.chunking.chunk_size = 200;
    config.chunking.chunk_overlap = 20;
    config.generation.max_retries = 2;
    config.generation.retry_backoff_ms = 1;
    config
}

fn corpus(root: &Path) -> PathBuf {
    let docs = root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(
        docs.join("cats.md"),
        "# Cats\n\nCats are small furry animals. Cats purr, nap in the sun and chase mice.",
    )
    .unwrap();
    fs::write(
        docs.join("finance.txt"),
        "Finance covers stocks, bonds, interest rates and budgeting for retirement savings.",
    )
    .unwrap();
    docs
}

fn open(root: &Path, generator: Arc<dyn Generator>) -> Pipeline {
    Pipeline::open(config(root), Arc::new(HashEmbedder::new(DIMS)), generator).unwrap()
}

async fn ingested(root: &Path, generator: Arc<dyn Generator>) -> Pipeline {
    let docs = corpus(root);
    let pipeline = open(root, generator);
    pipeline.ingest(vec![docs], IngestMode::Rebuild).await.unwrap();
    pipeline
}

fn vectors_file(index_dir: &Path) -> PathBuf {
    fs::read_dir(index_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| {
            p.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("vectors-")
        })
        .expect("vectors file present")
}

#[tokio::test]
async fn test_retrieves_from_relevant_document() {
    let tmp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let pipeline = ingested(tmp.path(), recorder.clone()).await;
    assert_eq!(pipeline.state(), PipelineState::Ready);

    let options = QueryOptions {
        top_k: Some(1),
        ..QueryOptions::default()
    };
    let response = pipeline
        .query_with("Tell me about cats", options)
        .await
        .unwrap();

    assert_eq!(response.retrieved.len(), 1);
    assert!(response.retrieved[0].chunk.source.ends_with("cats.md"));
    assert_eq!(response.sources, vec![response.retrieved[0].chunk.id.clone()]);
    assert_eq!(response.answer.text, "grounded answer");
    assert_eq!(response.answer.attempts, 1);

    let prompts = recorder.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Cats are small furry animals"));
    assert!(prompts[0].contains("Tell me about cats"));
    assert!(!prompts[0].contains("Finance"));
    assert_eq!(pipeline.state(), PipelineState::Ready);
}

#[tokio::test]
async fn test_empty_index_still_generates_from_question() {
    let tmp = TempDir::new().unwrap();
    let empty = tmp.path().join("empty");
    fs::create_dir_all(&empty).unwrap();
    let recorder = Arc::new(Recorder::default());
    let pipeline = open(tmp.path(), recorder.clone());

    let report = pipeline
        .ingest(vec![empty], IngestMode::Rebuild)
        .await
        .unwrap();
    assert_eq!(report.documents_indexed, 0);
    assert_eq!(report.index_entries, 0);
    assert_eq!(pipeline.state(), PipelineState::Ready);

    assert!(pipeline.search("anything", 5).await.unwrap().is_empty());

    let response = pipeline.query("What is a cat?").await.unwrap();
    assert!(response.sources.is_empty());
    let prompts = recorder.prompts.lock().unwrap();
    assert!(prompts[0].contains("What is a cat?"));
    assert!(prompts[0].contains(NO_CONTEXT));
}

#[tokio::test]
async fn test_no_results_error_when_bare_generation_disabled() {
    let tmp = TempDir::new().unwrap();
    let docs = corpus(tmp.path());
    let mut cfg = config(tmp.path());
    cfg.retrieval.min_score = Some(0.99);
    cfg.retrieval.generate_without_context = false;
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::new(cfg, Arc::new(HashEmbedder::new(DIMS)), recorder.clone()).unwrap();
    pipeline.ingest(vec![docs], IngestMode::Rebuild).await.unwrap();

    let err = pipeline.query("unrelated question").await.unwrap_err();
    assert!(matches!(err, PipelineError::Retrieval(RetrievalError::NoResults)));
    assert!(recorder.prompts.lock().unwrap().is_empty());
    assert_eq!(pipeline.state(), PipelineState::Ready);
}

#[tokio::test]
async fn test_generation_gives_up_after_max_retries_plus_one() {
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(Unreachable::default());
    let pipeline = ingested(tmp.path(), backend.clone()).await;

    let err = pipeline.query("Tell me about cats").await.unwrap_err();
    match err {
        PipelineError::Generation(e @ GenerationError::Exhausted { .. }) => {
            assert_eq!(e.attempts(), 3)
        }
        other => panic!("expected exhausted generation, got {:?}", other),
    }
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    // A failed query does not take the pipeline down.
    assert_eq!(pipeline.state(), PipelineState::Ready);
}

#[tokio::test]
async fn test_query_rejected_before_ingest() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path(), Arc::new(Recorder::default()));
    assert_eq!(pipeline.state(), PipelineState::Idle);

    let err = pipeline.query("cats?").await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::State(StateError {
            state: PipelineState::Idle,
            operation: "query"
        })
    ));
}

#[tokio::test]
async fn test_embedding_failure_fails_pipeline_until_reingest() {
    let tmp = TempDir::new().unwrap();
    let docs = corpus(tmp.path());
    let embedder = Arc::new(Switchable {
        inner: HashEmbedder::new(DIMS),
        failing: AtomicBool::new(true),
    });
    let pipeline = Pipeline::new(
        config(tmp.path()),
        embedder.clone(),
        Arc::new(Recorder::default()),
    )
    .unwrap();

    let err = pipeline
        .ingest(vec![docs.clone()], IngestMode::Rebuild)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Embedding(_)));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    let status = pipeline.status();
    assert!(status.last_error.unwrap().contains("embedding backend unreachable"));

    let err = pipeline.search("cats", 1).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::State(StateError {
            state: PipelineState::Failed,
            ..
        })
    ));

    embedder.failing.store(false, Ordering::SeqCst);
    pipeline.ingest(vec![docs], IngestMode::Rebuild).await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Ready);
    assert!(pipeline.status().last_error.is_none());
}

#[tokio::test]
async fn test_persisted_index_reopens_with_identical_results() {
    let tmp = TempDir::new().unwrap();
    let first = ingested(tmp.path(), Arc::new(Recorder::default())).await;
    let before = first.search("purring cats and mice", 2).await.unwrap();

    let reopened = open(tmp.path(), Arc::new(Recorder::default()));
    assert_eq!(reopened.state(), PipelineState::Ready);
    let after = reopened.search("purring cats and mice", 2).await.unwrap();

    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.chunk.id, b.chunk.id);
        assert!((a.score - b.score).abs() < 1e-6);
    }
}

#[tokio::test]
async fn test_corrupt_index_opens_failed_and_rebuild_recovers() {
    let tmp = TempDir::new().unwrap();
    let docs = corpus(tmp.path());
    ingested(tmp.path(), Arc::new(Recorder::default())).await;

    let path = vectors_file(&tmp.path().join("index"));
    let mut bytes = fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let pipeline = open(tmp.path(), Arc::new(Recorder::default()));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(pipeline.status().last_error.is_some());
    assert!(matches!(
        pipeline.query("cats").await,
        Err(PipelineError::State(_))
    ));

    pipeline.ingest(vec![docs], IngestMode::Rebuild).await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Ready);
    assert_eq!(
        open(tmp.path(), Arc::new(Recorder::default())).state(),
        PipelineState::Ready
    );
}

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let docs = corpus(tmp.path());
    let pipeline = open(tmp.path(), Arc::new(Recorder::default()));

    let first = pipeline
        .ingest(vec![docs.clone()], IngestMode::Rebuild)
        .await
        .unwrap();
    let before = pipeline.search("stocks and bonds", 3).await.unwrap();
    let second = pipeline
        .ingest(vec![docs], IngestMode::Rebuild)
        .await
        .unwrap();
    let after = pipeline.search("stocks and bonds", 3).await.unwrap();

    assert_eq!(first.index_entries, second.index_entries);
    assert_eq!(second.documents_skipped, 0);
    let ids = |rs: &[groundwork_core::RetrievalResult]| {
        rs.iter().map(|r| r.chunk.id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&before), ids(&after));
    assert!(after[0].chunk.source.ends_with("finance.txt"));
}

#[tokio::test]
async fn test_incremental_skips_unchanged_documents() {
    let tmp = TempDir::new().unwrap();
    let docs = corpus(tmp.path());
    let pipeline = open(tmp.path(), Arc::new(Recorder::default()));

    let first = pipeline
        .ingest(vec![docs.clone()], IngestMode::Incremental)
        .await
        .unwrap();
    assert_eq!(first.documents_indexed, 2);

    let second = pipeline
        .ingest(vec![docs.clone()], IngestMode::Incremental)
        .await
        .unwrap();
    assert_eq!(second.documents_indexed, 0);
    assert_eq!(second.documents_skipped, 2);
    assert_eq!(second.chunks_indexed, 0);
    assert_eq!(second.index_entries, first.index_entries);

    fs::write(docs.join("dogs.md"), "Dogs bark and fetch sticks.").unwrap();
    let third = pipeline
        .ingest(vec![docs], IngestMode::Incremental)
        .await
        .unwrap();
    assert_eq!(third.documents_indexed, 1);
    assert_eq!(third.documents_skipped, 2);
    assert_eq!(third.index_entries, first.index_entries + 1);
}

#[tokio::test]
async fn test_partial_failures_reported_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let docs = corpus(tmp.path());
    fs::write(docs.join("blank.txt"), "   \n\n").unwrap();
    let pipeline = open(tmp.path(), Arc::new(Recorder::default()));

    let report = pipeline
        .ingest(
            vec![docs, tmp.path().join("missing.md")],
            IngestMode::Rebuild,
        )
        .await
        .unwrap();

    assert_eq!(report.documents_indexed, 2);
    assert_eq!(report.failures.len(), 2);
    assert!(report
        .failures
        .iter()
        .any(|e| matches!(e, IngestionError::Empty { source_id } if source_id.ends_with("blank.txt"))));
    assert!(report
        .failures
        .iter()
        .any(|e| matches!(e, IngestionError::NotFound { source_id } if source_id.ends_with("missing.md"))));
    assert_eq!(pipeline.state(), PipelineState::Ready);
}

#[tokio::test]
async fn test_batch_with_nothing_readable_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path(), Arc::new(Recorder::default()));

    let err = pipeline
        .ingest(
            vec![tmp.path().join("a.md"), tmp.path().join("b.md")],
            IngestMode::Rebuild,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Ingestion(IngestionError::NoReadableDocuments { failures: 2 })
    ));
    // Nothing was touched, so the pipeline keeps its previous state.
    assert_eq!(pipeline.state(), PipelineState::Idle);
}

#[tokio::test]
async fn test_concurrent_queries_share_the_index() {
    let tmp = TempDir::new().unwrap();
    let pipeline = ingested(tmp.path(), Arc::new(Recorder::default())).await;

    let (a, b) = futures::join!(
        pipeline.query("Tell me about cats"),
        pipeline.query("What about interest rates?")
    );
    assert!(a.unwrap().retrieved[0].chunk.source.ends_with("cats.md"));
    assert!(b.unwrap().retrieved[0].chunk.source.ends_with("finance.txt"));
    assert_eq!(pipeline.state(), PipelineState::Ready);
}

#[tokio::test]
async fn test_cached_answer_skips_generation() {
    let tmp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let cache: Arc<dyn AnswerCache> = Arc::new(MemoryCache::new(16, None));
    let pipeline = ingested(tmp.path(), recorder.clone())
        .await
        .with_cache(Some(cache.clone()));

    let first = pipeline.query("Tell me about cats").await.unwrap();
    let second = pipeline.query("Tell me about cats").await.unwrap();

    assert!(!first.answer.cached);
    assert!(second.answer.cached);
    assert_eq!(second.answer.text, first.answer.text);
    assert_eq!(recorder.prompts.lock().unwrap().len(), 1);
    assert_ne!(first.query_id, second.query_id);

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_overlapping_sources_index_each_document_once() {
    let tmp = TempDir::new().unwrap();
    let docs = corpus(tmp.path());
    let pipeline = open(tmp.path(), Arc::new(Recorder::default()));

    for mode in [IngestMode::Rebuild, IngestMode::Incremental] {
        let report = pipeline
            .ingest(vec![docs.clone(), docs.join("cats.md")], mode)
            .await
            .unwrap();
        assert_eq!(report.index_entries, 2, "{:?}", mode);
    }

    let report = pipeline
        .ingest(vec![docs.clone(), docs.join("cats.md")], IngestMode::Rebuild)
        .await
        .unwrap();
    assert_eq!(report.documents_indexed, 2);
    assert_eq!(report.documents_skipped, 1);

    let results = pipeline.search("cats purr", 3).await.unwrap();
    let ids: std::collections::HashSet<_> = results.iter().map(|r| r.chunk.id.as_str()).collect();
    assert_eq!(ids.len(), results.len());
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn test_bm25_retrieval_needs_no_embedding_call() {
    let tmp = TempDir::new().unwrap();
    let docs = corpus(tmp.path());
    let embedder = Arc::new(Switchable {
        inner: HashEmbedder::new(DIMS),
        failing: AtomicBool::new(false),
    });
    let mut cfg = config(tmp.path());
    cfg.retrieval.strategy = RetrievalStrategy::Bm25;
    let pipeline = Pipeline::new(cfg, embedder.clone(), Arc::new(Recorder::default())).unwrap();
    pipeline.ingest(vec![docs], IngestMode::Rebuild).await.unwrap();

    embedder.failing.store(true, Ordering::SeqCst);
    let results = pipeline.search("bonds budgeting", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].chunk.source.ends_with("finance.txt"));
    assert!(pipeline.search("giraffes", 5).await.unwrap().is_empty());
    assert_eq!(pipeline.state(), PipelineState::Ready);
}

#[tokio::test]
async fn test_hybrid_retrieval_blends_both_sides() {
    let tmp = TempDir::new().unwrap();
    let docs = corpus(tmp.path());
    let mut cfg = config(tmp.path());
    cfg.retrieval.strategy = RetrievalStrategy::Hybrid;
    let recorder = Arc::new(Recorder::default());
    let pipeline = Pipeline::new(cfg, Arc::new(HashEmbedder::new(DIMS)), recorder.clone()).unwrap();
    pipeline.ingest(vec![docs], IngestMode::Rebuild).await.unwrap();
    assert_eq!(pipeline.status().strategy, RetrievalStrategy::Hybrid);

    let results = pipeline.search("Cats chase mice", 2).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].chunk.source.ends_with("cats.md"));
    // Best on both sides normalizes to 1.0 on both.
    assert!((results[0].score - 1.0).abs() < 1e-6);
    for r in &results {
        assert!((0.0..=1.0).contains(&r.score));
    }

    let response = pipeline.query("Tell me about cats").await.unwrap();
    assert!(response.retrieved[0].chunk.source.ends_with("cats.md"));
}
