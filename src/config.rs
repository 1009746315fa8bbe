//! TOML configuration.
//!
//! Every section is optional and falls back to its defaults, so an empty
//! file is a valid (if not very useful) configuration. [`load_config`]
//! parses and validates; the resulting [`Config`] value is passed
//! explicitly to the pipeline and its clients.
//!
//! ```toml
//! [index]
//! path = "./data/index"
//!
//! [chunking]
//! chunk_size = 500
//! chunk_overlap = 50
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [generation]
//! provider = "ollama"
//! model = "deepseek-r1:8b"
//!
//! [retrieval]
//! top_k = 3
//! strategy = "hybrid"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use groundwork_core::chunk::SplitMode;
use groundwork_core::index::{Bm25Params, Metric};

use crate::search::RetrievalStrategy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub metric: Metric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            metric: Metric::default(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./data/index")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub splitter: SplitMode,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            splitter: SplitMode::default(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches in flight at once during ingestion.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Context window for Ollama (`num_ctx`), completion cap for OpenAI.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-attempt timeout.
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    /// Base delay before the first retry; doubles on each further retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_generation_timeout_secs(),
            max_retries: default_generation_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_generation_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Results scoring below this are dropped before prompt assembly.
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Generate from the bare question when retrieval finds nothing,
    /// instead of failing with "no results".
    #[serde(default = "default_true")]
    pub generate_without_context: bool,
    #[serde(default)]
    pub strategy: RetrievalStrategy,
    /// Hybrid weight of the vector side; normalized against `bm25_weight`.
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_bm25_weight")]
    pub bm25_weight: f32,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f32,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f32,
    /// Candidates drawn from each side before hybrid blending.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: None,
            max_context_chars: default_max_context_chars(),
            generate_without_context: true,
            strategy: RetrievalStrategy::default(),
            vector_weight: default_vector_weight(),
            bm25_weight: default_bm25_weight(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            candidate_k: default_candidate_k(),
        }
    }
}

impl RetrievalConfig {
    /// Share of the blended score given to vector similarity.
    pub fn hybrid_alpha(&self) -> f32 {
        self.vector_weight / (self.vector_weight + self.bm25_weight)
    }

    pub fn bm25(&self) -> Bm25Params {
        Bm25Params {
            k1: self.bm25_k1,
            b: self.bm25_b,
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_max_context_chars() -> usize {
    6000
}
fn default_vector_weight() -> f32 {
    0.6
}
fn default_bm25_weight() -> f32 {
    0.4
}
fn default_bm25_k1() -> f32 {
    1.5
}
fn default_bm25_b() -> f32 {
    0.75
}
fn default_candidate_k() -> usize {
    20
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptConfig {
    /// Custom template with `{context}` and `{question}` placeholders.
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Entry lifetime; `None` keeps entries until evicted.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: default_cache_backend(),
            path: default_cache_path(),
            max_entries: default_cache_max_entries(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_backend() -> String {
    "memory".to_string()
}
fn default_cache_path() -> PathBuf {
    PathBuf::from("./data/answer_cache.sqlite")
}
fn default_cache_max_entries() -> usize {
    1000
}
fn default_cache_ttl() -> Option<u64> {
    Some(3600)
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    /// Files or directories ingested when `gw ingest` is given no paths.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset and no `-v` is given.
    #[serde(default)]
    pub level: Option<String>,
    /// Also write daily-rotated log files here.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!(
            "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.chunk_overlap,
            config.chunking.chunk_size
        );
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be > 0");
    }
    if config.retrieval.max_context_chars == 0 {
        bail!("retrieval.max_context_chars must be > 0");
    }
    let retrieval = &config.retrieval;
    for (name, weight) in [
        ("vector_weight", retrieval.vector_weight),
        ("bm25_weight", retrieval.bm25_weight),
    ] {
        if !(0.0..=1.0).contains(&weight) {
            bail!("retrieval.{} must be between 0 and 1 (got {})", name, weight);
        }
    }
    if retrieval.vector_weight + retrieval.bm25_weight <= 0.0 {
        bail!("retrieval.vector_weight and retrieval.bm25_weight cannot both be 0");
    }
    if retrieval.bm25_k1.is_nan() || retrieval.bm25_k1 <= 0.0 {
        bail!("retrieval.bm25_k1 must be > 0");
    }
    if !(0.0..=1.0).contains(&retrieval.bm25_b) {
        bail!("retrieval.bm25_b must be between 0 and 1");
    }
    if retrieval.candidate_k == 0 {
        bail!("retrieval.candidate_k must be > 0");
    }

    // Validate embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "hash" | "ollama" | "openai" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, ollama, openai, or local.",
            other
        ),
    }
    if matches!(embedding.provider.as_str(), "hash" | "ollama" | "openai")
        && (embedding.dims.is_none() || embedding.dims == Some(0))
    {
        bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            embedding.provider
        );
    }
    if matches!(embedding.provider.as_str(), "ollama" | "openai") && embedding.model.is_none() {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            embedding.provider
        );
    }
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if embedding.concurrency == 0 {
        bail!("embedding.concurrency must be > 0");
    }
    if embedding.timeout_secs == 0 {
        bail!("embedding.timeout_secs must be > 0");
    }

    // Validate generation
    let generation = &config.generation;
    match generation.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }
    if generation.is_enabled() && generation.model.is_none() {
        bail!(
            "generation.model must be specified when provider is '{}'",
            generation.provider
        );
    }
    if generation.timeout_secs == 0 {
        bail!("generation.timeout_secs must be > 0");
    }

    // Validate prompt
    if let Some(template) = &config.prompt.template {
        if !template.contains("{question}") {
            bail!("prompt.template must contain a {{question}} placeholder");
        }
    }

    // Validate cache
    if config.cache.enabled {
        match config.cache.backend.as_str() {
            "memory" | "sqlite" => {}
            other => bail!("Unknown cache backend: '{}'. Must be memory or sqlite.", other),
        }
        if config.cache.max_entries == 0 {
            bail!("cache.max_entries must be > 0");
        }
    }

    Ok(())
}
