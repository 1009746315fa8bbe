//! # Groundwork CLI (`gw`)
//!
//! ## Usage
//!
//! ```bash
//! gw --config ./config/gw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gw ingest [PATHS]` | Add documents to the index (incremental) |
//! | `gw ingest --rebuild` | Re-embed everything and replace the index |
//! | `gw query "<question>"` | Answer a question from the indexed documents |
//! | `gw search "<question>"` | Show the chunks a query would retrieve |
//! | `gw status` | Pipeline state and index summary |
//! | `gw cache stats` / `gw cache clear` | Inspect or empty the answer cache |
//! | `gw completions <shell>` | Print shell completions |

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use groundwork::cache::create_cache;
use groundwork::config::{self, Config};
use groundwork::logging;
use groundwork::pipeline::{error_chain, IngestMode, Pipeline, QueryOptions};
use groundwork::search::RetrievalStrategy;
use groundwork_core::PipelineState;

/// Groundwork: ask questions of your documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gw.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "gw",
    about = "Groundwork: a local-first retrieval-augmented generation pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gw.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, chunk and embed documents into the index.
    ///
    /// Without paths, ingests `[sources].paths` from the config. By default
    /// documents already in the index are skipped.
    Ingest {
        /// Files or directories to ingest.
        paths: Vec<PathBuf>,

        /// Re-embed every document and replace the index.
        #[arg(long)]
        rebuild: bool,
    },

    /// Answer a question using retrieved context.
    Query {
        question: String,

        /// Number of chunks to retrieve (defaults to `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Per-attempt generation timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Retrieval strategy (defaults to `[retrieval].strategy`).
        #[arg(long, value_enum)]
        strategy: Option<RetrievalStrategy>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve matching chunks without generating an answer.
    Search {
        question: String,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long, value_enum)]
        strategy: Option<RetrievalStrategy>,

        #[arg(long)]
        json: bool,
    },

    /// Show pipeline state and index summary.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Manage the answer cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove every cached answer.
    Clear,
    /// Show entry count and hit/miss counters.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "gw", &mut io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let _log_guard = logging::init(cli.verbose, &cfg.logging)?;

    match cli.command {
        Commands::Ingest { paths, rebuild } => run_ingest(cfg, paths, rebuild).await,
        Commands::Query {
            question,
            top_k,
            timeout,
            strategy,
            json,
        } => run_query(with_strategy(cfg, strategy), &question, top_k, timeout, json).await,
        Commands::Search {
            question,
            top_k,
            strategy,
            json,
        } => run_search(with_strategy(cfg, strategy), &question, top_k, json).await,
        Commands::Status { json } => run_status(cfg, json).await,
        Commands::Cache { action } => run_cache(&cfg, action).await,
        Commands::Completions { .. } => Ok(()),
    }
}

async fn run_ingest(cfg: Config, paths: Vec<PathBuf>, rebuild: bool) -> Result<()> {
    let sources = if paths.is_empty() {
        cfg.sources.paths.clone()
    } else {
        paths
    };
    if sources.is_empty() {
        bail!("Nothing to ingest: pass paths or set [sources].paths in config");
    }
    let mode = if rebuild {
        IngestMode::Rebuild
    } else {
        IngestMode::Incremental
    };

    let pipeline = Pipeline::from_config(cfg).await?;
    let report = pipeline.ingest(sources, mode).await?;

    println!(
        "ingest ({})",
        if rebuild { "rebuild" } else { "incremental" }
    );
    println!("  documents indexed: {}", report.documents_indexed);
    println!("  documents skipped: {}", report.documents_skipped);
    println!("  chunks indexed: {}", report.chunks_indexed);
    println!("  failures: {}", report.failures.len());
    for failure in &report.failures {
        println!("    {}", error_chain(failure));
    }
    println!("  index entries: {}", report.index_entries);
    println!("ok");
    Ok(())
}

async fn run_query(
    cfg: Config,
    question: &str,
    top_k: Option<usize>,
    timeout: Option<u64>,
    json: bool,
) -> Result<()> {
    let pipeline = Pipeline::from_config(cfg).await?;
    ensure_usable(&pipeline)?;

    let options = QueryOptions {
        top_k,
        generation_timeout: timeout.map(Duration::from_secs),
    };
    let response = pipeline.query_with(question, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{}", response.answer.text.trim());
    if !response.sources.is_empty() {
        println!();
        println!("Sources:");
        for result in response
            .retrieved
            .iter()
            .filter(|r| response.sources.contains(&r.chunk.id))
        {
            println!(
                "  [{:.3}] {} (chunk {})",
                result.score, result.chunk.source, result.chunk.chunk_index
            );
        }
    }
    Ok(())
}

async fn run_search(cfg: Config, question: &str, top_k: Option<usize>, json: bool) -> Result<()> {
    let k = top_k.unwrap_or(cfg.retrieval.top_k);
    let pipeline = Pipeline::from_config(cfg).await?;
    ensure_usable(&pipeline)?;

    let results = pipeline.search(question, k).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} (chunk {})",
            i + 1,
            result.score,
            result.chunk.source,
            result.chunk.chunk_index
        );
        println!("    {}", snippet(&result.chunk.text, 160));
    }
    Ok(())
}

async fn run_status(cfg: Config, json: bool) -> Result<()> {
    let pipeline = Pipeline::from_config(cfg).await?;
    let status = pipeline.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("state: {}", status.state);
    println!("index: {}", status.index_path.display());
    println!("  entries: {}", status.entries);
    println!("  dims: {}", status.dims);
    println!("embedding model: {}", status.embedding_model);
    println!("generation model: {}", status.generation_model);
    println!("retrieval: {}", status.strategy);
    if let Some(err) = &status.last_error {
        println!("last error: {}", err);
    }
    Ok(())
}

async fn run_cache(cfg: &Config, action: CacheAction) -> Result<()> {
    let Some(cache) = create_cache(&cfg.cache).await? else {
        println!("cache disabled");
        return Ok(());
    };
    match action {
        CacheAction::Clear => {
            cache.clear().await?;
            println!("cache cleared");
        }
        CacheAction::Stats => {
            let stats = cache.stats().await?;
            println!("backend: {}", stats.backend);
            println!("  entries: {} / {}", stats.entries, stats.max_entries);
            println!("  hits: {}", stats.hits);
            println!("  misses: {}", stats.misses);
            println!("  evictions: {}", stats.evictions);
            println!("  expirations: {}", stats.expirations);
            match stats.hit_rate() {
                Some(rate) => println!("  hit rate: {:.1}%", rate * 100.0),
                None => println!("  hit rate: n/a"),
            }
        }
    }
    Ok(())
}

fn ensure_usable(pipeline: &Pipeline) -> Result<()> {
    let status = pipeline.status();
    match status.state {
        PipelineState::Idle => bail!(
            "No index at {}. Run `gw ingest <paths>` first.",
            status.index_path.display()
        ),
        PipelineState::Failed => bail!(
            "Index unusable ({}). Run `gw ingest --rebuild` to recover.",
            status.last_error.unwrap_or_else(|| "unknown error".to_string())
        ),
        _ => Ok(()),
    }
}

/// `error: cause: cause` on one line.
fn with_strategy(mut cfg: Config, strategy: Option<RetrievalStrategy>) -> Config {
    if let Some(strategy) = strategy {
        cfg.retrieval.strategy = strategy;
    }
    cfg
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}
