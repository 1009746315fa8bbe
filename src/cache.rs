//! Answer cache: reuse generated answers for identical prompts.
//!
//! Entries are keyed by [`cache_key`], the SHA-256 of the generation model
//! and the fully rendered prompt, so a changed index, template or model
//! never serves a stale answer. Two backends share the [`AnswerCache`]
//! trait:
//!
//! - [`MemoryCache`]: process-local LRU with optional TTL.
//! - [`SqliteCache`]: the same policy in an SQLite table, surviving restarts.
//!
//! Both evict the least recently used entry once `max_entries` is exceeded
//! and treat entries older than the TTL as misses.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::db;

/// Cache counters, as reported by `gw cache stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub backend: String,
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hits over lookups, or `None` before the first lookup.
    pub fn hit_rate(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        (lookups > 0).then(|| self.hits as f64 / lookups as f64)
    }
}

#[async_trait]
pub trait AnswerCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, answer: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn stats(&self) -> Result<CacheStats>;
}

/// Cache key for a model and rendered prompt.
pub fn cache_key(model: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\n");
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Open the backend named in `config`, or `None` when caching is off.
pub async fn create_cache(config: &CacheConfig) -> Result<Option<Arc<dyn AnswerCache>>> {
    if !config.enabled {
        return Ok(None);
    }
    let ttl = config.ttl_secs.map(Duration::from_secs);
    let cache: Arc<dyn AnswerCache> = match config.backend.as_str() {
        "memory" => Arc::new(MemoryCache::new(config.max_entries, ttl)),
        "sqlite" => Arc::new(SqliteCache::open(&config.path, config.max_entries, ttl).await?),
        other => bail!("Unknown cache backend: {}", other),
    };
    info!(
        backend = %config.backend,
        max_entries = config.max_entries,
        ttl_secs = ?config.ttl_secs,
        "answer cache enabled"
    );
    Ok(Some(cache))
}

// ============ Memory ============

struct MemoryEntry {
    answer: String,
    inserted: Instant,
    last_used: u64,
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<String, MemoryEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// In-process LRU cache.
pub struct MemoryCache {
    max_entries: usize,
    ttl: Option<Duration>,
    inner: Mutex<MemoryInner>,
}

impl MemoryCache {
    pub fn new(max_entries: usize, ttl: Option<Duration>) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AnswerCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        let expired = match (inner.entries.get(key), self.ttl) {
            (Some(entry), Some(ttl)) => entry.inserted.elapsed() > ttl,
            _ => false,
        };
        if expired {
            inner.entries.remove(key);
            inner.expirations += 1;
        }

        inner.tick += 1;
        let tick = inner.tick;
        let answer = inner.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.answer.clone()
        });
        if answer.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        Ok(answer)
    }

    async fn put(&self, key: &str, answer: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(
            key.to_string(),
            MemoryEntry {
                answer: answer.to_string(),
                inserted: Instant::now(),
                last_used: tick,
            },
        );
        while inner.entries.len() > self.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    inner.entries.remove(&k);
                    inner.evictions += 1;
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.lock().entries.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let inner = self.lock();
        Ok(CacheStats {
            backend: "memory".to_string(),
            entries: inner.entries.len(),
            max_entries: self.max_entries,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
        })
    }
}

// ============ SQLite ============

/// LRU cache persisted in an SQLite table.
///
/// Recency is a monotonically increasing `last_used` counter rather than
/// wall-clock time, so ordering is exact even within one second. Hit and
/// miss counters are per process.
pub struct SqliteCache {
    pool: SqlitePool,
    max_entries: usize,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl SqliteCache {
    pub async fn open(path: &Path, max_entries: usize, ttl: Option<Duration>) -> Result<Self> {
        let pool = db::connect(path).await?;
        db::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            max_entries: max_entries.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

const NEXT_LAST_USED: &str = "(SELECT COALESCE(MAX(last_used), 0) + 1 FROM answer_cache)";

#[async_trait]
impl AnswerCache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT response, created_at FROM answer_cache WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        let Some((response, created_at)) = row else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if let Some(ttl) = self.ttl {
            if Self::now() - created_at > ttl.as_secs() as i64 {
                sqlx::query("DELETE FROM answer_cache WHERE key = ?")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        }

        sqlx::query(&format!(
            "UPDATE answer_cache SET last_used = {} WHERE key = ?",
            NEXT_LAST_USED
        ))
        .bind(key)
        .execute(&self.pool)
        .await?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(response))
    }

    async fn put(&self, key: &str, answer: &str) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO answer_cache (key, response, created_at, last_used)
            VALUES (?, ?, ?, {})
            ON CONFLICT(key) DO UPDATE SET
                response = excluded.response,
                created_at = excluded.created_at,
                last_used = excluded.last_used
            "#,
            NEXT_LAST_USED
        ))
        .bind(key)
        .bind(answer)
        .bind(Self::now())
        .execute(&self.pool)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM answer_cache")
            .fetch_one(&self.pool)
            .await?;
        let excess = count - self.max_entries as i64;
        if excess <= 0 {
            return Ok(());
        }

        let evicted = sqlx::query(
            r#"
            DELETE FROM answer_cache WHERE key IN (
                SELECT key FROM answer_cache ORDER BY last_used ASC LIMIT ?
            )
            "#,
        )
        .bind(excess)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if evicted > 0 {
            debug!(evicted, "answer cache evicted entries");
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM answer_cache")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM answer_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(CacheStats {
            backend: "sqlite".to_string(),
            entries: entries as usize,
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        })
    }
}
