//! Document loader: turns configured files and directories into
//! [`Document`] records.
//!
//! [`DocumentLoader::documents`] returns a lazy iterator that walks each
//! source in order, yielding one `Result` per candidate file. Failures are
//! yielded as [`IngestionError`]s carrying the offending path; the caller
//! decides whether to skip or abort.
//!
//! Directory walks apply the include/exclude globs from `[sources]`
//! (matched against the path relative to the walked directory) plus the
//! default excludes `.git`, `target` and `node_modules`, and visit entries
//! in file-name order so the sequence is deterministic. A file named
//! directly as a source skips the glob filters.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use groundwork_core::{Document, IngestionError};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::SourcesConfig;
use crate::extract::{content_type_for_extension, extract_text};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

#[derive(Debug, Clone)]
struct Filters {
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

/// Loader over a fixed list of sources.
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    sources: Vec<PathBuf>,
    filters: Filters,
}

impl DocumentLoader {
    pub fn new(sources: Vec<PathBuf>, config: &SourcesConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            sources,
            filters: Filters {
                include,
                exclude,
                follow_symlinks: config.follow_symlinks,
            },
        })
    }

    /// Same filters, different sources.
    pub fn for_sources(&self, sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            filters: self.filters.clone(),
        }
    }

    /// Consume the loader and yield documents lazily.
    pub fn documents(self) -> Documents {
        Documents {
            pending: self.sources.into_iter(),
            walk: None,
            filters: self.filters,
        }
    }
}

/// Lazy, single-pass document sequence.
pub struct Documents {
    pending: std::vec::IntoIter<PathBuf>,
    walk: Option<(PathBuf, walkdir::IntoIter)>,
    filters: Filters,
}

impl Iterator for Documents {
    type Item = Result<Document, IngestionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((root, walker)) = self.walk.as_mut() {
                match walker.next() {
                    Some(Ok(entry)) => {
                        if !entry.file_type().is_file() {
                            continue;
                        }
                        let path = entry.path();
                        let relative = path.strip_prefix(root.as_path()).unwrap_or(path);
                        let rel_str = relative.to_string_lossy();
                        if self.filters.exclude.is_match(rel_str.as_ref())
                            || !self.filters.include.is_match(rel_str.as_ref())
                        {
                            continue;
                        }
                        return Some(load_file(path));
                    }
                    Some(Err(e)) => {
                        let source_id = e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| root.display().to_string());
                        return Some(Err(IngestionError::Unreadable {
                            source_id,
                            cause: Box::new(e),
                        }));
                    }
                    None => {
                        self.walk = None;
                        continue;
                    }
                }
            }

            let source = self.pending.next()?;
            match fs::metadata(&source) {
                Ok(meta) if meta.is_dir() => {
                    debug!(path = %source.display(), "walking source directory");
                    let walker = WalkDir::new(&source)
                        .follow_links(self.filters.follow_symlinks)
                        .sort_by_file_name()
                        .into_iter();
                    self.walk = Some((source, walker));
                }
                Ok(_) => return Some(load_file(&source)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Some(Err(IngestionError::NotFound {
                        source_id: source.display().to_string(),
                    }))
                }
                Err(e) => {
                    return Some(Err(IngestionError::Unreadable {
                        source_id: source.display().to_string(),
                        cause: Box::new(e),
                    }))
                }
            }
        }
    }
}

/// Read one file into a [`Document`].
pub fn load_file(path: &Path) -> Result<Document, IngestionError> {
    let source_id = path.display().to_string();

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let content_type =
        content_type_for_extension(ext).ok_or_else(|| IngestionError::Unsupported {
            source_id: source_id.clone(),
            reason: if ext.is_empty() {
                "no file extension".to_string()
            } else {
                format!("unsupported file extension .{}", ext)
            },
        })?;

    let unreadable = |cause: Box<dyn std::error::Error + Send + Sync>| IngestionError::Unreadable {
        source_id: source_id.clone(),
        cause,
    };

    let metadata = fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => IngestionError::NotFound {
            source_id: source_id.clone(),
        },
        _ => unreadable(Box::new(e)),
    })?;
    let bytes = fs::read(path).map_err(|e| unreadable(Box::new(e)))?;
    let size = bytes.len();
    let text = extract_text(bytes, content_type).map_err(|e| unreadable(Box::new(e)))?;

    if text.trim().is_empty() {
        return Err(IngestionError::Empty { source_id });
    }

    let mut doc = Document::new(source_id, text)
        .with_metadata("content_type", content_type)
        .with_metadata("bytes", size.to_string());
    if let Ok(modified) = metadata.modified() {
        let modified: DateTime<Utc> = modified.into();
        doc = doc.with_metadata("modified", modified.to_rfc3339());
    }
    Ok(doc)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
