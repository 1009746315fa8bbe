//! On-disk format for a [`FlatIndex`](super::FlatIndex).
//!
//! An index directory holds numbered generations plus a pointer file:
//!
//! ```text
//! index/
//!   CURRENT               "3\n"
//!   vectors-000003.bin    header + f32 LE payload + SHA-256 trailer
//!   chunks-000003.json    chunk sidecar, same order as the vectors
//! ```
//!
//! Vector file layout:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | magic `GWVI` |
//! | 4 | 4 | format version (u32 LE) |
//! | 8 | 4 | dims (u32 LE) |
//! | 12 | 8 | entry count (u64 LE) |
//! | 20 | count × dims × 4 | vectors |
//! | end − 32 | 32 | SHA-256 of everything before it |
//!
//! A save writes both generation files through temp files in the same
//! directory, renames them into place, then swaps `CURRENT`. A crash at any
//! point leaves `CURRENT` naming a complete generation, so a reader sees
//! either the old index or the new one.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::embedding::{extend_le_bytes, from_le_bytes};
use crate::error::IndexError;
use crate::models::{Chunk, IndexEntry, Span};

use super::Metric;

pub const FORMAT_VERSION: u32 = 1;

const MAGIC: &[u8; 4] = b"GWVI";
const HEADER_LEN: usize = 20;
const CHECKSUM_LEN: usize = 32;
const CURRENT_FILE: &str = "CURRENT";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    format_version: u32,
    model: String,
    metric: Metric,
    dims: usize,
    vectors_sha256: String,
    entries: Vec<SidecarEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SidecarEntry {
    chunk_id: String,
    document_id: String,
    source: String,
    chunk_index: usize,
    span: Span,
    text: String,
}

/// An index serialized in memory, ready to be written.
pub struct Encoded {
    vectors: Vec<u8>,
    sidecar: Sidecar,
}

impl Encoded {
    pub fn entry_count(&self) -> usize {
        self.sidecar.entries.len()
    }
}

/// Index contents read back from disk.
#[derive(Debug)]
pub struct Snapshot {
    pub dims: usize,
    pub metric: Metric,
    pub model: String,
    pub entries: Vec<IndexEntry>,
}

fn vectors_name(generation: u64) -> String {
    format!("vectors-{:06}.bin", generation)
}

fn chunks_name(generation: u64) -> String {
    format!("chunks-{:06}.json", generation)
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn corrupt(path: &Path, reason: impl Into<String>) -> IndexError {
    IndexError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> IndexError + '_ {
    move |cause| IndexError::Io {
        path: path.to_path_buf(),
        cause,
    }
}

/// Serialize entries into the vector payload and chunk sidecar.
pub fn encode(dims: usize, metric: Metric, model: &str, entries: &[IndexEntry]) -> Encoded {
    let mut vectors = Vec::with_capacity(HEADER_LEN + entries.len() * dims * 4 + CHECKSUM_LEN);
    vectors.extend_from_slice(MAGIC);
    vectors.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    vectors.extend_from_slice(&(dims as u32).to_le_bytes());
    vectors.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        extend_le_bytes(&mut vectors, &entry.vector);
    }
    let trailer = Sha256::digest(&vectors);
    vectors.extend_from_slice(&trailer);

    let sidecar = Sidecar {
        format_version: FORMAT_VERSION,
        model: model.to_string(),
        metric,
        dims,
        vectors_sha256: sha256_hex(&vectors),
        entries: entries
            .iter()
            .map(|e| SidecarEntry {
                chunk_id: e.chunk.id.clone(),
                document_id: e.chunk.document_id.clone(),
                source: e.chunk.source.clone(),
                chunk_index: e.chunk.chunk_index,
                span: e.chunk.span,
                text: e.chunk.text.clone(),
            })
            .collect(),
    };

    Encoded { vectors, sidecar }
}

/// Read the generation number `CURRENT` points at, if any.
pub fn current_generation(location: &Path) -> Result<Option<u64>, IndexError> {
    let path = location.join(CURRENT_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(&path)(e)),
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| corrupt(&path, format!("unreadable generation pointer {:?}", raw.trim())))
}

/// Write `encoded` as the next generation under `location` and make it
/// current. Returns the new generation number.
pub fn write_generation(location: &Path, encoded: &Encoded) -> Result<u64, IndexError> {
    fs::create_dir_all(location).map_err(io_err(location))?;

    let generation = current_generation(location)?.map_or(1, |g| g + 1);
    let sidecar_bytes = serde_json::to_vec(&encoded.sidecar)
        .map_err(|e| corrupt(location, format!("failed to encode sidecar: {}", e)))?;

    write_atomic(location, &vectors_name(generation), &encoded.vectors)?;
    write_atomic(location, &chunks_name(generation), &sidecar_bytes)?;
    write_atomic(location, CURRENT_FILE, format!("{}\n", generation).as_bytes())?;
    sync_dir(location);

    remove_older_generations(location, generation);
    Ok(generation)
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), IndexError> {
    let target = dir.join(name);
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(bytes).map_err(io_err(&target))?;
    tmp.as_file().sync_all().map_err(io_err(&target))?;
    tmp.persist(&target).map_err(|e| io_err(&target)(e.error))?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|f| f.sync_all()) {
        debug!(path = %dir.display(), error = %e, "directory sync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn parse_generation(name: &str) -> Option<u64> {
    let rest = name
        .strip_prefix("vectors-")
        .and_then(|r| r.strip_suffix(".bin"))
        .or_else(|| {
            name.strip_prefix("chunks-")
                .and_then(|r| r.strip_suffix(".json"))
        })?;
    rest.parse().ok()
}

/// Best-effort removal of generations older than `keep`.
fn remove_older_generations(location: &Path, keep: u64) {
    let entries = match fs::read_dir(location) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %location.display(), error = %e, "could not list index directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(generation) = name.to_str().and_then(parse_generation) else {
            continue;
        };
        if generation < keep {
            let path = entry.path();
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not remove stale index file");
            }
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, IndexError> {
    fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            corrupt(path, "generation file missing")
        } else {
            io_err(path)(e)
        }
    })
}

/// Parse and verify a vector file. Returns `(dims, vectors)`.
fn decode_vectors(path: &Path, bytes: &[u8]) -> Result<(usize, Vec<Vec<f32>>), IndexError> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(corrupt(path, format!("truncated ({} bytes)", bytes.len())));
    }
    if &bytes[0..4] != MAGIC {
        return Err(corrupt(path, "bad magic"));
    }
    let read_u32 = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let version = read_u32(4);
    if version != FORMAT_VERSION {
        return Err(corrupt(path, format!("unsupported format version {}", version)));
    }
    let dims = read_u32(8) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[12..20]);
    let count = u64::from_le_bytes(count_bytes);
    if dims == 0 && count > 0 {
        return Err(corrupt(path, format!("{} entries with zero dimensions", count)));
    }

    let payload_len = usize::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(dims))
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt(path, "header sizes overflow"))?;
    let expected_len = HEADER_LEN + payload_len + CHECKSUM_LEN;
    if bytes.len() < expected_len {
        return Err(corrupt(
            path,
            format!("truncated ({} of {} bytes)", bytes.len(), expected_len),
        ));
    }
    if bytes.len() > expected_len {
        return Err(corrupt(
            path,
            format!("{} trailing bytes", bytes.len() - expected_len),
        ));
    }

    let (body, trailer) = bytes.split_at(expected_len - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != trailer {
        return Err(corrupt(path, "checksum mismatch"));
    }

    let payload = &body[HEADER_LEN..];
    let vectors = if dims == 0 {
        Vec::new()
    } else {
        payload.chunks_exact(dims * 4).map(from_le_bytes).collect()
    };
    Ok((dims, vectors))
}

/// Load the current generation under `location`, verifying integrity and
/// that its dimensionality equals `expected_dims`.
pub fn read_snapshot(location: &Path, expected_dims: usize) -> Result<Snapshot, IndexError> {
    let generation = current_generation(location)?.ok_or_else(|| IndexError::NotFound {
        path: location.to_path_buf(),
    })?;

    let vectors_path: PathBuf = location.join(vectors_name(generation));
    let chunks_path: PathBuf = location.join(chunks_name(generation));

    let sidecar_bytes = read_file(&chunks_path)?;
    let sidecar: Sidecar = serde_json::from_slice(&sidecar_bytes)
        .map_err(|e| corrupt(&chunks_path, format!("unreadable sidecar: {}", e)))?;
    if sidecar.format_version != FORMAT_VERSION {
        return Err(corrupt(
            &chunks_path,
            format!("unsupported format version {}", sidecar.format_version),
        ));
    }

    let vector_bytes = read_file(&vectors_path)?;
    let (dims, vectors) = decode_vectors(&vectors_path, &vector_bytes)?;
    if sha256_hex(&vector_bytes) != sidecar.vectors_sha256 {
        return Err(corrupt(&chunks_path, "sidecar does not match vector file"));
    }
    if sidecar.dims != dims {
        return Err(corrupt(
            &chunks_path,
            format!("sidecar dims {} but vector file dims {}", sidecar.dims, dims),
        ));
    }
    if vectors.len() != sidecar.entries.len() {
        return Err(IndexError::CountMismatch {
            path: location.to_path_buf(),
            vectors: vectors.len(),
            entries: sidecar.entries.len(),
        });
    }
    if dims != expected_dims {
        return Err(IndexError::DimensionMismatch {
            id: format!("index at {}", location.display()),
            expected: expected_dims,
            actual: dims,
        });
    }

    let entries = sidecar
        .entries
        .into_iter()
        .zip(vectors)
        .map(|(e, vector)| IndexEntry {
            chunk: Chunk {
                id: e.chunk_id,
                document_id: e.document_id,
                source: e.source,
                chunk_index: e.chunk_index,
                text: e.text,
                span: e.span,
            },
            vector,
        })
        .collect();

    debug!(path = %location.display(), generation, "index snapshot read");
    Ok(Snapshot {
        dims,
        metric: sidecar.metric,
        model: sidecar.model,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn entries(n: usize, dims: usize) -> Vec<IndexEntry> {
        (0..n)
            .map(|i| {
                let text = format!("chunk number {}", i);
                IndexEntry {
                    chunk: Chunk {
                        id: Chunk::make_id("doc", i),
                        document_id: "doc".to_string(),
                        source: "doc.txt".to_string(),
                        chunk_index: i,
                        span: Span {
                            start: i * 10,
                            end: i * 10 + text.chars().count(),
                        },
                        text,
                    },
                    vector: (0..dims).map(|d| (i * dims + d) as f32 * 0.5).collect(),
                }
            })
            .collect()
    }

    fn save(dir: &Path, n: usize, dims: usize) -> u64 {
        let encoded = encode(dims, Metric::Cosine, "hash-embed", &entries(n, dims));
        write_generation(dir, &encoded).unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_entries() {
        let tmp = TempDir::new().unwrap();
        let original = entries(5, 3);
        let encoded = encode(3, Metric::Dot, "hash-embed", &original);
        write_generation(tmp.path(), &encoded).unwrap();

        let snapshot = read_snapshot(tmp.path(), 3).unwrap();
        assert_eq!(snapshot.dims, 3);
        assert_eq!(snapshot.metric, Metric::Dot);
        assert_eq!(snapshot.model, "hash-embed");
        assert_eq!(snapshot.entries, original);
    }

    #[test]
    fn test_generations_advance_and_old_ones_are_removed() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(save(tmp.path(), 2, 4), 1);
        assert_eq!(save(tmp.path(), 3, 4), 2);
        assert_eq!(current_generation(tmp.path()).unwrap(), Some(2));
        assert!(!tmp.path().join(vectors_name(1)).exists());
        assert!(!tmp.path().join(chunks_name(1)).exists());
        assert_eq!(read_snapshot(tmp.path(), 4).unwrap().entries.len(), 3);
    }

    #[test]
    fn test_interrupted_save_keeps_previous_generation() {
        let tmp = TempDir::new().unwrap();
        save(tmp.path(), 2, 4);
        // A crash after writing generation 2 but before swapping CURRENT.
        fs::write(tmp.path().join(vectors_name(2)), b"partial").unwrap();
        let snapshot = read_snapshot(tmp.path(), 4).unwrap();
        assert_eq!(snapshot.entries.len(), 2);
    }

    #[test]
    fn test_missing_index_is_not_found() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            read_snapshot(tmp.path(), 4),
            Err(IndexError::NotFound { .. })
        ));
    }

    #[test]
    fn test_truncated_vectors_detected() {
        let tmp = TempDir::new().unwrap();
        save(tmp.path(), 3, 4);
        let path = tmp.path().join(vectors_name(1));
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        let err = read_snapshot(tmp.path(), 4).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }), "{err}");
    }

    #[test]
    fn test_flipped_byte_detected() {
        let tmp = TempDir::new().unwrap();
        save(tmp.path(), 3, 4);
        let path = tmp.path().join(vectors_name(1));
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_LEN + 5] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        let err = read_snapshot(tmp.path(), 4).unwrap_err();
        assert!(err.to_string().contains("checksum"), "{err}");
    }

    #[test]
    fn test_sidecar_count_mismatch_detected() {
        let tmp = TempDir::new().unwrap();
        save(tmp.path(), 3, 4);
        let path = tmp.path().join(chunks_name(1));
        let mut sidecar: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        sidecar["entries"].as_array_mut().unwrap().pop();
        fs::write(&path, serde_json::to_vec(&sidecar).unwrap()).unwrap();

        let err = read_snapshot(tmp.path(), 4).unwrap_err();
        assert!(matches!(
            err,
            IndexError::CountMismatch {
                vectors: 3,
                entries: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_garbage_pointer_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CURRENT_FILE), "not-a-number").unwrap();
        assert!(matches!(
            read_snapshot(tmp.path(), 4),
            Err(IndexError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_empty_index_roundtrip() {
        let tmp = TempDir::new().unwrap();
        save(tmp.path(), 0, 8);
        let snapshot = read_snapshot(tmp.path(), 8).unwrap();
        assert!(snapshot.entries.is_empty());
    }

    #[test]
    fn test_zero_dims_with_entries_is_corrupt() {
        let mut body = Vec::new();
        body.extend_from_slice(MAGIC);
        body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&u64::MAX.to_le_bytes());
        let digest = Sha256::digest(&body);
        body.extend_from_slice(digest.as_slice());

        let err = decode_vectors(Path::new("vectors-000001.bin"), &body).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }), "{err}");
        assert!(err.to_string().contains("zero dimensions"), "{err}");
    }

    #[test]
    fn test_parse_generation() {
        assert_eq!(parse_generation("vectors-000012.bin"), Some(12));
        assert_eq!(parse_generation("chunks-000003.json"), Some(3));
        assert_eq!(parse_generation("CURRENT"), None);
        assert_eq!(parse_generation("vectors-x.bin"), None);
    }
}
