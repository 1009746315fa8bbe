//! Overlapping, character-based text splitter.
//!
//! Splits a [`Document`] into [`Chunk`]s of at most `chunk_size`
//! characters. Consecutive chunks share exactly `overlap` characters, so
//! the spans cover the whole text with no gap, and a remainder shorter
//! than `chunk_size` becomes the final chunk as-is.
//!
//! # Modes
//!
//! - [`SplitMode::Character`] cuts fixed windows of `chunk_size` characters.
//! - [`SplitMode::Recursive`] pulls each window's end back to the last
//!   paragraph break (`\n\n`), then line break, then whitespace, as long as
//!   the window stays longer than the overlap. Text without any such break
//!   falls back to a hard cut.
//!
//! Offsets are counted in characters, never bytes, so multi-byte UTF-8 is
//! never split. The result depends only on `(text, chunk_size, overlap,
//! mode)`.
//!
//! # Example
//!
//! ```rust
//! use groundwork_core::chunk::{SplitMode, TextSplitter};
//! use groundwork_core::Document;
//!
//! let splitter = TextSplitter::new(50, 0, SplitMode::Recursive).unwrap();
//! let doc = Document::new("cat.txt", "The cat sat on the mat.");
//! let chunks = splitter.split(&doc);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].text, "The cat sat on the mat.");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Chunk, Document, Span};

/// Window boundary strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    #[default]
    Recursive,
    Character,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitterError {
    #[error("chunk_size must be > 0")]
    ZeroChunkSize,

    #[error("chunk_overlap ({overlap}) must be smaller than chunk_size ({chunk_size})")]
    OverlapTooLarge { chunk_size: usize, overlap: usize },
}

/// Deterministic document splitter.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    overlap: usize,
    mode: SplitMode,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, overlap: usize, mode: SplitMode) -> Result<Self, SplitterError> {
        if chunk_size == 0 {
            return Err(SplitterError::ZeroChunkSize);
        }
        if overlap >= chunk_size {
            return Err(SplitterError::OverlapTooLarge {
                chunk_size,
                overlap,
            });
        }
        Ok(Self {
            chunk_size,
            overlap,
            mode,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split a document into chunks with contiguous indices starting at 0.
    ///
    /// Empty text yields no chunks.
    pub fn split(&self, doc: &Document) -> Vec<Chunk> {
        let offsets: Vec<usize> = doc
            .text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(doc.text.len()))
            .collect();

        self.spans(&doc.text)
            .into_iter()
            .enumerate()
            .map(|(index, span)| Chunk {
                id: Chunk::make_id(&doc.id, index),
                document_id: doc.id.clone(),
                source: doc.source.clone(),
                chunk_index: index,
                text: doc.text[offsets[span.start]..offsets[span.end]].to_string(),
                span,
            })
            .collect()
    }

    /// Compute chunk spans (character offsets) for `text`.
    pub fn spans(&self, text: &str) -> Vec<Span> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let mut spans = Vec::new();
        if total == 0 {
            return spans;
        }

        let mut start = 0;
        loop {
            if total - start <= self.chunk_size {
                spans.push(Span { start, end: total });
                break;
            }
            let hard_end = start + self.chunk_size;
            let end = match self.mode {
                SplitMode::Character => hard_end,
                SplitMode::Recursive => {
                    find_break(&chars, start + self.overlap + 1, hard_end).unwrap_or(hard_end)
                }
            };
            spans.push(Span { start, end });
            // end > start + overlap, so the next window always advances.
            start = end - self.overlap;
        }
        spans
    }
}

/// Find the best window end in `min_end..=max_end`, preferring paragraph
/// breaks over line breaks over any whitespace.
fn find_break(chars: &[char], min_end: usize, max_end: usize) -> Option<usize> {
    let paragraph = |e: usize| e >= 2 && chars[e - 2] == '\n' && chars[e - 1] == '\n';
    let line = |e: usize| chars[e - 1] == '\n';
    let word = |e: usize| {
        chars[e - 1].is_whitespace() || chars.get(e).map_or(true, |c| c.is_whitespace())
    };

    let candidates = |pred: &dyn Fn(usize) -> bool| (min_end..=max_end).rev().find(|&e| pred(e));

    candidates(&paragraph)
        .or_else(|| candidates(&line))
        .or_else(|| candidates(&word))
}
