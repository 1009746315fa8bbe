//! Okapi BM25 term statistics over chunk text.
//!
//! Kept alongside the vectors inside [`FlatIndex`](super::FlatIndex) so a
//! keyword search sees the same snapshot as a vector search.
//!
//! ```text
//! score(q, d) = Σ idf(t) · tf(t, d) · (k1 + 1) / (tf(t, d) + k1 · (1 − b + b · |d| / avgdl))
//! idf(t)      = ln(1 + (N − df(t) + 0.5) / (df(t) + 0.5))
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// BM25 tuning. `k1` controls term-frequency saturation, `b` length
/// normalization (0 disables it).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// Lowercased runs of alphanumeric characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Per-text term frequencies plus corpus-wide document frequencies.
/// Positions follow insertion order.
#[derive(Debug, Default)]
pub struct KeywordIndex {
    frequencies: Vec<HashMap<String, u32>>,
    lengths: Vec<u32>,
    doc_freq: HashMap<String, u32>,
    total_len: u64,
}

impl KeywordIndex {
    pub fn push(&mut self, text: &str) {
        let tokens = tokenize(text);
        let mut frequencies: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *frequencies.entry(token.clone()).or_insert(0) += 1;
        }
        for term in frequencies.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.lengths.push(tokens.len() as u32);
        self.total_len += tokens.len() as u64;
        self.frequencies.push(frequencies);
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// `(score, position)` for every text sharing at least one term with
    /// `query`. Unordered.
    pub fn score(&self, query: &str, params: Bm25Params) -> Vec<(f32, usize)> {
        let n = self.frequencies.len();
        if n == 0 {
            return Vec::new();
        }

        let weighted: Vec<(String, f32)> = tokenize(query)
            .into_iter()
            .filter_map(|term| {
                let df = *self.doc_freq.get(&term)?;
                Some((term, idf(n, df)))
            })
            .collect();
        if weighted.is_empty() {
            return Vec::new();
        }

        let avg_len = self.total_len as f32 / n as f32;
        self.frequencies
            .iter()
            .zip(&self.lengths)
            .enumerate()
            .filter_map(|(position, (frequencies, &len))| {
                let norm = 1.0 - params.b + params.b * len as f32 / avg_len;
                let mut score = 0.0;
                let mut matched = false;
                for (term, weight) in &weighted {
                    if let Some(&tf) = frequencies.get(term) {
                        let tf = tf as f32;
                        score += weight * tf * (params.k1 + 1.0) / (tf + params.k1 * norm);
                        matched = true;
                    }
                }
                matched.then_some((score, position))
            })
            .collect()
    }
}

fn idf(n: usize, df: u32) -> f32 {
    let n = n as f32;
    let df = df as f32;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(texts: &[&str]) -> KeywordIndex {
        let mut index = KeywordIndex::default();
        for text in texts {
            index.push(text);
        }
        index
    }

    fn ranked(index: &KeywordIndex, query: &str) -> Vec<usize> {
        let mut scored = index.score(query, Bm25Params::default());
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.into_iter().map(|(_, i)| i).collect()
    }

    #[test]
    fn test_tokenize_lowercases_and_splits_punctuation() {
        assert_eq!(
            tokenize("Cats, dogs & C3PO's café!"),
            vec!["cats", "dogs", "c3po", "s", "café"]
        );
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn test_only_matching_texts_are_scored() {
        let index = index(&["cats purr", "dogs bark", "cats and dogs"]);
        assert_eq!(ranked(&index, "cats"), vec![0, 2]);
        assert!(index.score("giraffe", Bm25Params::default()).is_empty());
    }

    #[test]
    fn test_rare_terms_outweigh_common_ones() {
        let index = index(&["the cat", "the dog", "the bird", "the cat again"]);
        let scored = index.score("the dog", Bm25Params::default());
        let best = scored.iter().max_by(|a, b| a.0.total_cmp(&b.0)).unwrap();
        assert_eq!(best.1, 1);
    }

    #[test]
    fn test_length_normalization() {
        let index = index(&["cats", "cats are mammals that sleep most of the day"]);
        assert_eq!(ranked(&index, "cats"), vec![0, 1]);

        let flat = Bm25Params { k1: 1.5, b: 0.0 };
        let scored = index.score("cats", flat);
        assert!((scored[0].0 - scored[1].0).abs() < 1e-6);
    }

    #[test]
    fn test_term_frequency_saturates() {
        let index = index(&["rust", "rust rust rust rust rust rust rust rust", "go"]);
        let scored = index.score("rust", Bm25Params { k1: 1.5, b: 0.0 });
        let (once, many) = (scored[0].0, scored[1].0);
        assert!(many > once);
        assert!(many < once * (1.5 + 1.0));
    }

    #[test]
    fn test_empty_index_scores_nothing() {
        let index = KeywordIndex::default();
        assert!(index.is_empty());
        assert!(index.score("anything", Bm25Params::default()).is_empty());
    }
}
