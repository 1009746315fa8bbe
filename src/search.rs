//! Retrieval strategies and hybrid score blending.
//!
//! - **vector**: cosine (or dot) similarity against the question embedding.
//! - **bm25**: keyword scoring over chunk text; needs no embedding call.
//! - **hybrid**: both candidate lists, each min-max normalized to `[0, 1]`,
//!   blended as `(1 − alpha) · keyword + alpha · vector`. A chunk missing
//!   from one list scores 0 on that side.
//!
//! Results keep the index ordering: score descending, chunk id ascending.

use std::collections::HashMap;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use groundwork_core::index::rank_order;
use groundwork_core::{Chunk, RetrievalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalStrategy {
    #[default]
    Vector,
    Bm25,
    Hybrid,
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetrievalStrategy::Vector => "vector",
            RetrievalStrategy::Bm25 => "bm25",
            RetrievalStrategy::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

/// Min-max normalize scores to `[0, 1]`. A list whose scores are all
/// equal normalizes to 1.0 throughout.
pub fn normalize_scores(results: &[RetrievalResult]) -> Vec<f32> {
    if results.is_empty() {
        return Vec::new();
    }

    let s_min = results.iter().map(|r| r.score).fold(f32::INFINITY, f32::min);
    let s_max = results
        .iter()
        .map(|r| r.score)
        .fold(f32::NEG_INFINITY, f32::max);

    results
        .iter()
        .map(|r| {
            if (s_max - s_min).abs() < f32::EPSILON {
                1.0
            } else {
                (r.score - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Merge keyword and vector candidates into the top `k` by blended score.
pub fn blend(
    keyword: &[RetrievalResult],
    vector: &[RetrievalResult],
    alpha: f32,
    k: usize,
) -> Vec<RetrievalResult> {
    let mut merged: HashMap<&str, (&Chunk, f32, f32)> = HashMap::new();
    for (result, score) in keyword.iter().zip(normalize_scores(keyword)) {
        merged
            .entry(result.chunk.id.as_str())
            .or_insert((&result.chunk, 0.0, 0.0))
            .1 = score;
    }
    for (result, score) in vector.iter().zip(normalize_scores(vector)) {
        merged
            .entry(result.chunk.id.as_str())
            .or_insert((&result.chunk, 0.0, 0.0))
            .2 = score;
    }

    let mut blended: Vec<RetrievalResult> = merged
        .into_values()
        .map(|(chunk, k_score, v_score)| RetrievalResult {
            chunk: chunk.clone(),
            score: (1.0 - alpha) * k_score + alpha * v_score,
        })
        .collect();
    blended.sort_by(|a, b| rank_order(a.score, &a.chunk.id, b.score, &b.chunk.id));
    blended.truncate(k);
    blended
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundwork_core::Span;

    fn result(chunk_id: &str, score: f32) -> RetrievalResult {
        RetrievalResult {
            chunk: Chunk {
                id: chunk_id.to_string(),
                document_id: "doc".to_string(),
                source: "doc.txt".to_string(),
                chunk_index: 0,
                span: Span { start: 0, end: 0 },
                text: String::new(),
            },
            score,
        }
    }

    fn ids(results: &[RetrievalResult]) -> Vec<&str> {
        results.iter().map(|r| r.chunk.id.as_str()).collect()
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let scores = normalize_scores(&[result("c1", 5.0)]);
        assert_eq!(scores.len(), 1);
        assert!((scores[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_range() {
        let scores = normalize_scores(&[
            result("c1", 10.0),
            result("c2", 5.0),
            result("c3", 0.0),
        ]);
        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert!((scores[1] - 0.5).abs() < 1e-6);
        assert!(scores[2].abs() < 1e-6);
    }

    #[test]
    fn test_normalize_all_equal() {
        let scores = normalize_scores(&[result("c1", 3.0), result("c2", 3.0)]);
        assert!(scores.iter().all(|s| (s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_scores_always_in_unit() {
        let scores = normalize_scores(&[
            result("c1", -5.0),
            result("c2", 100.0),
            result("c3", 42.0),
        ]);
        for score in scores {
            assert!((0.0..=1.0).contains(&score), "score out of range: {}", score);
        }
    }

    #[test]
    fn test_hybrid_alpha_zero_equals_keyword() {
        let keyword = vec![result("c1", 10.0), result("c2", 5.0), result("c3", 1.0)];
        let vector = vec![result("c2", 0.9), result("c1", 0.1)];

        let blended = blend(&keyword, &vector, 0.0, 3);
        assert_eq!(ids(&blended), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_hybrid_alpha_one_equals_vector() {
        let keyword = vec![result("c1", 10.0), result("c2", 5.0)];
        let vector = vec![result("c3", 0.9), result("c2", 0.5), result("c1", 0.1)];

        let blended = blend(&keyword, &vector, 1.0, 3);
        assert_eq!(ids(&blended), vec!["c3", "c2", "c1"]);
    }

    #[test]
    fn test_hybrid_weights_combine_both_lists() {
        // c1 wins keyword, c2 wins vector; alpha 0.6 favors the vector side.
        let keyword = vec![result("c1", 8.0), result("c2", 2.0)];
        let vector = vec![result("c2", 0.9), result("c1", 0.3)];

        let blended = blend(&keyword, &vector, 0.6, 2);
        assert_eq!(ids(&blended), vec!["c2", "c1"]);
        assert!((blended[0].score - 0.6).abs() < 1e-6);
        assert!((blended[1].score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_hybrid_ties_break_by_chunk_id_and_truncate() {
        let keyword = vec![result("b", 1.0), result("a", 1.0)];
        let blended = blend(&keyword, &[], 0.5, 5);
        assert_eq!(ids(&blended), vec!["a", "b"]);
        assert!(blend(&keyword, &[], 0.5, 0).is_empty());
        assert_eq!(blend(&keyword, &[], 0.5, 1).len(), 1);
    }

    #[test]
    fn test_hybrid_merges_chunks_found_by_both() {
        let keyword = vec![result("c1", 4.0), result("c2", 1.0)];
        let vector = vec![result("c1", 0.8), result("c3", 0.2)];
        let blended = blend(&keyword, &vector, 0.5, 10);
        assert_eq!(blended.len(), 3);
        assert_eq!(blended[0].chunk.id, "c1");
        assert!((blended[0].score - 1.0).abs() < 1e-6);
    }
}
