//! Ranking math for the retrieval engine.
//!
//! Everything here is pure: the engine fetches candidates from the vector
//! index and the keyword store, then uses these functions to filter, merge
//! and summarize them.
//!
//! # Hybrid Merge
//!
//! 1. Seed the result set with vector hits: `score = similarity × vector_weight`.
//! 2. For each keyword hit already present, add `keyword_score × keyword_weight`.
//! 3. Insert the remaining keyword hits with `score = keyword_score × keyword_weight`.
//! 4. Sort by score (desc, stable), truncate to `limit`.

use std::collections::HashMap;

use crate::models::ScoredChunk;

/// A raw hit from one retrieval path.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub content: String,
    /// Cosine similarity for vector hits, backend relevance for keyword hits.
    pub raw_score: f64,
}

/// Weights applied to each retrieval path in hybrid mode.
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub vector: f64,
    pub keyword: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: 0.8,
            keyword: 0.2,
        }
    }
}

/// How keyword hits are scored before merging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeywordScoring {
    /// Every keyword hit gets the same relevance.
    Fixed(f64),
    /// Min-max normalize the backend's raw relevance into `[0, 1]`.
    Normalized,
}

impl Default for KeywordScoring {
    fn default() -> Self {
        KeywordScoring::Fixed(0.5)
    }
}

/// Replace raw keyword relevance with the configured policy's score.
pub fn score_keyword_hits(hits: Vec<Candidate>, scoring: KeywordScoring) -> Vec<Candidate> {
    match scoring {
        KeywordScoring::Fixed(value) => hits
            .into_iter()
            .map(|mut c| {
                c.raw_score = value;
                c
            })
            .collect(),
        KeywordScoring::Normalized => {
            let normalized: Vec<f64> = normalize_scores(&hits)
                .into_iter()
                .map(|(_, s)| s)
                .collect();
            hits.into_iter()
                .zip(normalized)
                .map(|(mut c, s)| {
                    c.raw_score = s;
                    c
                })
                .collect()
        }
    }
}

/// Keep candidates with `raw_score >= threshold`.
pub fn filter_threshold(candidates: Vec<Candidate>, threshold: f64) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| c.raw_score >= threshold)
        .collect()
}

/// Single-path results: the raw score is both similarity and rank score.
pub fn into_scored(candidates: Vec<Candidate>, limit: usize) -> Vec<ScoredChunk> {
    let mut out: Vec<ScoredChunk> = candidates
        .into_iter()
        .map(|c| ScoredChunk {
            chunk_id: c.chunk_id,
            document_id: c.document_id,
            document_title: c.document_title,
            content: c.content,
            similarity_score: c.raw_score,
            score: c.raw_score,
        })
        .collect();
    sort_desc(&mut out);
    out.truncate(limit);
    out
}

/// Merge vector and keyword hits into one weighted ranking.
pub fn merge_hybrid(
    vector_hits: Vec<Candidate>,
    keyword_hits: Vec<Candidate>,
    weights: HybridWeights,
    limit: usize,
) -> Vec<ScoredChunk> {
    let mut merged: Vec<ScoredChunk> = Vec::with_capacity(vector_hits.len() + keyword_hits.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for c in vector_hits {
        if positions.contains_key(&c.chunk_id) {
            continue;
        }
        positions.insert(c.chunk_id.clone(), merged.len());
        merged.push(ScoredChunk {
            score: c.raw_score * weights.vector,
            similarity_score: c.raw_score,
            chunk_id: c.chunk_id,
            document_id: c.document_id,
            document_title: c.document_title,
            content: c.content,
        });
    }

    for c in keyword_hits {
        let boost = c.raw_score * weights.keyword;
        if let Some(&idx) = positions.get(&c.chunk_id) {
            merged[idx].score += boost;
            continue;
        }
        positions.insert(c.chunk_id.clone(), merged.len());
        merged.push(ScoredChunk {
            score: boost,
            similarity_score: c.raw_score,
            chunk_id: c.chunk_id,
            document_id: c.document_id,
            document_title: c.document_title,
            content: c.content,
        });
    }

    sort_desc(&mut merged);
    merged.truncate(limit);
    merged
}

/// Mean similarity of the chunks used as context, clamped to `[0, 1]`.
pub fn confidence(results: &[ScoredChunk]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let sum: f64 = results.iter().map(|r| r.similarity_score).sum();
    (sum / results.len() as f64).clamp(0.0, 1.0)
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[Candidate]) -> Vec<(&Candidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

fn sort_desc(results: &mut [ScoredChunk]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(chunk_id: &str, score: f64) -> Candidate {
        Candidate {
            chunk_id: chunk_id.to_string(),
            document_id: format!("doc-{chunk_id}"),
            document_title: "Title".to_string(),
            content: String::new(),
            raw_score: score,
        }
    }

    #[test]
    fn test_merge_boosts_shared_chunk() {
        let merged = merge_hybrid(
            vec![make_candidate("c1", 0.9)],
            vec![make_candidate("c1", 0.5)],
            HybridWeights::default(),
            10,
        );
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - 0.82).abs() < 1e-9);
        assert!((merged[0].similarity_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_merge_keyword_only_entry() {
        let merged = merge_hybrid(
            vec![make_candidate("v", 0.75)],
            vec![make_candidate("k", 0.5)],
            HybridWeights::default(),
            10,
        );
        assert_eq!(merged[0].chunk_id, "v");
        assert!((merged[0].score - 0.6).abs() < 1e-9);
        assert_eq!(merged[1].chunk_id, "k");
        assert!((merged[1].score - 0.1).abs() < 1e-9);
        assert!((merged[1].similarity_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_merge_sorts_and_truncates() {
        let merged = merge_hybrid(
            vec![make_candidate("a", 0.2), make_candidate("b", 0.95), make_candidate("c", 0.5)],
            vec![make_candidate("a", 0.5)],
            HybridWeights::default(),
            2,
        );
        let ids: Vec<&str> = merged.iter().map(|m| m.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_merge_ignores_duplicate_vector_hits() {
        let merged = merge_hybrid(
            vec![make_candidate("a", 0.9), make_candidate("a", 0.1)],
            vec![],
            HybridWeights::default(),
            10,
        );
        assert_eq!(merged.len(), 1);
        assert!((merged[0].similarity_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let kept = filter_threshold(
            vec![make_candidate("a", 0.7), make_candidate("b", 0.69), make_candidate("c", 0.71)],
            0.7,
        );
        let ids: Vec<&str> = kept.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_fixed_keyword_scoring() {
        let scored = score_keyword_hits(
            vec![make_candidate("a", 12.0), make_candidate("b", 3.0)],
            KeywordScoring::Fixed(0.5),
        );
        assert!(scored.iter().all(|c| (c.raw_score - 0.5).abs() < 1e-9));
    }

    #[test]
    fn test_normalized_keyword_scoring() {
        let scored = score_keyword_hits(
            vec![make_candidate("a", 10.0), make_candidate("b", 5.0), make_candidate("c", 0.0)],
            KeywordScoring::Normalized,
        );
        assert!((scored[0].raw_score - 1.0).abs() < 1e-9);
        assert!((scored[1].raw_score - 0.5).abs() < 1e-9);
        assert!((scored[2].raw_score - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_mean_and_bounds() {
        assert_eq!(confidence(&[]), 0.0);
        let results = into_scored(vec![make_candidate("a", 0.9), make_candidate("b", 0.7)], 10);
        assert!((confidence(&results) - 0.8).abs() < 1e-9);
        let over = into_scored(vec![make_candidate("a", 1.2)], 10);
        assert_eq!(confidence(&over), 1.0);
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![make_candidate("c1", 3.0), make_candidate("c2", 3.0)];
        for (_, score) in normalize_scores(&candidates) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_scores_always_in_unit() {
        let candidates = vec![
            make_candidate("c1", -5.0),
            make_candidate("c2", 100.0),
            make_candidate("c3", 42.0),
        ];
        for (_, score) in normalize_scores(&candidates) {
            assert!((0.0..=1.0).contains(&score), "Score out of range: {}", score);
        }
    }
}
