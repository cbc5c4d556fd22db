//! Retrieval engine: vector, keyword and hybrid search over ingested chunks.
//!
//! # Modes
//!
//! | Mode | Source | Score |
//! |------|--------|-------|
//! | `vector` | vector index, threshold applied | cosine similarity |
//! | `keyword` | full-text store | configured keyword score |
//! | `hybrid` | both, `2 × limit` candidates each | weighted merge |
//!
//! The hybrid merge itself lives in [`ragline_core::scoring::merge_hybrid`].
//!
//! # Degradation
//!
//! - Vector path fails and `fallback_to_keyword` is set: keyword results.
//! - Keyword path fails in hybrid mode: vector results.
//! - Every path fails: [`RagError::SearchFailed`].
//!
//! Every non-blank query is recorded for analytics under the mode that
//! produced its results, including fallbacks. A failed search is recorded
//! under the requested mode with no results. Recording failures never fail
//! the search.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SearchConfig;
use crate::vector_index::VectorIndex;
use ragline_core::embedding::EmbeddingProvider;
use ragline_core::error::{RagError, Result};
use ragline_core::models::{ScoredChunk, SearchMode, SearchQueryRecord};
use ragline_core::scoring::{
    filter_threshold, into_scored, merge_hybrid, score_keyword_hits, Candidate, HybridWeights,
    KeywordScoring,
};
use ragline_core::store::Store;

/// Per-call overrides; `None` falls back to configuration.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub threshold: Option<f64>,
    pub mode: Option<SearchMode>,
}

impl SearchOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }
}

pub struct RetrievalEngine {
    store: Arc<dyn Store>,
    index: Arc<dyn VectorIndex>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: SearchConfig,
    keyword_scoring: KeywordScoring,
    track_searches: bool,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<dyn VectorIndex>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: SearchConfig,
        track_searches: bool,
    ) -> Self {
        let keyword_scoring = match config.keyword_scoring.as_str() {
            "bm25" => KeywordScoring::Normalized,
            _ => KeywordScoring::Fixed(config.fixed_keyword_score),
        };
        Self {
            store,
            index,
            embedder,
            config,
            keyword_scoring,
            track_searches,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Ranked chunks for `query`, best first, at most `limit` of them.
    ///
    /// A blank query returns no results and is not recorded.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<ScoredChunk>> {
        let query = query.trim();
        let limit = options.limit.unwrap_or(self.config.default_limit);
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let threshold = options.threshold.unwrap_or(self.config.similarity_threshold);
        let started = Instant::now();

        let outcome = self.run(query, limit, threshold, options.mode).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok((mode, results)) => {
                debug!(query, mode = mode.as_str(), results = results.len(), elapsed_ms, "search finished");
                self.record(query, mode, &results, elapsed_ms).await;
                Ok(results)
            }
            Err(e) => {
                warn!(query, error = %e, elapsed_ms, "search failed");
                let mode = options.mode.unwrap_or_else(|| self.default_mode());
                self.record(query, mode, &[], elapsed_ms).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        query: &str,
        limit: usize,
        threshold: f64,
        requested: Option<SearchMode>,
    ) -> Result<(SearchMode, Vec<ScoredChunk>)> {
        Ok(match self.resolve_mode(requested)? {
            SearchMode::Keyword => (SearchMode::Keyword, self.keyword_only(query, limit).await?),
            SearchMode::Vector => match self.vector_candidates(query, limit, threshold).await {
                Ok(hits) => (
                    SearchMode::Vector,
                    into_scored(filter_threshold(hits, threshold), limit),
                ),
                Err(e) if self.config.fallback_to_keyword => {
                    warn!(error = %e, "vector search failed, falling back to keyword search");
                    (SearchMode::Keyword, self.keyword_only(query, limit).await?)
                }
                Err(e) => return Err(RagError::SearchFailed(e.to_string())),
            },
            SearchMode::Hybrid => self.hybrid(query, limit, threshold).await?,
        })
    }

    fn default_mode(&self) -> SearchMode {
        if self.config.hybrid_enabled {
            SearchMode::Hybrid
        } else {
            SearchMode::Vector
        }
    }

    fn resolve_mode(&self, requested: Option<SearchMode>) -> Result<SearchMode> {
        let mode = requested.unwrap_or_else(|| self.default_mode());
        if mode == SearchMode::Keyword || self.embedder.is_some() {
            return Ok(mode);
        }
        if self.config.fallback_to_keyword {
            debug!("embeddings disabled, using keyword search");
            Ok(SearchMode::Keyword)
        } else {
            Err(RagError::SearchFailed(format!(
                "{} search requires an embedding provider",
                mode.as_str()
            )))
        }
    }

    async fn hybrid(
        &self,
        query: &str,
        limit: usize,
        threshold: f64,
    ) -> Result<(SearchMode, Vec<ScoredChunk>)> {
        let fetch = limit.saturating_mul(2);
        let (vector, keyword) = tokio::join!(
            self.vector_candidates(query, fetch, threshold),
            self.keyword_candidates(query, fetch)
        );
        let weights = HybridWeights {
            vector: self.config.vector_weight,
            keyword: self.config.keyword_weight,
        };

        match (vector, keyword) {
            (Ok(v), Ok(k)) => Ok((
                SearchMode::Hybrid,
                merge_hybrid(filter_threshold(v, threshold), k, weights, limit),
            )),
            (Ok(v), Err(e)) => {
                warn!(error = %e, "keyword search failed, using vector results only");
                Ok((SearchMode::Vector, into_scored(filter_threshold(v, threshold), limit)))
            }
            (Err(e), Ok(k)) if self.config.fallback_to_keyword => {
                warn!(error = %e, "vector search failed, using keyword results only");
                Ok((SearchMode::Keyword, into_scored(k, limit)))
            }
            (Err(e), Ok(_)) => Err(RagError::SearchFailed(e.to_string())),
            (Err(ve), Err(ke)) => Err(RagError::SearchFailed(format!(
                "vector: {}; keyword: {}",
                ve, ke
            ))),
        }
    }

    async fn keyword_only(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        let hits = self
            .keyword_candidates(query, limit)
            .await
            .map_err(|e| RagError::SearchFailed(e.to_string()))?;
        Ok(into_scored(hits, limit))
    }

    async fn keyword_candidates(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        let hits = self.store.keyword_search(query, limit).await?;
        Ok(score_keyword_hits(hits, self.keyword_scoring))
    }

    /// Nearest chunks by embedding. Content is resolved from the store;
    /// vectors whose chunk no longer exists are skipped.
    async fn vector_candidates(
        &self,
        query: &str,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<Candidate>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| RagError::ConfigurationMissing("embedding provider".to_string()))?;
        let embedding = embedder.generate(query).await?;
        let matches = self.index.query(&embedding, limit, threshold).await?;

        let mut candidates = Vec::with_capacity(matches.len());
        for m in matches {
            let Some(chunk) = self.store.get_chunk(&m.metadata.chunk_id).await? else {
                debug!(vector_id = %m.id, "skipping vector without a chunk");
                continue;
            };
            let document_title = if m.metadata.document_title.is_empty() {
                self.store
                    .get_document(&chunk.document_id)
                    .await?
                    .map(|d| d.title)
                    .unwrap_or_default()
            } else {
                m.metadata.document_title
            };
            candidates.push(Candidate {
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                document_title,
                content: chunk.content,
                raw_score: m.score,
            });
        }
        Ok(candidates)
    }

    async fn record(
        &self,
        query: &str,
        mode: SearchMode,
        results: &[ScoredChunk],
        latency_ms: u64,
    ) {
        if !self.track_searches {
            return;
        }
        let record = SearchQueryRecord {
            id: Uuid::new_v4().to_string(),
            query_text: query.to_string(),
            mode,
            result_count: results.len(),
            latency_ms,
            similarity_scores: results.iter().map(|r| r.similarity_score).collect(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_search(&record).await {
            warn!(error = %e, "failed to record search query");
        }
    }
}
