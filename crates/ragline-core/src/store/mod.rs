//! Storage abstraction for ragline (the DocumentStore).
//!
//! The [`Store`] trait is the relational source of truth for documents,
//! chunks, processing jobs and analytics rows. Pipeline steps coordinate
//! only through this state, never through shared memory.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{ApiUsageRecord, Chunk, Document, ProcessingJob, SearchQueryRecord};
use crate::scoring::Candidate;

/// Chunk totals for one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCounts {
    pub total: usize,
    pub synced: usize,
}

/// Aggregate counts across the whole store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub documents_by_status: BTreeMap<String, usize>,
    pub total_chunks: usize,
    pub synced_chunks: usize,
    pub jobs_by_status: BTreeMap<String, usize>,
    pub search_queries: usize,
    pub api_calls: usize,
    pub total_cost_usd: f64,
}

/// Rows removed by [`Store::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneCounts {
    pub search_queries: usize,
    pub api_usage: usize,
    pub failed_jobs: usize,
}

impl PruneCounts {
    pub fn total(&self) -> usize {
        self.search_queries + self.api_usage + self.failed_jobs
    }
}

/// Abstract storage backend for ragline.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_document`](Store::insert_document) | Insert, or return the row already holding the content hash |
/// | [`delete_document`](Store::delete_document) | Delete a document with its chunks and jobs |
/// | [`replace_chunks`](Store::replace_chunks) | Purge and recreate a document's chunks |
/// | [`update_chunk`](Store::update_chunk) | Persist chunk sync state (hash must match content) |
/// | [`unsynced_chunks`](Store::unsynced_chunks) | Chunks lacking a vector-sync timestamp |
/// | [`keyword_search`](Store::keyword_search) | Full-text search over chunk content |
/// | [`find_job_by_external_id`](Store::find_job_by_external_id) | Resolve webhook and poll callbacks |
/// | [`record_search`](Store::record_search) | Append a search analytics row |
/// | [`record_usage`](Store::record_usage) | Append an API usage row |
/// | [`prune`](Store::prune) | Drop old analytics rows and failed jobs |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new document.
    ///
    /// If a document with the same `content_hash` already exists, nothing is
    /// written and the existing row is returned instead.
    async fn insert_document(&self, doc: &Document) -> Result<Document>;

    async fn update_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>>;

    /// All documents, newest first.
    async fn list_documents(&self) -> Result<Vec<Document>>;

    /// Delete a document, cascading to its chunks and processing jobs.
    ///
    /// Returns `false` when no such document existed.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// Remove every document, chunk and job. Analytics rows are kept.
    async fn clear(&self) -> Result<()>;

    /// Replace all chunks of a document atomically.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>>;

    /// Persist an updated chunk. Rejects rows whose hash does not match
    /// their content.
    async fn update_chunk(&self, chunk: &Chunk) -> Result<()>;

    /// Chunks of a document in ordinal order.
    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn unsynced_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn count_chunks(&self, document_id: &str) -> Result<ChunkCounts>;

    /// Keyword search over chunk content.
    ///
    /// `raw_score` carries the backend's relevance (higher is better).
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>>;

    async fn insert_job(&self, job: &ProcessingJob) -> Result<()>;

    async fn update_job(&self, job: &ProcessingJob) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<ProcessingJob>>;

    async fn find_job_by_external_id(&self, external_job_id: &str) -> Result<Option<ProcessingJob>>;

    /// Jobs owned by a document, oldest first.
    async fn jobs_for_document(&self, document_id: &str) -> Result<Vec<ProcessingJob>>;

    async fn record_search(&self, record: &SearchQueryRecord) -> Result<()>;

    async fn record_usage(&self, record: &ApiUsageRecord) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Delete search and usage rows, and `failed` jobs, created before
    /// `cutoff`.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneCounts>;

    /// Compact the keyword index. Backends without one do nothing.
    async fn optimize_search(&self) -> Result<()> {
        Ok(())
    }
}

/// Lowercased alphanumeric query terms, deduplicated, in query order.
///
/// Shared by the keyword backends so punctuation in user queries never
/// reaches a full-text parser.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        if !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_terms_strip_punctuation() {
        assert_eq!(
            query_terms("What's the \"deploy\" flow? deploy!"),
            vec!["what", "s", "the", "deploy", "flow"]
        );
    }

    #[test]
    fn test_query_terms_empty() {
        assert!(query_terms("  ?! ").is_empty());
    }
}
