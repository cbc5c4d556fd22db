//! Core data types for the ragline pipeline.
//!
//! These types represent the relational source of truth: documents,
//! their chunks, the processing jobs that move them through the
//! pipeline, and the append-only analytics records.
//!
//! # Data Flow
//!
//! ```text
//! ingest ──▶ Document (pending) ──▶ ChunkExtractor ──▶ Chunk rows
//!                                                       │
//!                          EmbeddingProvider ◀──────────┘
//!                                 │
//!                                 ▼
//!                          VectorIndex upsert ──▶ Chunk.vector_synced_at
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::sha256_hex;
use crate::error::{RagError, Result};

/// Free-form string metadata attached to documents and chunks.
pub type Metadata = BTreeMap<String, String>;

/// Where a document's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Upload,
    Url,
    Api,
    Text,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Upload => "upload",
            SourceKind::Url => "url",
            SourceKind::Api => "api",
            SourceKind::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(SourceKind::Upload),
            "url" => Some(SourceKind::Url),
            "api" => Some(SourceKind::Api),
            "text" => Some(SourceKind::Text),
            _ => None,
        }
    }
}

/// Document processing state.
///
/// `pending → processing → {completed | failed}`; a reprocess request
/// moves a terminal document back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }

    fn allows(&self, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of asynchronous work tracked by a [`ProcessingJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DocumentProcessing,
    EmbeddingGeneration,
    VectorSync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DocumentProcessing => "document_processing",
            JobKind::EmbeddingGeneration => "embedding_generation",
            JobKind::VectorSync => "vector_sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document_processing" => Some(JobKind::DocumentProcessing),
            "embedding_generation" => Some(JobKind::EmbeddingGeneration),
            "vector_sync" => Some(JobKind::VectorSync),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing job state.
///
/// `queued → processing → {completed | failed}`, plus
/// `failed → retrying → processing` while retries remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "retrying" => Some(JobStatus::Retrying),
            _ => None,
        }
    }

    fn allows(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Retrying)
                | (Retrying, Processing)
                | (Retrying, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which retrieval path produced a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Vector,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" | "semantic" => Some(SearchMode::Vector),
            "keyword" => Some(SearchMode::Keyword),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }
}

/// An ingested document and its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub source_kind: SourceKind,
    /// Blob storage handle of the raw content, once stored.
    pub source_path: Option<String>,
    pub original_filename: Option<String>,
    /// SHA-256 of the raw bytes; unique across documents.
    pub content_hash: String,
    pub byte_size: u64,
    pub media_type: String,
    pub status: DocumentStatus,
    pub external_job_id: Option<String>,
    pub processing_job_id: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        title: &str,
        source_kind: SourceKind,
        content_hash: String,
        byte_size: u64,
        media_type: &str,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            source_kind,
            source_path: None,
            original_filename: None,
            content_hash,
            byte_size,
            media_type: media_type.to_string(),
            status: DocumentStatus::Pending,
            external_job_id: None,
            processing_job_id: None,
            processing_started_at: None,
            processing_completed_at: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, stamping the processing timestamps.
    pub fn transition(&mut self, to: DocumentStatus) -> Result<()> {
        if !self.status.allows(to) {
            return Err(RagError::InvalidTransition {
                entity: "document",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        match to {
            DocumentStatus::Processing => self.processing_started_at = Some(now),
            DocumentStatus::Completed => self.processing_completed_at = Some(now),
            DocumentStatus::Pending => {
                self.external_job_id = None;
                self.processing_started_at = None;
                self.processing_completed_at = None;
            }
            DocumentStatus::Failed => {}
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// A retrievable span of a document's text.
///
/// `chunk_hash` always equals `sha256(content)`; use [`Chunk::set_content`]
/// to change the text so the hash and sync state stay consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub chunk_hash: String,
    pub vector_id: Option<String>,
    /// `None` means the chunk is not (or no longer) in the vector index.
    pub vector_synced_at: Option<DateTime<Utc>>,
    pub embedding_model: Option<String>,
    pub embedding_dimensions: Option<usize>,
    pub metadata: Metadata,
    pub keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(document_id: &str, chunk_index: i64, content: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            chunk_index,
            content: content.to_string(),
            chunk_hash: sha256_hex(content.as_bytes()),
            vector_id: None,
            vector_synced_at: None,
            embedding_model: None,
            embedding_dimensions: None,
            metadata: Metadata::new(),
            keywords: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the text, recomputing the hash and clearing sync state
    /// when the content actually changed.
    pub fn set_content(&mut self, content: &str) {
        if content == self.content {
            return;
        }
        self.content = content.to_string();
        self.chunk_hash = sha256_hex(content.as_bytes());
        self.vector_synced_at = None;
        self.updated_at = Utc::now();
    }

    pub fn hash_matches(&self) -> bool {
        self.chunk_hash == sha256_hex(self.content.as_bytes())
    }

    pub fn is_synced(&self) -> bool {
        self.vector_synced_at.is_some()
    }

    /// Deterministic vector id for the current content.
    pub fn expected_vector_id(&self) -> String {
        format!("chunk_{}_{}", self.id, self.chunk_hash)
    }

    pub fn record_embedding(&mut self, model: &str, dimensions: usize) {
        self.embedding_model = Some(model.to_string());
        self.embedding_dimensions = Some(dimensions);
        self.updated_at = Utc::now();
    }

    pub fn mark_synced(&mut self, vector_id: String) {
        let now = Utc::now();
        self.vector_id = Some(vector_id);
        self.vector_synced_at = Some(now);
        self.updated_at = now;
    }
}

/// Lifecycle record for one unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: String,
    pub document_id: Option<String>,
    pub chunk_id: Option<String>,
    pub kind: JobKind,
    pub status: JobStatus,
    pub external_job_id: Option<String>,
    pub provider: String,
    /// Percentage in `[0, 100]`, never decreasing.
    pub progress: f64,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    pub fn new(kind: JobKind, document_id: Option<&str>, provider: &str, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.map(str::to_string),
            chunk_id: None,
            kind,
            status: JobStatus::Queued,
            external_job_id: None,
            provider: provider.to_string(),
            progress: 0.0,
            error_message: None,
            retry_count: 0,
            max_retries,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_chunk(mut self, chunk_id: &str) -> Self {
        self.chunk_id = Some(chunk_id.to_string());
        self
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.allows(to) {
            return Err(RagError::InvalidTransition {
                entity: "job",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_started(&mut self) -> Result<()> {
        self.transition(JobStatus::Processing)?;
        if self.started_at.is_none() {
            self.started_at = Some(self.updated_at);
        }
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100.0;
        self.error_message = None;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_failed(&mut self, message: &str) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.to_string());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// `failed → retrying`, consuming one retry.
    pub fn mark_retrying(&mut self) -> Result<()> {
        if !self.can_retry() {
            return Err(RagError::InvalidTransition {
                entity: "job",
                from: self.status.to_string(),
                to: JobStatus::Retrying.to_string(),
            });
        }
        self.transition(JobStatus::Retrying)?;
        self.retry_count += 1;
        self.completed_at = None;
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn update_progress(&mut self, progress: f64) {
        let clamped = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 100.0)
        };
        if clamped > self.progress {
            self.progress = clamped;
            self.updated_at = Utc::now();
        }
    }

    /// Completed, or failed with no retries left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed => true,
            JobStatus::Failed => !self.can_retry(),
            _ => false,
        }
    }
}

/// A chunk as returned by an extractor, before it is materialized into a
/// [`Chunk`] row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedChunk {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// A retrieved chunk with its scores, in ranking order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub content: String,
    /// Similarity reported by the retrieval path that found the chunk.
    pub similarity_score: f64,
    /// Combined ranking score (equals the similarity outside hybrid mode).
    pub score: f64,
}

/// Point-in-time view of a document's progress through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub document_id: String,
    pub title: String,
    pub status: DocumentStatus,
    pub progress: f64,
    pub total_chunks: usize,
    pub synced_chunks: usize,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub jobs: Vec<ProcessingJob>,
}

impl StatusSnapshot {
    /// 100 when completed, 0 when failed, otherwise the synced share.
    pub fn progress_for(status: DocumentStatus, total: usize, synced: usize) -> f64 {
        match status {
            DocumentStatus::Completed => 100.0,
            DocumentStatus::Failed => 0.0,
            _ if total == 0 => 0.0,
            _ => (synced as f64 / total as f64 * 100.0).min(100.0),
        }
    }
}

/// Append-only analytics row for one search invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SearchQueryRecord {
    pub id: String,
    pub query_text: String,
    pub mode: SearchMode,
    pub result_count: usize,
    pub latency_ms: u64,
    pub similarity_scores: Vec<f64>,
    pub created_at: DateTime<Utc>,
}

/// Append-only accounting row for one remote provider call.
#[derive(Debug, Clone, Serialize)]
pub struct ApiUsageRecord {
    pub id: String,
    pub provider: String,
    pub operation: String,
    pub tokens_used: Option<u64>,
    pub cost_usd: Option<f64>,
    pub document_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApiUsageRecord {
    pub fn new(provider: &str, operation: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            operation: operation.to_string(),
            tokens_used: None,
            cost_usd: None,
            document_id: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ProcessingJob {
        ProcessingJob::new(JobKind::DocumentProcessing, Some("d1"), "local", 3)
    }

    #[test]
    fn test_chunk_hash_matches_content() {
        let chunk = Chunk::new("d1", 0, "Hello world.");
        assert_eq!(chunk.chunk_hash, sha256_hex(b"Hello world."));
        assert!(chunk.hash_matches());
    }

    #[test]
    fn test_set_content_resets_sync() {
        let mut chunk = Chunk::new("d1", 0, "before");
        chunk.mark_synced(chunk.expected_vector_id());
        assert!(chunk.is_synced());

        let old_hash = chunk.chunk_hash.clone();
        chunk.set_content("after");
        assert!(!chunk.is_synced());
        assert_ne!(chunk.chunk_hash, old_hash);
        assert!(chunk.hash_matches());
    }

    #[test]
    fn test_set_same_content_keeps_sync() {
        let mut chunk = Chunk::new("d1", 0, "same");
        chunk.mark_synced(chunk.expected_vector_id());
        chunk.set_content("same");
        assert!(chunk.is_synced());
    }

    #[test]
    fn test_vector_id_tracks_hash() {
        let mut chunk = Chunk::new("d1", 0, "one");
        let first = chunk.expected_vector_id();
        assert_eq!(first, format!("chunk_{}_{}", chunk.id, chunk.chunk_hash));
        chunk.set_content("two");
        assert_ne!(chunk.expected_vector_id(), first);
    }

    #[test]
    fn test_document_lifecycle() {
        let mut doc = Document::new(
            "t",
            SourceKind::Text,
            "h".into(),
            3,
            "text/plain",
            Metadata::new(),
        );
        assert_eq!(doc.status, DocumentStatus::Pending);
        doc.transition(DocumentStatus::Processing).unwrap();
        assert!(doc.processing_started_at.is_some());
        doc.transition(DocumentStatus::Completed).unwrap();
        assert!(doc.processing_completed_at.is_some());

        let err = doc.transition(DocumentStatus::Processing).unwrap_err();
        assert!(matches!(err, RagError::InvalidTransition { .. }));

        doc.transition(DocumentStatus::Pending).unwrap();
        assert!(doc.processing_started_at.is_none());
        assert!(doc.processing_completed_at.is_none());
    }

    #[test]
    fn test_job_retry_cycle() {
        let mut j = job();
        j.mark_started().unwrap();
        j.mark_failed("boom").unwrap();
        assert!(j.can_retry());
        j.mark_retrying().unwrap();
        assert_eq!(j.retry_count, 1);
        assert_eq!(j.status, JobStatus::Retrying);
        j.mark_started().unwrap();
        j.mark_completed().unwrap();
        assert_eq!(j.progress, 100.0);
        assert!(j.is_terminal());
    }

    #[test]
    fn test_job_retry_ceiling() {
        let mut j = job();
        for _ in 0..3 {
            j.mark_started().unwrap();
            j.mark_failed("boom").unwrap();
            j.mark_retrying().unwrap();
        }
        j.mark_started().unwrap();
        j.mark_failed("boom").unwrap();
        assert_eq!(j.retry_count, 3);
        assert!(!j.can_retry());
        assert!(j.is_terminal());
        assert!(j.mark_retrying().is_err());
        assert_eq!(j.status, JobStatus::Failed);
    }

    #[test]
    fn test_job_completed_is_final() {
        let mut j = job();
        j.mark_started().unwrap();
        j.mark_completed().unwrap();
        assert!(j.mark_started().is_err());
        assert!(j.mark_failed("late").is_err());
    }

    #[test]
    fn test_progress_clamped_and_monotonic() {
        let mut j = job();
        j.update_progress(40.0);
        j.update_progress(20.0);
        assert_eq!(j.progress, 40.0);
        j.update_progress(250.0);
        assert_eq!(j.progress, 100.0);
        let mut k = job();
        k.update_progress(-5.0);
        k.update_progress(f64::NAN);
        assert_eq!(k.progress, 0.0);
    }

    #[test]
    fn test_snapshot_progress() {
        assert_eq!(StatusSnapshot::progress_for(DocumentStatus::Completed, 0, 0), 100.0);
        assert_eq!(StatusSnapshot::progress_for(DocumentStatus::Failed, 4, 4), 0.0);
        assert_eq!(StatusSnapshot::progress_for(DocumentStatus::Processing, 4, 1), 25.0);
        assert_eq!(StatusSnapshot::progress_for(DocumentStatus::Pending, 0, 0), 0.0);
    }

    #[test]
    fn test_enum_round_trip_names() {
        assert_eq!(JobKind::parse("vector_sync"), Some(JobKind::VectorSync));
        assert_eq!(JobStatus::parse("retrying"), Some(JobStatus::Retrying));
        assert_eq!(DocumentStatus::parse("done"), None);
        assert_eq!(SearchMode::parse("semantic"), Some(SearchMode::Vector));
        assert_eq!(SourceKind::parse("upload"), Some(SourceKind::Upload));
    }
}
