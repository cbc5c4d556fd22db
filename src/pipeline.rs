//! Ingestion pipeline.
//!
//! Drives a document from raw input to chunked, embedded and vector-synced
//! state. Each step runs as an independent [`Task`] and coordinates with
//! the others only through persisted rows, so steps for different chunks
//! run in parallel and may finish in any order.
//!
//! # Steps
//!
//! ```text
//! ingest ─▶ process_document ─┬─▶ (local) complete_extraction
//!                             └─▶ (remote) poll_extraction ⟲ ─▶ complete_extraction
//!                                             ▲
//!                                   webhook ──┘
//! complete_extraction ─▶ generate_embedding × chunks ─▶ sync_vector
//! ```
//!
//! Failed steps are retried per [`RetryPolicy`](crate::jobs::RetryPolicy).
//! Exhausted extraction retries fail the document; exhausted embedding or
//! sync retries only fail their own job and leave the chunk unsynced.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::config::Config;
use crate::embedding::embedding_cost;
use crate::extract::{detect_format, DocumentFormat};
use crate::extractor::{
    ChunkExtractor, ExtractionInput, ExtractionOptions, RemoteState, RemoteStatus, Submission,
};
use crate::jobs::{JobTracker, RetryPolicies};
use crate::vector_index::{VectorIndex, VectorMetadata};
use ragline_core::chunk::sha256_hex;
use ragline_core::embedding::{estimate_tokens, EmbeddingProvider};
use ragline_core::error::{RagError, Result};
use ragline_core::models::{
    ApiUsageRecord, Chunk, Document, DocumentStatus, ExtractedChunk, JobKind, JobStatus, Metadata,
    ProcessingJob, SourceKind, StatusSnapshot,
};
use ragline_core::queue::{Task, TaskPayload, TaskQueue};
use ragline_core::store::{PruneCounts, Store};

/// Metadata key carrying the last processing error of a document.
pub const PROCESSING_ERROR_KEY: &str = "processing_error";

const STATE_UPDATE_ATTEMPTS: u32 = 3;

/// The collaborators a pipeline works against.
#[derive(Clone)]
pub struct Components {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub extractor: Arc<dyn ChunkExtractor>,
    /// `None` when embeddings are disabled; chunks then stay unsynced.
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub index: Arc<dyn VectorIndex>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_file_bytes: u64,
    /// Lowercase file extensions accepted for uploads.
    pub allowed_types: Vec<String>,
    pub extraction: ExtractionOptions,
    pub poll_initial_delay: Duration,
    pub poll_interval: Duration,
    pub poll_error_delay: Duration,
    pub max_poll_errors: u32,
    pub poll_window: Duration,
    pub embedding_jitter_max_secs: u64,
    pub vector_sync_delay: Duration,
    pub track_usage: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let extraction = &config.extraction;
        Self {
            max_file_bytes: config.storage.max_file_size_kb * 1024,
            allowed_types: config
                .storage
                .allowed_types
                .iter()
                .map(|t| t.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            extraction: ExtractionOptions::from_config(&config.chunking, extraction),
            poll_initial_delay: Duration::seconds(extraction.poll_initial_delay_secs as i64),
            poll_interval: Duration::seconds(extraction.poll_interval_secs as i64),
            poll_error_delay: Duration::seconds(extraction.poll_error_delay_secs as i64),
            max_poll_errors: extraction.max_poll_errors,
            poll_window: Duration::hours(extraction.poll_window_hours as i64),
            embedding_jitter_max_secs: config.jobs.embedding_jitter_max_secs,
            vector_sync_delay: Duration::seconds(config.jobs.vector_sync_delay_secs as i64),
            track_usage: config.analytics.track_usage,
        }
    }
}

/// Raw content of an ingestion request.
#[derive(Debug, Clone)]
pub enum IngestSource {
    File { filename: String, bytes: Vec<u8> },
    Text(String),
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub title: String,
    pub source: IngestSource,
    /// Defaults to `upload` for files and `text` for raw text.
    pub source_kind: Option<SourceKind>,
    pub metadata: Metadata,
}

impl IngestRequest {
    pub fn text(title: &str, text: &str) -> Self {
        Self {
            title: title.to_string(),
            source: IngestSource::Text(text.to_string()),
            source_kind: None,
            metadata: Metadata::new(),
        }
    }

    pub fn file(title: &str, filename: &str, bytes: Vec<u8>) -> Self {
        Self {
            title: title.to_string(),
            source: IngestSource::File {
                filename: filename.to_string(),
                bytes,
            },
            source_kind: None,
            metadata: Metadata::new(),
        }
    }
}

/// A status report from the remote extractor, polled or pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUpdate {
    pub state: RemoteState,
    pub progress: Option<f64>,
    pub error: Option<String>,
    /// Chunks delivered inline with a completion.
    pub chunks: Option<Vec<ExtractedChunk>>,
}

impl From<RemoteStatus> for RemoteUpdate {
    fn from(status: RemoteStatus) -> Self {
        Self {
            state: status.state,
            progress: status.progress,
            error: status.error,
            chunks: None,
        }
    }
}

/// What a remote update did to the tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Still queued or running remotely.
    InFlight,
    /// The job reached completed or failed.
    Finished,
    /// Status not recognized; nothing changed.
    Unrecognized,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    blobs: Arc<dyn BlobStore>,
    extractor: Arc<dyn ChunkExtractor>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    index: Arc<dyn VectorIndex>,
    tracker: JobTracker,
    settings: PipelineSettings,
    /// Jobs whose remote status is being handled right now.
    polling: Mutex<HashSet<String>>,
}

/// Removes a job from the polling set when dropped.
struct PollClaim<'a> {
    set: &'a Mutex<HashSet<String>>,
    job_id: String,
}

impl Drop for PollClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.job_id);
        }
    }
}

impl Pipeline {
    pub fn new(
        components: Components,
        settings: PipelineSettings,
        policies: RetryPolicies,
    ) -> Self {
        Self {
            tracker: JobTracker::new(components.store.clone(), policies),
            store: components.store,
            queue: components.queue,
            blobs: components.blobs,
            extractor: components.extractor,
            embedder: components.embedder,
            index: components.index,
            settings,
            polling: Mutex::new(HashSet::new()),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    // ── Produced operations ─────────────────────────────────────────────

    /// Validate, deduplicate and store a document, then start extraction.
    ///
    /// Identical content returns the existing document untouched. With a
    /// synchronous extractor the returned document has already been
    /// extracted; otherwise it is returned while extraction is queued.
    pub async fn ingest(&self, request: IngestRequest) -> Result<Document> {
        let now = Utc::now();
        let title = request.title.trim();
        if title.is_empty() {
            return Err(RagError::InvalidInput("title must not be empty".to_string()));
        }

        let (bytes, filename, format, default_kind) = match request.source {
            IngestSource::Text(text) => {
                (text.into_bytes(), None, DocumentFormat::Text, SourceKind::Text)
            }
            IngestSource::File { filename, bytes } => {
                let format = self.allowed_format(&filename)?;
                (bytes, Some(filename), format, SourceKind::Upload)
            }
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(RagError::InvalidInput("content must not be empty".to_string()));
        }
        if bytes.len() as u64 > self.settings.max_file_bytes {
            return Err(RagError::InvalidInput(format!(
                "content exceeds maximum size of {} KB",
                self.settings.max_file_bytes / 1024
            )));
        }

        let content_hash = sha256_hex(&bytes);
        if let Some(existing) = self.store.find_document_by_hash(&content_hash).await? {
            info!(document_id = %existing.id, "identical content already ingested");
            return Ok(existing);
        }

        let mut doc = Document::new(
            title,
            request.source_kind.unwrap_or(default_kind),
            content_hash,
            bytes.len() as u64,
            format.media_type(),
            request.metadata,
        );
        doc.original_filename = filename;
        let path = format!("{}/source.{}", doc.id, format.extension());
        let handle = self.blobs.store(&bytes, &path).await?;
        doc.source_path = Some(handle.clone());

        let stored = self.store.insert_document(&doc).await?;
        if stored.id != doc.id {
            // Lost a race with a concurrent ingest of the same content.
            if let Err(e) = self.blobs.delete(&handle).await {
                warn!(error = %e, handle = %handle, "failed to remove duplicate blob");
            }
            return Ok(stored);
        }
        info!(document_id = %stored.id, title = %stored.title, bytes = stored.byte_size, "document ingested");

        self.dispatch_extraction(stored, now).await
    }

    /// Point-in-time status of a document. Fails only for unknown ids.
    pub async fn get_status(&self, document_id: &str) -> Result<StatusSnapshot> {
        let doc = self.load_document(document_id).await?;
        let counts = self.store.count_chunks(document_id).await?;
        let jobs = self.store.jobs_for_document(document_id).await?;
        Ok(StatusSnapshot {
            progress: StatusSnapshot::progress_for(doc.status, counts.total, counts.synced),
            document_id: doc.id,
            title: doc.title,
            status: doc.status,
            total_chunks: counts.total,
            synced_chunks: counts.synced,
            processing_started_at: doc.processing_started_at,
            processing_completed_at: doc.processing_completed_at,
            jobs,
        })
    }

    /// Delete a document with its chunks, jobs, vectors and blob.
    ///
    /// Returns `false` when the document does not exist. Vector and blob
    /// cleanup failures are logged; the relational delete still happens.
    pub async fn delete(&self, document_id: &str) -> Result<bool> {
        let Some(doc) = self.store.get_document(document_id).await? else {
            return Ok(false);
        };

        if let Some(job_id) = &doc.processing_job_id {
            if let Some(job) = self.store.get_job(job_id).await? {
                if let (Some(ext), false) = (&job.external_job_id, job.is_terminal()) {
                    if let Err(e) = self.extractor.cancel(ext).await {
                        debug!(document_id, error = %e, "could not cancel remote extraction");
                    }
                }
            }
        }

        let chunks = self.store.list_chunks(document_id).await?;
        self.delete_vectors(document_id, &chunks).await;

        if let Some(handle) = &doc.source_path {
            if let Err(e) = self.blobs.delete(handle).await {
                warn!(document_id, error = %e, "failed to delete stored file");
            }
        }

        let deleted = self.store.delete_document(document_id).await?;
        info!(document_id, chunks = chunks.len(), "document deleted");
        Ok(deleted)
    }

    /// Remove every document, chunk, job, vector, blob and pending task.
    ///
    /// Returns `false` when the vector index or blob store could not be
    /// cleared; the relational store is cleared regardless.
    pub async fn clear_all(&self) -> Result<bool> {
        let mut clean = true;
        match self.index.delete_all().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("vector index did not acknowledge delete_all");
                clean = false;
            }
            Err(e) => {
                warn!(error = %e, "failed to clear vector index");
                clean = false;
            }
        }
        if let Err(e) = self.blobs.delete_all().await {
            warn!(error = %e, "failed to clear blob storage");
            clean = false;
        }
        self.store.clear().await?;
        self.queue.clear().await?;
        if let Some(embedder) = &self.embedder {
            embedder.flush_cache().await;
        }
        info!(clean, "knowledge base cleared");
        Ok(clean)
    }

    /// Purge a finished document's chunks and run extraction again.
    pub async fn reprocess(&self, document_id: &str) -> Result<Document> {
        let now = Utc::now();
        let mut doc = self.load_document(document_id).await?;
        if !doc.status.is_terminal() {
            return Err(RagError::InvalidInput(format!(
                "document {} is {}; only completed or failed documents can be reprocessed",
                doc.id, doc.status
            )));
        }

        let chunks = self.store.list_chunks(document_id).await?;
        self.delete_vectors(document_id, &chunks).await;
        self.store.replace_chunks(document_id, &[]).await?;

        doc.transition(DocumentStatus::Pending)?;
        doc.metadata.remove(PROCESSING_ERROR_KEY);
        self.store.update_document(&doc).await?;
        info!(document_id, purged = chunks.len(), "reprocessing document");

        self.dispatch_extraction(doc, now).await
    }

    /// Operator retry of a failed document-processing job.
    pub async fn retry_job(&self, job_id: &str) -> Result<ProcessingJob> {
        let now = Utc::now();
        let mut job = self.tracker.load(job_id).await?;
        if job.kind != JobKind::DocumentProcessing {
            return Err(RagError::InvalidInput(format!(
                "only document processing jobs can be retried, {} is {}",
                job.id, job.kind
            )));
        }
        if !job.can_retry() {
            return Err(RagError::InvalidInput(format!(
                "job {} cannot be retried (status {}, {}/{} retries used)",
                job.id, job.status, job.retry_count, job.max_retries
            )));
        }
        let document_id = job
            .document_id
            .clone()
            .ok_or_else(|| RagError::InvalidInput(format!("job {} has no document", job.id)))?;
        let mut doc = self.load_document(&document_id).await?;

        let remote = job
            .external_job_id
            .clone()
            .filter(|_| !self.extractor.is_synchronous());
        if let Some(ext) = &remote {
            self.extractor.retry(ext).await?;
        }

        job.mark_retrying()?;
        self.tracker.save(&job).await?;
        if doc.status == DocumentStatus::Failed {
            doc.transition(DocumentStatus::Pending)?;
        }
        doc.metadata.remove(PROCESSING_ERROR_KEY);
        self.store.update_document(&doc).await?;
        info!(job_id, document_id = %doc.id, attempt = job.retry_count, "retrying job");

        match remote {
            Some(ext) => {
                self.tracker.start(&mut job).await?;
                if doc.status != DocumentStatus::Processing {
                    doc.transition(DocumentStatus::Processing)?;
                }
                doc.external_job_id = Some(ext);
                self.store.update_document(&doc).await?;
                self.enqueue_poll(&doc.id, &job.id, 0, now + self.settings.poll_initial_delay)
                    .await?;
            }
            None if self.extractor.is_synchronous() => {
                self.process_document(&doc.id, &job.id, now).await?;
            }
            None => {
                self.queue
                    .enqueue(
                        TaskPayload::ProcessDocument {
                            document_id: doc.id.clone(),
                            job_id: job.id.clone(),
                        },
                        now,
                    )
                    .await?;
            }
        }
        self.tracker.load(job_id).await
    }

    /// Cancel an in-flight extraction. The job and document end `failed`.
    pub async fn cancel(&self, document_id: &str) -> Result<Document> {
        let doc = self.load_document(document_id).await?;
        let job_id = doc.processing_job_id.clone().ok_or_else(|| {
            RagError::InvalidInput(format!("document {} has no processing job", document_id))
        })?;
        let mut job = self.tracker.load(&job_id).await?;
        if !matches!(
            job.status,
            JobStatus::Queued | JobStatus::Processing | JobStatus::Retrying
        ) {
            return Err(RagError::InvalidInput(format!(
                "job {} is {}; nothing to cancel",
                job.id, job.status
            )));
        }

        if let Some(ext) = &job.external_job_id {
            if let Err(e) = self.extractor.cancel(ext).await {
                warn!(document_id, job_id = %job.id, error = %e, "remote cancel failed");
            }
        }
        // No automatic retries after a cancel.
        job.max_retries = job.retry_count;
        self.tracker.fail_permanently(&mut job, "cancelled").await?;
        self.fail_document(doc, "cancelled").await?;
        info!(document_id, job_id = %job.id, "extraction cancelled");
        self.load_document(document_id).await
    }

    /// Apply a pushed status update (webhook) for a remote job.
    ///
    /// Returns `None` when no job carries `external_job_id`.
    pub async fn apply_external_update(
        &self,
        external_job_id: &str,
        update: RemoteUpdate,
    ) -> Result<Option<UpdateOutcome>> {
        let Some(job) = self.store.find_job_by_external_id(external_job_id).await? else {
            return Ok(None);
        };
        let Some(_claim) = self.claim_poll(&job.id) else {
            debug!(job_id = %job.id, "status update already being handled");
            return Ok(Some(UpdateOutcome::InFlight));
        };
        // Re-read under the claim.
        let mut job = self.tracker.load(&job.id).await?;
        if job.status != JobStatus::Processing {
            debug!(job_id = %job.id, status = %job.status, "ignoring update for settled job");
            return Ok(Some(UpdateOutcome::Finished));
        }
        let document_id = job
            .document_id
            .clone()
            .ok_or_else(|| RagError::InvalidInput(format!("job {} has no document", job.id)))?;
        let outcome = self
            .apply_update(&document_id, &mut job, update, Utc::now())
            .await?;
        Ok(Some(outcome))
    }

    // ── Task execution ──────────────────────────────────────────────────

    /// Run one queued task. `now` is the scheduling clock for follow-ups.
    pub async fn handle_task(&self, task: &Task, now: DateTime<Utc>) -> Result<()> {
        debug!(task_id = %task.id, kind = task.payload.kind(), attempts = task.attempts, "running task");
        if task.attempts > 1 {
            self.release_interrupted(task, now).await?;
        }
        match &task.payload {
            TaskPayload::ProcessDocument {
                document_id,
                job_id,
            } => self.process_document(document_id, job_id, now).await,
            TaskPayload::PollExtraction {
                document_id,
                job_id,
                errors,
            } => self.poll_extraction(document_id, job_id, *errors, now).await,
            TaskPayload::GenerateEmbedding { chunk_id, job_id } => {
                self.generate_embedding(chunk_id, job_id, now).await
            }
            TaskPayload::SyncVector {
                chunk_id,
                job_id,
                chunk_hash,
                embedding,
            } => {
                self.sync_vector(chunk_id, job_id, chunk_hash, embedding, now)
                    .await
            }
        }
    }

    /// Give up on a task that keeps failing: its job fails permanently and,
    /// for extraction, so does the document.
    pub async fn abandon_task(&self, task: &Task, message: &str) -> Result<()> {
        let Some(mut job) = self.store.get_job(task.payload.job_id()).await? else {
            return Ok(());
        };
        if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            return Ok(());
        }
        self.tracker.fail_permanently(&mut job, message).await?;
        if job.kind != JobKind::DocumentProcessing {
            return Ok(());
        }
        if let Some(doc) = self.store_document(job.document_id.as_deref()).await? {
            self.fail_document(doc, message).await?;
        }
        Ok(())
    }

    /// A redelivered task whose job is still `processing` died after the
    /// job started. Record that as a failure so the retry policy decides
    /// whether the handler may run it again.
    ///
    /// Extraction jobs that already reached the remote service are left to
    /// their status poll.
    async fn release_interrupted(&self, task: &Task, now: DateTime<Utc>) -> Result<()> {
        if matches!(task.payload, TaskPayload::PollExtraction { .. }) {
            return Ok(());
        }
        let Some(mut job) = self.store.get_job(task.payload.job_id()).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Processing || job.external_job_id.is_some() {
            return Ok(());
        }
        let err = RagError::storage(format!(
            "{} task interrupted after delivery {}",
            task.payload.kind(),
            task.attempts - 1
        ));
        if self.tracker.fail(&mut job, &err, now).await?.is_some() {
            warn!(job_id = %job.id, kind = task.payload.kind(), attempts = task.attempts, "resuming interrupted job");
            return Ok(());
        }
        error!(job_id = %job.id, kind = task.payload.kind(), "interrupted job has no retries left");
        if job.kind == JobKind::DocumentProcessing {
            if let Some(doc) = self.store_document(job.document_id.as_deref()).await? {
                self.fail_document(doc, &err.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn store_document(&self, id: Option<&str>) -> Result<Option<Document>> {
        match id {
            Some(id) => self.store.get_document(id).await,
            None => Ok(None),
        }
    }

    /// Submit a document to the extractor.
    pub async fn process_document(
        &self,
        document_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(doc) = self.store.get_document(document_id).await? else {
            warn!(document_id, job_id, "document deleted before processing");
            return Ok(());
        };
        let Some(mut job) = self.store.get_job(job_id).await? else {
            warn!(document_id, job_id, "processing job missing");
            return Ok(());
        };
        if !matches!(job.status, JobStatus::Queued | JobStatus::Retrying) {
            debug!(job_id, status = %job.status, "processing job not runnable");
            return Ok(());
        }

        self.tracker.start(&mut job).await?;
        if let Err(e) = self.run_extraction(doc, job, now).await {
            return self.recover_extraction(document_id, job_id, e, now).await;
        }
        Ok(())
    }

    async fn run_extraction(
        &self,
        mut doc: Document,
        mut job: ProcessingJob,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if doc.status == DocumentStatus::Pending {
            doc.transition(DocumentStatus::Processing)?;
            self.store.update_document(&doc).await?;
        }
        let document_id = doc.id.clone();
        let job_id = job.id.clone();
        info!(%document_id, %job_id, extractor = self.extractor.provider_name(), "extraction started");

        match self.submit_extraction(&doc).await? {
            Submission::Completed(chunks) => self.complete_extraction(doc, job, chunks, now).await,
            Submission::Accepted {
                job_id: external,
                external_document_id,
                cost,
            } => {
                job.external_job_id = Some(external.clone());
                self.tracker.save(&job).await?;
                doc.external_job_id = Some(external.clone());
                if let Some(ext_doc) = external_document_id {
                    doc.metadata.insert("external_document_id".to_string(), ext_doc);
                }
                doc.updated_at = Utc::now();
                self.store.update_document(&doc).await?;
                self.record_usage(
                    self.extractor.provider_name(),
                    "document_processing",
                    None,
                    cost,
                    Some(&document_id),
                )
                .await;
                self.enqueue_poll(&document_id, &job_id, 0, now + self.settings.poll_initial_delay)
                    .await?;
                info!(%document_id, %job_id, external_job_id = %external, "extraction submitted");
                Ok(())
            }
        }
    }

    /// Hand an error raised after the extraction job started to the retry
    /// policy. Rows are re-read since the failed step may have saved part
    /// of its work.
    async fn recover_extraction(
        &self,
        document_id: &str,
        job_id: &str,
        err: RagError,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = self.tracker.load(job_id).await?;
        if job.status != JobStatus::Processing {
            return Err(err);
        }
        let Some(doc) = self.store.get_document(document_id).await? else {
            return Err(err);
        };
        self.extraction_failed(doc, job, err, now).await
    }

    /// Check a remote extraction job and reschedule itself while it runs.
    pub async fn poll_extraction(
        &self,
        document_id: &str,
        job_id: &str,
        errors: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(_claim) = self.claim_poll(job_id) else {
            debug!(job_id, "poll already running");
            return Ok(());
        };
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Processing {
            debug!(job_id, status = %job.status, "job settled, polling stops");
            return Ok(());
        }
        let started = job.started_at.unwrap_or(job.created_at);
        if now - started > self.settings.poll_window {
            error!(document_id, job_id, "polling window exceeded; job left in its last known state");
            return Ok(());
        }
        let Some(external) = job.external_job_id.clone() else {
            error!(document_id, job_id, "processing job has no external reference");
            return Ok(());
        };

        let outcome = match self.extractor.poll(&external).await {
            Ok(status) => self.apply_update(document_id, &mut job, status.into(), now).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(UpdateOutcome::Finished) => Ok(()),
            Ok(_) => {
                self.enqueue_poll(document_id, job_id, 0, now + self.settings.poll_interval)
                    .await
            }
            Err(e) => {
                let errors = errors + 1;
                if errors >= self.settings.max_poll_errors {
                    error!(document_id, job_id, errors, error = %e, "too many poll errors; polling stops");
                    return Ok(());
                }
                warn!(document_id, job_id, errors, error = %e, "status poll failed");
                self.enqueue_poll(document_id, job_id, errors, now + self.settings.poll_error_delay)
                    .await
            }
        }
    }

    /// Enqueue embedding jobs for every unsynced chunk of a document.
    pub async fn dispatch_embeddings(
        &self,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let chunks = self.store.unsynced_chunks(document_id).await?;
        let count = self.queue_embeddings(document_id, &chunks, now).await?;
        if count > 0 {
            info!(document_id, count, "embedding jobs dispatched");
        }
        Ok(count)
    }

    /// Queue embeddings again for unsynced chunks of completed documents
    /// that no live embedding or sync job covers. Returns how many chunks
    /// were queued.
    pub async fn resync_unsynced(&self, now: DateTime<Utc>) -> Result<usize> {
        if self.embedder.is_none() {
            debug!("embeddings disabled; nothing to resync");
            return Ok(0);
        }
        let mut total = 0;
        for doc in self.store.list_documents().await? {
            if doc.status != DocumentStatus::Completed {
                continue;
            }
            let live: HashSet<String> = self
                .store
                .jobs_for_document(&doc.id)
                .await?
                .into_iter()
                .filter(|j| {
                    matches!(
                        j.status,
                        JobStatus::Queued | JobStatus::Processing | JobStatus::Retrying
                    )
                })
                .filter_map(|j| j.chunk_id)
                .collect();
            let stranded: Vec<Chunk> = self
                .store
                .unsynced_chunks(&doc.id)
                .await?
                .into_iter()
                .filter(|c| !live.contains(&c.id))
                .collect();
            total += self.queue_embeddings(&doc.id, &stranded, now).await?;
        }
        info!(chunks = total, "unsynced chunks queued for embedding");
        Ok(total)
    }

    /// Delete search and usage rows, and failed jobs, older than
    /// `older_than`.
    pub async fn prune(&self, older_than: Duration) -> Result<PruneCounts> {
        let cutoff = Utc::now() - older_than;
        let counts = self.store.prune(cutoff).await?;
        info!(
            %cutoff,
            search_queries = counts.search_queries,
            api_usage = counts.api_usage,
            failed_jobs = counts.failed_jobs,
            "old records pruned"
        );
        Ok(counts)
    }

    async fn queue_embeddings(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let Some(embedder) = &self.embedder else {
            debug!(document_id, "embeddings disabled; chunks stay keyword-only");
            return Ok(0);
        };
        for chunk in chunks {
            let job = self
                .tracker
                .create(
                    JobKind::EmbeddingGeneration,
                    Some(document_id),
                    Some(&chunk.id),
                    embedder.provider_name(),
                )
                .await?;
            self.queue
                .enqueue(
                    TaskPayload::GenerateEmbedding {
                        chunk_id: chunk.id.clone(),
                        job_id: job.id,
                    },
                    now + self.jitter(),
                )
                .await?;
        }
        Ok(chunks.len())
    }

    pub async fn generate_embedding(
        &self,
        chunk_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(embedder) = self.embedder.clone() else {
            warn!(chunk_id, "embedding task found but embeddings are disabled");
            return Ok(());
        };
        let Some(mut job) = self.runnable_job(job_id).await? else {
            return Ok(());
        };
        self.tracker.start(&mut job).await?;
        let Some(mut chunk) = self.store.get_chunk(chunk_id).await? else {
            self.tracker
                .fail_permanently(&mut job, "chunk no longer exists")
                .await?;
            return Ok(());
        };

        match self.embed_chunk(embedder.as_ref(), &mut chunk, now).await {
            Ok(()) => {
                self.tracker.complete(&mut job).await?;
                debug!(chunk_id, model = embedder.model_name(), "embedding generated");
                Ok(())
            }
            Err(e) => match self.tracker.fail(&mut job, &e, now).await? {
                Some(delay) => {
                    warn!(chunk_id, job_id, error = %e, retry_in_secs = delay.num_seconds(), "embedding failed, retrying");
                    self.queue
                        .enqueue(
                            TaskPayload::GenerateEmbedding {
                                chunk_id: chunk_id.to_string(),
                                job_id: job_id.to_string(),
                            },
                            now + delay,
                        )
                        .await?;
                    Ok(())
                }
                None => {
                    error!(chunk_id, job_id, error = %e, "embedding failed permanently");
                    Ok(())
                }
            },
        }
    }

    /// Embed one chunk, store the model on it and queue its vector sync.
    async fn embed_chunk(
        &self,
        embedder: &dyn EmbeddingProvider,
        chunk: &mut Chunk,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let embedding = embedder.generate(&chunk.content).await?;
        chunk.record_embedding(embedder.model_name(), embedding.len());
        self.store.update_chunk(chunk).await?;
        let tokens = estimate_tokens(&chunk.content);
        self.record_usage(
            embedder.provider_name(),
            "embedding",
            Some(tokens as u64),
            embedding_cost(embedder.provider_name(), tokens),
            Some(&chunk.document_id),
        )
        .await;

        let sync_job = self
            .tracker
            .create(
                JobKind::VectorSync,
                Some(&chunk.document_id),
                Some(&chunk.id),
                self.index.provider_name(),
            )
            .await?;
        self.queue
            .enqueue(
                TaskPayload::SyncVector {
                    chunk_id: chunk.id.clone(),
                    job_id: sync_job.id,
                    chunk_hash: chunk.chunk_hash.clone(),
                    embedding,
                },
                now + self.settings.vector_sync_delay,
            )
            .await?;
        Ok(())
    }

    /// Upsert a chunk's embedding and record the sync on the chunk.
    ///
    /// The vector id is derived from the chunk hash, so an unchanged chunk
    /// overwrites its own vector. When the hash changed, the previous
    /// vector is deleted first so no orphan is left behind.
    pub async fn sync_vector(
        &self,
        chunk_id: &str,
        job_id: &str,
        chunk_hash: &str,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(mut job) = self.runnable_job(job_id).await? else {
            return Ok(());
        };
        self.tracker.start(&mut job).await?;
        let Some(mut chunk) = self.store.get_chunk(chunk_id).await? else {
            self.tracker
                .fail_permanently(&mut job, "chunk no longer exists")
                .await?;
            return Ok(());
        };
        if chunk.chunk_hash != chunk_hash {
            debug!(chunk_id, "chunk changed since embedding; sync superseded");
            self.tracker
                .fail_permanently(&mut job, "chunk content changed before sync")
                .await?;
            return Ok(());
        }

        match self.upsert_chunk(&mut chunk, embedding).await {
            Ok(()) => {
                self.tracker.complete(&mut job).await?;
                let counts = self.store.count_chunks(&chunk.document_id).await?;
                if counts.total > 0 && counts.synced == counts.total {
                    info!(document_id = %chunk.document_id, chunks = counts.total, "all chunks vector-synced");
                }
                Ok(())
            }
            Err(e) => match self.tracker.fail(&mut job, &e, now).await? {
                Some(delay) => {
                    warn!(chunk_id, job_id, error = %e, retry_in_secs = delay.num_seconds(), "vector sync failed, retrying");
                    self.queue
                        .enqueue(
                            TaskPayload::SyncVector {
                                chunk_id: chunk_id.to_string(),
                                job_id: job_id.to_string(),
                                chunk_hash: chunk_hash.to_string(),
                                embedding: embedding.to_vec(),
                            },
                            now + delay,
                        )
                        .await?;
                    Ok(())
                }
                None => {
                    error!(chunk_id, job_id, error = %e, "vector sync failed permanently");
                    Ok(())
                }
            },
        }
    }

    async fn upsert_chunk(&self, chunk: &mut Chunk, embedding: &[f32]) -> Result<()> {
        let title = self
            .store
            .get_document(&chunk.document_id)
            .await?
            .map(|d| d.title)
            .unwrap_or_default();
        let vector_id = chunk.expected_vector_id();
        if let Some(stale) = chunk.vector_id.clone().filter(|old| *old != vector_id) {
            if let Err(e) = self.index.delete(&[stale.clone()]).await {
                warn!(chunk_id = %chunk.id, vector_id = %stale, error = %e, "failed to delete stale vector");
            }
        }

        let metadata = VectorMetadata::for_chunk(chunk, &title);
        if !self.index.upsert(&vector_id, embedding, &metadata).await? {
            return Err(RagError::VectorDatabaseError(
                "upsert was not acknowledged".to_string(),
            ));
        }
        chunk.mark_synced(vector_id);
        self.persist_chunk(chunk).await
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn allowed_format(&self, filename: &str) -> Result<DocumentFormat> {
        let ext = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let format = detect_format(filename)
            .ok_or_else(|| RagError::InvalidInput(format!("unsupported file type: {}", filename)))?;
        let allowed = self
            .settings
            .allowed_types
            .iter()
            .any(|t| *t == ext || t == format.extension());
        if !allowed {
            return Err(RagError::InvalidInput(format!(
                "file type .{} is not allowed (allowed: {})",
                ext,
                self.settings.allowed_types.join(", ")
            )));
        }
        Ok(format)
    }

    async fn load_document(&self, id: &str) -> Result<Document> {
        self.store
            .get_document(id)
            .await?
            .ok_or_else(|| RagError::not_found("document", id))
    }

    /// A job that may start now: exists and is queued or retrying.
    async fn runnable_job(&self, job_id: &str) -> Result<Option<ProcessingJob>> {
        match self.store.get_job(job_id).await? {
            Some(job) if matches!(job.status, JobStatus::Queued | JobStatus::Retrying) => {
                Ok(Some(job))
            }
            Some(job) => {
                debug!(job_id, status = %job.status, "job not runnable");
                Ok(None)
            }
            None => {
                debug!(job_id, "job missing");
                Ok(None)
            }
        }
    }

    async fn dispatch_extraction(&self, mut doc: Document, now: DateTime<Utc>) -> Result<Document> {
        let job = self
            .tracker
            .create(
                JobKind::DocumentProcessing,
                Some(&doc.id),
                None,
                self.extractor.provider_name(),
            )
            .await?;
        doc.processing_job_id = Some(job.id.clone());
        doc.updated_at = Utc::now();
        self.store.update_document(&doc).await?;

        if self.extractor.is_synchronous() {
            self.process_document(&doc.id, &job.id, now).await?;
            return self.load_document(&doc.id).await;
        }
        self.queue
            .enqueue(
                TaskPayload::ProcessDocument {
                    document_id: doc.id.clone(),
                    job_id: job.id.clone(),
                },
                now,
            )
            .await?;
        debug!(document_id = %doc.id, job_id = %job.id, "extraction queued");
        Ok(doc)
    }

    async fn submit_extraction(&self, doc: &Document) -> Result<Submission> {
        let handle = doc.source_path.as_deref().ok_or_else(|| {
            RagError::DocumentProcessingFailed("document has no stored content".to_string())
        })?;
        let bytes = self.blobs.read(handle).await?;
        let extension = DocumentFormat::from_media_type(&doc.media_type)
            .map(|f| f.extension())
            .unwrap_or("txt");
        let input = ExtractionInput {
            bytes,
            filename: doc
                .original_filename
                .clone()
                .unwrap_or_else(|| format!("{}.{}", doc.id, extension)),
            media_type: doc.media_type.clone(),
        };
        self.extractor.submit(&input, &self.settings.extraction).await
    }

    async fn complete_extraction(
        &self,
        mut doc: Document,
        mut job: ProcessingJob,
        extracted: Vec<ExtractedChunk>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let chunks: Vec<Chunk> = extracted
            .into_iter()
            .filter(|c| !c.content.trim().is_empty())
            .enumerate()
            .map(|(i, c)| {
                let mut chunk = Chunk::new(&doc.id, i as i64, c.content.trim());
                chunk.metadata = c.metadata;
                chunk.keywords = c.keywords;
                chunk
            })
            .collect();

        if chunks.is_empty() {
            let message = "extraction produced no chunks";
            error!(document_id = %doc.id, job_id = %job.id, message);
            self.tracker.fail_permanently(&mut job, message).await?;
            return self.fail_document(doc, message).await;
        }

        self.store.replace_chunks(&doc.id, &chunks).await?;
        self.tracker.complete(&mut job).await?;
        doc.transition(DocumentStatus::Completed)?;
        doc.metadata.remove(PROCESSING_ERROR_KEY);
        self.store.update_document(&doc).await?;
        info!(document_id = %doc.id, chunks = chunks.len(), "extraction completed");

        self.dispatch_embeddings(&doc.id, now).await?;
        Ok(())
    }

    async fn extraction_failed(
        &self,
        doc: Document,
        mut job: ProcessingJob,
        err: RagError,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self.tracker.fail(&mut job, &err, now).await? {
            Some(delay) => {
                warn!(document_id = %doc.id, job_id = %job.id, error = %err, retry_in_secs = delay.num_seconds(), "extraction failed, retrying");
                self.queue
                    .enqueue(
                        TaskPayload::ProcessDocument {
                            document_id: doc.id.clone(),
                            job_id: job.id.clone(),
                        },
                        now + delay,
                    )
                    .await?;
                Ok(())
            }
            None => {
                error!(document_id = %doc.id, job_id = %job.id, error = %err, "extraction failed permanently");
                self.fail_document(doc, &err.to_string()).await
            }
        }
    }

    async fn fail_document(&self, mut doc: Document, message: &str) -> Result<()> {
        if !doc.status.is_terminal() {
            doc.transition(DocumentStatus::Failed)?;
        }
        doc.metadata
            .insert(PROCESSING_ERROR_KEY.to_string(), message.to_string());
        doc.updated_at = Utc::now();
        self.store.update_document(&doc).await
    }

    async fn apply_update(
        &self,
        document_id: &str,
        job: &mut ProcessingJob,
        update: RemoteUpdate,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        match update.state {
            RemoteState::Queued | RemoteState::Pending => Ok(UpdateOutcome::InFlight),
            RemoteState::Processing | RemoteState::InProgress => {
                if let Some(progress) = update.progress {
                    self.tracker.progress(job, progress).await?;
                }
                Ok(UpdateOutcome::InFlight)
            }
            RemoteState::Completed => {
                let chunks = match update.chunks {
                    Some(chunks) if !chunks.is_empty() => chunks,
                    _ => {
                        let external = job.external_job_id.clone().ok_or_else(|| {
                            RagError::InvalidInput(format!("job {} has no external reference", job.id))
                        })?;
                        self.extractor.fetch_result(&external).await?
                    }
                };
                let doc = self.load_document(document_id).await?;
                self.complete_extraction(doc, job.clone(), chunks, now).await?;
                Ok(UpdateOutcome::Finished)
            }
            RemoteState::Failed => {
                let message = update
                    .error
                    .unwrap_or_else(|| "remote processing failed".to_string());
                error!(document_id, job_id = %job.id, error = %message, "remote extraction failed");
                self.tracker.fail_permanently(job, &message).await?;
                let doc = self.load_document(document_id).await?;
                self.fail_document(doc, &message).await?;
                Ok(UpdateOutcome::Finished)
            }
            RemoteState::Unknown(status) => {
                warn!(document_id, job_id = %job.id, status = %status, "unrecognized remote status");
                Ok(UpdateOutcome::Unrecognized)
            }
        }
    }

    async fn enqueue_poll(
        &self,
        document_id: &str,
        job_id: &str,
        errors: u32,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        self.queue
            .enqueue(
                TaskPayload::PollExtraction {
                    document_id: document_id.to_string(),
                    job_id: job_id.to_string(),
                    errors,
                },
                run_at,
            )
            .await?;
        Ok(())
    }

    fn claim_poll(&self, job_id: &str) -> Option<PollClaim<'_>> {
        let mut set = self.polling.lock().ok()?;
        if !set.insert(job_id.to_string()) {
            return None;
        }
        Some(PollClaim {
            set: &self.polling,
            job_id: job_id.to_string(),
        })
    }

    async fn delete_vectors(&self, document_id: &str, chunks: &[Chunk]) {
        let ids: Vec<String> = chunks.iter().filter_map(|c| c.vector_id.clone()).collect();
        if ids.is_empty() {
            return;
        }
        match self.index.delete(&ids).await {
            Ok(true) => debug!(document_id, count = ids.len(), "vectors deleted"),
            Ok(false) => warn!(document_id, count = ids.len(), "vector index reported partial delete"),
            Err(e) => warn!(document_id, error = %e, "failed to delete vectors"),
        }
    }

    /// Persist sync state after a successful upsert, retrying the write so a
    /// transient store error does not strand an indexed vector.
    async fn persist_chunk(&self, chunk: &Chunk) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.update_chunk(chunk).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < STATE_UPDATE_ATTEMPTS => {
                    warn!(chunk_id = %chunk.id, attempt, error = %e, "chunk update failed, retrying");
                    let pause = std::time::Duration::from_millis(100 * attempt as u64);
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_usage(
        &self,
        provider: &str,
        operation: &str,
        tokens: Option<u64>,
        cost: Option<f64>,
        document_id: Option<&str>,
    ) {
        if !self.settings.track_usage {
            return;
        }
        let mut record = ApiUsageRecord::new(provider, operation);
        record.tokens_used = tokens;
        record.cost_usd = cost;
        record.document_id = document_id.map(str::to_string);
        if let Err(e) = self.store.record_usage(&record).await {
            warn!(provider, operation, error = %e, "failed to record API usage");
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.settings.embedding_jitter_max_secs;
        if max == 0 {
            return Duration::zero();
        }
        Duration::seconds(rand::thread_rng().gen_range(1..=max) as i64)
    }
}
