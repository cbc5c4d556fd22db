#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use ragline::answer::{AiAnswerer, Completion, StreamEvent, Usage};
use ragline::blob::MemoryBlobStore;
use ragline::config::{parse_config, Config};
use ragline::extractor::{
    ChunkExtractor, ExtractionInput, ExtractionOptions, LocalExtractor, RemoteState, RemoteStatus,
    Submission,
};
use ragline::pipeline::{Components, IngestRequest};
use ragline::service::KnowledgeBase;
use ragline::vector_index::{IndexStats, MemoryIndex, VectorIndex, VectorMatch, VectorMetadata};
use ragline_core::embedding::EmbeddingProvider;
use ragline_core::error::{RagError, Result};
use ragline_core::models::{
    ApiUsageRecord, Chunk, Document, ExtractedChunk, ProcessingJob, SearchQueryRecord,
};
use ragline_core::queue::MemoryQueue;
use ragline_core::scoring::Candidate;
use ragline_core::store::memory::InMemoryStore;
use ragline_core::store::{ChunkCounts, PruneCounts, Store, StoreStats};

/// Words that each own one embedding dimension.
pub const TOPICS: [&str; 4] = ["rust", "python", "kubernetes", "bread"];

/// Embeds text as occurrence counts of [`TOPICS`], so similarities are
/// exact: same topic 1.0, disjoint topics 0.0.
#[derive(Default)]
pub struct TopicEmbedder {
    failures: Mutex<VecDeque<RagError>>,
    pub calls: AtomicUsize,
}

impl TopicEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next calls with these errors, in order.
    pub fn fail_next(&self, errors: Vec<RagError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn embed(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        TOPICS
            .iter()
            .map(|topic| lower.matches(topic).count() as f32)
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for TopicEmbedder {
    fn provider_name(&self) -> &str {
        "topic"
    }

    fn model_name(&self) -> &str {
        "topic-v1"
    }

    fn dimensions(&self) -> usize {
        TOPICS.len()
    }

    fn max_input_tokens(&self) -> usize {
        8191
    }

    async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(texts.iter().map(|t| Self::embed(t)).collect())
    }
}

/// [`MemoryIndex`] with injectable failures.
#[derive(Default)]
pub struct FlakyIndex {
    pub inner: MemoryIndex,
    upsert_failures: AtomicUsize,
    query_failures: AtomicUsize,
    pub upserts: AtomicUsize,
}

impl FlakyIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_upserts(&self, n: usize) {
        self.upsert_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, n: usize) {
        self.query_failures.store(n, Ordering::SeqCst);
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.ids().unwrap()
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    fn provider_name(&self) -> &str {
        "flaky"
    }

    async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<bool> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.upsert_failures) {
            return Err(RagError::VectorDatabaseError("HTTP 503".to_string()));
        }
        self.inner.upsert(id, vector, metadata).await
    }

    async fn delete(&self, ids: &[String]) -> Result<bool> {
        self.inner.delete(ids).await
    }

    async fn delete_all(&self) -> Result<bool> {
        self.inner.delete_all().await
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<VectorMatch>> {
        if Self::take(&self.query_failures) {
            return Err(RagError::VectorDatabaseError("connection refused".to_string()));
        }
        self.inner.query(vector, limit, threshold).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        self.inner.stats().await
    }
}

/// [`InMemoryStore`] whose writes can be made to fail.
pub struct FlakyStore {
    pub inner: Arc<InMemoryStore>,
    chunk_update_failures: AtomicUsize,
    job_update_failures: AtomicUsize,
    search_record_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            chunk_update_failures: AtomicUsize::new(0),
            job_update_failures: AtomicUsize::new(0),
            search_record_failures: AtomicUsize::new(0),
        })
    }

    pub fn fail_chunk_updates(&self, n: usize) {
        self.chunk_update_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_job_updates(&self, n: usize) {
        self.job_update_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_search_records(&self, n: usize) {
        self.search_record_failures.store(n, Ordering::SeqCst);
    }

    fn locked() -> RagError {
        RagError::Storage("database is locked".to_string())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_document(&self, doc: &Document) -> Result<Document> {
        self.inner.insert_document(doc).await
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        self.inner.update_document(doc).await
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.inner.get_document(id).await
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        self.inner.find_document_by_hash(content_hash).await
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        self.inner.list_documents().await
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        self.inner.delete_document(id).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.inner.replace_chunks(document_id, chunks).await
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        self.inner.get_chunk(id).await
    }

    async fn update_chunk(&self, chunk: &Chunk) -> Result<()> {
        if FlakyIndex::take(&self.chunk_update_failures) {
            return Err(Self::locked());
        }
        self.inner.update_chunk(chunk).await
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        self.inner.list_chunks(document_id).await
    }

    async fn unsynced_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        self.inner.unsynced_chunks(document_id).await
    }

    async fn count_chunks(&self, document_id: &str) -> Result<ChunkCounts> {
        self.inner.count_chunks(document_id).await
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        self.inner.keyword_search(query, limit).await
    }

    async fn insert_job(&self, job: &ProcessingJob) -> Result<()> {
        self.inner.insert_job(job).await
    }

    async fn update_job(&self, job: &ProcessingJob) -> Result<()> {
        if FlakyIndex::take(&self.job_update_failures) {
            return Err(Self::locked());
        }
        self.inner.update_job(job).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<ProcessingJob>> {
        self.inner.get_job(id).await
    }

    async fn find_job_by_external_id(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ProcessingJob>> {
        self.inner.find_job_by_external_id(external_job_id).await
    }

    async fn jobs_for_document(&self, document_id: &str) -> Result<Vec<ProcessingJob>> {
        self.inner.jobs_for_document(document_id).await
    }

    async fn record_search(&self, record: &SearchQueryRecord) -> Result<()> {
        if FlakyIndex::take(&self.search_record_failures) {
            return Err(Self::locked());
        }
        self.inner.record_search(record).await
    }

    async fn record_usage(&self, record: &ApiUsageRecord) -> Result<()> {
        self.inner.record_usage(record).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inner.stats().await
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneCounts> {
        self.inner.prune(cutoff).await
    }
}

/// A remote extractor whose job statuses are scripted by the test.
///
/// `poll` pops the next scripted status and reports `processing` once the
/// script is exhausted.
#[derive(Default)]
pub struct ScriptedExtractor {
    submit_failures: Mutex<VecDeque<RagError>>,
    statuses: Mutex<VecDeque<RemoteStatus>>,
    poll_failures: AtomicUsize,
    result: Mutex<Vec<ExtractedChunk>>,
    pub submits: AtomicUsize,
    pub polls: AtomicUsize,
    pub retried: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl ScriptedExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_submits(&self, errors: Vec<RagError>) {
        self.submit_failures.lock().unwrap().extend(errors);
    }

    pub fn fail_polls(&self, n: usize) {
        self.poll_failures.store(n, Ordering::SeqCst);
    }

    pub fn push_status(&self, state: RemoteState, progress: Option<f64>, error: Option<&str>) {
        self.statuses.lock().unwrap().push_back(RemoteStatus {
            state,
            progress,
            error: error.map(str::to_string),
        });
    }

    pub fn set_result(&self, chunks: &[&str]) {
        *self.result.lock().unwrap() = chunks
            .iter()
            .map(|c| ExtractedChunk {
                content: c.to_string(),
                ..Default::default()
            })
            .collect();
    }
}

#[async_trait]
impl ChunkExtractor for ScriptedExtractor {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn submit(
        &self,
        _input: &ExtractionInput,
        _options: &ExtractionOptions,
    ) -> Result<Submission> {
        if let Some(err) = self.submit_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Submission::Accepted {
            job_id: format!("ext-{}", n),
            external_document_id: Some(format!("remote-doc-{}", n)),
            cost: Some(0.01),
        })
    }

    async fn poll(&self, _job_id: &str) -> Result<RemoteStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if FlakyIndex::take(&self.poll_failures) {
            return Err(RagError::request_failed("scripted", "HTTP 502"));
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RemoteStatus {
                state: RemoteState::Processing,
                progress: None,
                error: None,
            }))
    }

    async fn fetch_result(&self, _job_id: &str) -> Result<Vec<ExtractedChunk>> {
        Ok(self.result.lock().unwrap().clone())
    }

    async fn retry(&self, job_id: &str) -> Result<()> {
        self.retried.lock().unwrap().push(job_id.to_string());
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

/// Answers with a fixed text and records every prompt it sees.
#[derive(Default)]
pub struct ScriptedAnswerer {
    pub prompts: Mutex<Vec<String>>,
    /// Fail streams after this many deltas.
    pub fail_stream_after: Option<usize>,
}

pub const SCRIPTED_ANSWER: &str = "Rust manages memory through ownership.";

impl ScriptedAnswerer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_after(deltas: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_stream_after: Some(deltas),
            ..Default::default()
        })
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl AiAnswerer for ScriptedAnswerer {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-llm"
    }

    async fn generate(&self, prompt: &str) -> Result<Completion> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(Completion {
            content: SCRIPTED_ANSWER.to_string(),
            model: "scripted-llm".to_string(),
            usage: Usage::new("scripted-llm", 120, 8),
        })
    }

    async fn stream(&self, prompt: &str, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        for (i, word) in SCRIPTED_ANSWER.split_inclusive(' ').enumerate() {
            if self.fail_stream_after == Some(i) {
                return Err(RagError::request_failed("scripted", "stream interrupted"));
            }
            let delta = StreamEvent::Delta {
                content: word.to_string(),
            };
            if tx.send(delta).await.is_err() {
                return Ok(());
            }
        }
        let _ = tx
            .send(StreamEvent::Complete {
                usage: Usage::new("scripted-llm", 120, 8),
            })
            .await;
        Ok(())
    }
}

/// Parse a config with the given extra TOML after a `[db]` section.
pub fn test_config(extra: &str) -> Config {
    parse_config(&format!("[db]\npath = \"./unused.sqlite\"\n\n{}", extra)).unwrap()
}

/// A knowledge base over in-memory backends, with handles to each.
pub struct Harness {
    pub kb: KnowledgeBase,
    pub store: Arc<InMemoryStore>,
    /// The store the knowledge base writes through.
    pub faults: Arc<FlakyStore>,
    pub queue: Arc<MemoryQueue>,
    pub blobs: Arc<MemoryBlobStore>,
    pub index: Arc<FlakyIndex>,
    pub answerer: Arc<ScriptedAnswerer>,
}

pub struct HarnessBuilder {
    config: Config,
    extractor: Arc<dyn ChunkExtractor>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    answerer: Arc<ScriptedAnswerer>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(""),
            extractor: Arc::new(LocalExtractor::new()),
            embedder: Some(TopicEmbedder::new()),
            answerer: ScriptedAnswerer::new(),
        }
    }

    pub fn config(mut self, extra: &str) -> Self {
        self.config = test_config(extra);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn ChunkExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn without_embeddings(mut self) -> Self {
        self.embedder = None;
        self
    }

    pub fn answerer(mut self, answerer: Arc<ScriptedAnswerer>) -> Self {
        self.answerer = answerer;
        self
    }

    pub fn build(self) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let faults = FlakyStore::new(store.clone());
        let queue = Arc::new(MemoryQueue::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let index = FlakyIndex::new();
        let components = Components {
            store: faults.clone(),
            queue: queue.clone(),
            blobs: blobs.clone(),
            extractor: self.extractor,
            embedder: self.embedder,
            index: index.clone(),
        };
        let kb = KnowledgeBase::new(self.config, components).with_answerer(self.answerer.clone());
        Harness {
            kb,
            store,
            faults,
            queue,
            blobs,
            index,
            answerer: self.answerer,
        }
    }
}

impl Harness {
    /// Run queued tasks on a virtual clock until nothing is left.
    pub async fn settle(&self) -> usize {
        self.kb
            .worker()
            .run_until_idle(Utc::now(), 1_000)
            .await
            .unwrap()
    }

    pub async fn ingest_text(&self, title: &str, text: &str) -> Document {
        self.kb.ingest(IngestRequest::text(title, text)).await.unwrap()
    }
}

pub const RUST_TEXT: &str = "Rust ownership keeps memory safe. Cargo builds every rust crate.";
pub const PYTHON_TEXT: &str = "Python is popular for data science. Notebooks run python code.";
pub const BREAD_TEXT: &str = "Sourdough bread needs a starter. Bake the bread hot.";
