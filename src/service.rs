//! The assembled knowledge base.
//!
//! [`KnowledgeBase`] wires the configured backends into a [`Pipeline`], a
//! [`RetrievalEngine`] and a lazily created [`QuestionAnswerer`], and is
//! the single entry point used by the CLI.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::answer::{create_answerer, AiAnswerer};
use crate::blob::FsBlobStore;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::extractor::{create_extractor, ChunkExtractor};
use crate::jobs::RetryPolicies;
use crate::migrate;
use crate::pipeline::{Components, IngestRequest, Pipeline, PipelineSettings};
use crate::qa::{AnswerResult, AnswerStream, QuestionAnswerer};
use crate::search::{RetrievalEngine, SearchOptions};
use crate::sqlite_store::SqliteStore;
use crate::vector_index::{create_vector_index, IndexStats, VectorIndex};
use crate::webhook;
use crate::worker::{Worker, WorkerSettings};
use ragline_core::embedding::EmbeddingProvider;
use ragline_core::error::Result;
use ragline_core::models::{Document, DocumentStatus, ProcessingJob, ScoredChunk, StatusSnapshot};
use ragline_core::queue::TaskQueue;
use ragline_core::store::{PruneCounts, Store, StoreStats};

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBaseStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub queued_tasks: usize,
    pub vector_index: Option<IndexStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_index_error: Option<String>,
}

/// What [`KnowledgeBase::optimize`] did.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizeReport {
    pub requeued_chunks: usize,
    /// `None` when pruning was not requested.
    pub pruned: Option<PruneCounts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: &'static str,
    pub provider: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn check(component: &'static str, provider: &str, result: Result<()>) -> Self {
        Self {
            component,
            provider: provider.to_string(),
            healthy: result.is_ok(),
            detail: result.err().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: Vec<ComponentHealth>,
}

pub struct KnowledgeBase {
    config: Config,
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    extractor: Arc<dyn ChunkExtractor>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    index: Arc<dyn VectorIndex>,
    pipeline: Arc<Pipeline>,
    engine: Arc<RetrievalEngine>,
    answerer: OnceCell<Arc<dyn AiAnswerer>>,
}

impl KnowledgeBase {
    /// Open the SQLite database (running migrations) and build every
    /// configured backend.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let sqlite = Arc::new(SqliteStore::new(pool));

        let embedder = if config.embedding.is_enabled() {
            Some(create_embedder(&config.embedding)?)
        } else {
            None
        };
        let components = Components {
            store: sqlite.clone(),
            queue: sqlite,
            blobs: Arc::new(FsBlobStore::new(config.storage.path.clone())),
            extractor: create_extractor(&config.extraction)?,
            embedder,
            index: create_vector_index(&config.vector)?,
        };
        debug!(
            extraction = %config.extraction.mode,
            embedding = %config.embedding.provider,
            vector = %config.vector.provider,
            "knowledge base opened"
        );
        Ok(Self::new(config, components))
    }

    pub fn new(config: Config, components: Components) -> Self {
        let pipeline = Pipeline::new(
            components.clone(),
            PipelineSettings::from_config(&config),
            RetryPolicies::from_config(&config.jobs),
        );
        let engine = RetrievalEngine::new(
            components.store.clone(),
            components.index.clone(),
            components.embedder.clone(),
            config.search.clone(),
            config.analytics.track_searches,
        );
        Self {
            store: components.store,
            queue: components.queue,
            extractor: components.extractor,
            embedder: components.embedder,
            index: components.index,
            pipeline: Arc::new(pipeline),
            engine: Arc::new(engine),
            answerer: OnceCell::new(),
            config,
        }
    }

    /// Use `answerer` instead of building one from `[answer]`.
    pub fn with_answerer(mut self, answerer: Arc<dyn AiAnswerer>) -> Self {
        self.answerer = OnceCell::new_with(Some(answerer));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            self.pipeline.clone(),
            self.queue.clone(),
            WorkerSettings::from_config(&self.config.jobs),
        )
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<Document> {
        self.pipeline.ingest(request).await
    }

    pub async fn get_status(&self, document_id: &str) -> Result<StatusSnapshot> {
        self.pipeline.get_status(document_id).await
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<ScoredChunk>> {
        self.engine.search(query, options).await
    }

    pub async fn ask(&self, question: &str, options: &SearchOptions) -> Result<AnswerResult> {
        self.qa().await?.ask(question, options).await
    }

    pub async fn ask_stream(
        &self,
        question: &str,
        options: &SearchOptions,
    ) -> Result<AnswerStream> {
        self.qa().await?.ask_stream(question, options).await
    }

    pub async fn delete(&self, document_id: &str) -> Result<bool> {
        self.pipeline.delete(document_id).await
    }

    pub async fn clear_all(&self) -> Result<bool> {
        self.pipeline.clear_all().await
    }

    pub async fn reprocess(&self, document_id: &str) -> Result<Document> {
        self.pipeline.reprocess(document_id).await
    }

    pub async fn retry_job(&self, job_id: &str) -> Result<ProcessingJob> {
        self.pipeline.retry_job(job_id).await
    }

    pub async fn cancel(&self, document_id: &str) -> Result<Document> {
        self.pipeline.cancel(document_id).await
    }

    /// Documents newest first, optionally only those in `status`.
    pub async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
        let mut docs = self.store.list_documents().await?;
        if let Some(status) = status {
            docs.retain(|d| d.status == status);
        }
        Ok(docs)
    }

    /// Queue embeddings for stranded unsynced chunks and compact the keyword
    /// index. With `prune_older_than`, also drop analytics rows and failed
    /// jobs older than that.
    pub async fn optimize(&self, prune_older_than: Option<Duration>) -> Result<OptimizeReport> {
        let requeued_chunks = self.pipeline.resync_unsynced(Utc::now()).await?;
        let pruned = match prune_older_than {
            Some(age) => Some(self.pipeline.prune(age).await?),
            None => None,
        };
        self.store.optimize_search().await?;
        info!(requeued_chunks, pruned = pruned.is_some(), "knowledge base optimized");
        Ok(OptimizeReport {
            requeued_chunks,
            pruned,
        })
    }

    pub async fn stats(&self) -> Result<KnowledgeBaseStats> {
        let store = self.store.stats().await?;
        let queued_tasks = self.queue.pending().await?;
        let (vector_index, vector_index_error) = match self.index.stats().await {
            Ok(stats) => (Some(stats), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Ok(KnowledgeBaseStats {
            store,
            queued_tasks,
            vector_index,
            vector_index_error,
        })
    }

    /// Check each backend. Never fails; problems are reported per component.
    pub async fn health(&self) -> HealthReport {
        let mut components = vec![
            ComponentHealth::check("store", "sqlite", self.store.stats().await.map(|_| ())),
            ComponentHealth::check(
                "extractor",
                self.extractor.provider_name(),
                self.extractor.health().await,
            ),
            ComponentHealth::check(
                "vector_index",
                self.index.provider_name(),
                self.index.stats().await.map(|_| ()),
            ),
        ];
        components.push(match &self.embedder {
            Some(embedder) => ComponentHealth::check("embedding", embedder.provider_name(), Ok(())),
            None => ComponentHealth {
                component: "embedding",
                provider: "disabled".to_string(),
                healthy: true,
                detail: Some("keyword search only".to_string()),
            },
        });
        let answer = self.answerer().await;
        components.push(ComponentHealth::check(
            "answer",
            &self.config.answer.provider,
            answer.map(|_| ()),
        ));

        let healthy = components.iter().all(|c| c.healthy);
        info!(healthy, "health check finished");
        HealthReport {
            healthy,
            components,
        }
    }

    /// Verify and apply a processing-API webhook delivery. The secret is
    /// read from `RAG_WEBHOOK_SECRET`.
    pub async fn handle_webhook(&self, body: &[u8], signature: Option<&str>) -> Result<bool> {
        let secret = std::env::var(webhook::SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty());
        webhook::handle_webhook(&self.pipeline, secret.as_deref(), body, signature).await
    }

    async fn answerer(&self) -> Result<Arc<dyn AiAnswerer>> {
        self.answerer
            .get_or_try_init(|| async { create_answerer(&self.config.answer) })
            .await
            .cloned()
    }

    async fn qa(&self) -> Result<QuestionAnswerer> {
        Ok(QuestionAnswerer::new(
            self.engine.clone(),
            self.answerer().await?,
            self.store.clone(),
            self.config.analytics.track_usage,
        ))
    }
}
