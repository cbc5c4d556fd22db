//! Processing job tracking and retry policy.
//!
//! Every asynchronous unit of work (extraction, embedding, vector sync) is
//! a [`ProcessingJob`] row. [`JobTracker`] wraps the store with the
//! lifecycle moves, and [`RetryPolicy`] decides whether a failed job gets
//! another attempt and when.
//!
//! # Retry Decision
//!
//! A failed job is retried when all of the following hold:
//!
//! 1. the error is retryable ([`RagError::is_retryable`]),
//! 2. `retry_count < max_retries`,
//! 3. the retry would still start inside the step's window, measured from
//!    job creation.
//!
//! The delay for retry `n` (1-based) is `backoff[min(n-1, len-1)]`,
//! multiplied for rate-limit failures.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::JobsConfig;
use ragline_core::error::{RagError, Result};
use ragline_core::models::{JobKind, ProcessingJob};
use ragline_core::store::Store;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
    /// Overall budget from job creation.
    pub window: Duration,
    pub rate_limit_multiplier: u32,
}

impl RetryPolicy {
    pub fn new(config: &JobsConfig, window_mins: u64) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config
                .backoff_secs
                .iter()
                .map(|s| Duration::seconds(*s as i64))
                .collect(),
            window: Duration::minutes(window_mins as i64),
            rate_limit_multiplier: config.rate_limit_backoff_multiplier.max(1),
        }
    }

    pub fn for_kind(config: &JobsConfig, kind: JobKind) -> Self {
        let window = match kind {
            JobKind::DocumentProcessing => config.extraction_retry_window_mins,
            JobKind::EmbeddingGeneration => config.embedding_retry_window_mins,
            JobKind::VectorSync => config.vector_retry_window_mins,
        };
        Self::new(config, window)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, err: &RagError) -> Duration {
        let Some(last) = self.backoff.len().checked_sub(1) else {
            return Duration::zero();
        };
        let idx = (attempt.max(1) as usize - 1).min(last);
        let base = self.backoff[idx];
        if err.is_rate_limited() {
            base * self.rate_limit_multiplier as i32
        } else {
            base
        }
    }

    /// Delay before the next attempt, or `None` when the job should stay
    /// failed.
    pub fn next_retry(
        &self,
        job: &ProcessingJob,
        err: &RagError,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        if !err.is_retryable() {
            debug!(job_id = %job.id, error = %err, "error is not retryable");
            return None;
        }
        if job.retry_count >= job.max_retries.min(self.max_retries) {
            return None;
        }
        let delay = self.delay_for(job.retry_count + 1, err);
        if now + delay > job.created_at + self.window {
            debug!(job_id = %job.id, "retry window exhausted");
            return None;
        }
        Some(delay)
    }
}

/// Retry policies for each job kind.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    pub extraction: RetryPolicy,
    pub embedding: RetryPolicy,
    pub vector_sync: RetryPolicy,
}

impl RetryPolicies {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            extraction: RetryPolicy::for_kind(config, JobKind::DocumentProcessing),
            embedding: RetryPolicy::for_kind(config, JobKind::EmbeddingGeneration),
            vector_sync: RetryPolicy::for_kind(config, JobKind::VectorSync),
        }
    }

    pub fn get(&self, kind: JobKind) -> &RetryPolicy {
        match kind {
            JobKind::DocumentProcessing => &self.extraction,
            JobKind::EmbeddingGeneration => &self.embedding,
            JobKind::VectorSync => &self.vector_sync,
        }
    }
}

/// Lifecycle operations on persisted [`ProcessingJob`] rows.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn Store>,
    policies: RetryPolicies,
}

impl JobTracker {
    pub fn new(store: Arc<dyn Store>, policies: RetryPolicies) -> Self {
        Self { store, policies }
    }

    pub fn policy(&self, kind: JobKind) -> &RetryPolicy {
        self.policies.get(kind)
    }

    /// Create and persist a queued job.
    pub async fn create(
        &self,
        kind: JobKind,
        document_id: Option<&str>,
        chunk_id: Option<&str>,
        provider: &str,
    ) -> Result<ProcessingJob> {
        let mut job =
            ProcessingJob::new(kind, document_id, provider, self.policy(kind).max_retries);
        if let Some(chunk_id) = chunk_id {
            job = job.for_chunk(chunk_id);
        }
        self.store.insert_job(&job).await?;
        Ok(job)
    }

    pub async fn load(&self, job_id: &str) -> Result<ProcessingJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| RagError::not_found("job", job_id))
    }

    pub async fn save(&self, job: &ProcessingJob) -> Result<()> {
        self.store.update_job(job).await
    }

    pub async fn start(&self, job: &mut ProcessingJob) -> Result<()> {
        job.mark_started()?;
        self.save(job).await
    }

    pub async fn complete(&self, job: &mut ProcessingJob) -> Result<()> {
        job.mark_completed()?;
        self.save(job).await
    }

    pub async fn progress(&self, job: &mut ProcessingJob, progress: f64) -> Result<()> {
        job.update_progress(progress);
        self.save(job).await
    }

    /// Record a failure and decide on a retry.
    ///
    /// Returns the delay before the next attempt when one is granted; the
    /// job is then left `retrying`. Otherwise the job stays `failed`.
    pub async fn fail(
        &self,
        job: &mut ProcessingJob,
        err: &RagError,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>> {
        job.mark_failed(&err.to_string())?;
        let retry = self.policy(job.kind).next_retry(job, err, now);
        if retry.is_some() {
            job.mark_retrying()?;
        }
        self.save(job).await?;
        Ok(retry)
    }

    /// Fail without considering a retry.
    pub async fn fail_permanently(&self, job: &mut ProcessingJob, message: &str) -> Result<()> {
        job.mark_failed(message)?;
        self.save(job).await
    }
}
