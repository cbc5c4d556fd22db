//! Chunk extraction backends.
//!
//! A [`ChunkExtractor`] turns raw document bytes into ordered text chunks.
//! Two shapes exist behind the one trait:
//!
//! - [`LocalExtractor`] extracts text in-process and splits it on sentence
//!   boundaries; `submit` finishes immediately with
//!   [`Submission::Completed`].
//! - [`HttpExtractor`] hands the file to a remote processing API and
//!   returns [`Submission::Accepted`] with the remote job id. The pipeline
//!   then follows the job through `poll` (or the webhook) and collects the
//!   chunks with `fetch_result`.

mod local;
mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

pub use local::LocalExtractor;
pub use remote::HttpExtractor;

use crate::config::{ChunkingConfig, ExtractionConfig};
use ragline_core::error::{RagError, Result};
use ragline_core::models::{ExtractedChunk, Metadata};

/// Raw content handed to an extractor.
#[derive(Debug, Clone)]
pub struct ExtractionInput {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub media_type: String,
}

/// Chunking options, forwarded as JSON to the remote API.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOptions {
    pub chunking_strategy: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    #[serde(skip)]
    pub max_chunk_size: usize,
    #[serde(skip)]
    pub min_chunk_size: usize,
    pub extract_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl ExtractionOptions {
    pub fn from_config(chunking: &ChunkingConfig, extraction: &ExtractionConfig) -> Self {
        Self {
            chunking_strategy: chunking.strategy.clone(),
            chunk_size: chunking.chunk_size,
            chunk_overlap: chunking.chunk_overlap,
            max_chunk_size: chunking.max_chunk_size,
            min_chunk_size: chunking.min_chunk_size,
            extract_metadata: true,
            webhook_url: extraction.webhook_url.clone(),
        }
    }
}

/// Result of handing a document to an extractor.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Chunks are ready now.
    Completed(Vec<ExtractedChunk>),
    /// A remote job was created; follow it by `job_id`.
    Accepted {
        job_id: String,
        external_document_id: Option<String>,
        cost: Option<f64>,
    },
}

/// Status vocabulary of remote extraction jobs.
///
/// Unrecognized values are kept verbatim so callers can log them and keep
/// polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Queued,
    Pending,
    Processing,
    InProgress,
    Completed,
    Failed,
    Unknown(String),
}

impl RemoteState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => RemoteState::Queued,
            "pending" => RemoteState::Pending,
            "processing" | "progress" => RemoteState::Processing,
            "in_progress" => RemoteState::InProgress,
            "completed" => RemoteState::Completed,
            "failed" => RemoteState::Failed,
            _ => RemoteState::Unknown(s.to_string()),
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, RemoteState::Queued | RemoteState::Pending)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RemoteState::Processing | RemoteState::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStatus {
    pub state: RemoteState,
    pub progress: Option<f64>,
    pub error: Option<String>,
}

#[async_trait]
pub trait ChunkExtractor: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Whether `submit` always finishes with [`Submission::Completed`].
    fn is_synchronous(&self) -> bool {
        false
    }

    async fn submit(&self, input: &ExtractionInput, options: &ExtractionOptions)
        -> Result<Submission>;

    async fn poll(&self, job_id: &str) -> Result<RemoteStatus>;

    async fn fetch_result(&self, job_id: &str) -> Result<Vec<ExtractedChunk>>;

    /// Ask the remote side to run a failed job again.
    async fn retry(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the configured extractor.
pub fn create_extractor(extraction: &ExtractionConfig) -> Result<Arc<dyn ChunkExtractor>> {
    match extraction.mode.as_str() {
        "local" => Ok(Arc::new(LocalExtractor::new())),
        "external" => Ok(Arc::new(HttpExtractor::new(extraction)?)),
        other => Err(RagError::ConfigurationMissing(format!(
            "unknown extraction mode: {}",
            other
        ))),
    }
}

/// Parse a `chunks` array as returned by the processing API.
///
/// Metadata values that are not strings are kept as their JSON text.
/// Entries without usable content are dropped.
pub fn parse_chunks(value: &serde_json::Value) -> Vec<ExtractedChunk> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let content = item["content"].as_str()?.trim();
            if content.is_empty() {
                return None;
            }
            let metadata: Metadata = item["metadata"]
                .as_object()
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| {
                            let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                            (k.clone(), v)
                        })
                        .collect()
                })
                .unwrap_or_default();
            let keywords = item["keywords"]
                .as_array()
                .map(|ks| {
                    ks.iter()
                        .filter_map(|k| k.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(ExtractedChunk {
                content: content.to_string(),
                metadata,
                keywords,
            })
        })
        .collect()
}
