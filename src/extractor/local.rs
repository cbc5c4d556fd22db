use async_trait::async_trait;

use super::{ChunkExtractor, ExtractionInput, ExtractionOptions, RemoteStatus, Submission};
use crate::extract::{detect_format, extract_text, DocumentFormat};
use ragline_core::chunk::{chunk_sentences, ChunkingOptions};
use ragline_core::error::{RagError, Result};
use ragline_core::models::ExtractedChunk;

/// In-process extraction: text extraction followed by sentence chunking.
#[derive(Debug, Default)]
pub struct LocalExtractor;

impl LocalExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChunkExtractor for LocalExtractor {
    fn provider_name(&self) -> &str {
        "local"
    }

    fn is_synchronous(&self) -> bool {
        true
    }

    async fn submit(
        &self,
        input: &ExtractionInput,
        options: &ExtractionOptions,
    ) -> Result<Submission> {
        let format = detect_format(&input.filename)
            .or_else(|| DocumentFormat::from_media_type(&input.media_type))
            .ok_or_else(|| {
                RagError::InvalidInput(format!("unsupported file type: {}", input.filename))
            })?;
        let text = extract_text(&input.bytes, format)?;
        let chunking = ChunkingOptions {
            chunk_size: options.chunk_size,
            overlap: options.chunk_overlap,
            max_chunk_size: options.max_chunk_size.max(options.chunk_size),
            min_chunk_size: options.min_chunk_size,
        };
        let chunks = chunk_sentences(&text, &chunking)
            .into_iter()
            .map(|content| ExtractedChunk {
                content,
                ..Default::default()
            })
            .collect();
        Ok(Submission::Completed(chunks))
    }

    async fn poll(&self, job_id: &str) -> Result<RemoteStatus> {
        Err(RagError::not_found("extraction job", job_id))
    }

    async fn fetch_result(&self, job_id: &str) -> Result<Vec<ExtractedChunk>> {
        Err(RagError::not_found("extraction job", job_id))
    }
}
