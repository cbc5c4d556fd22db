use async_trait::async_trait;
use reqwest::Client;

use super::parse_vectors;
use crate::config::EmbeddingConfig;
use crate::http::{build_client, read_json, send_with_retry};
use ragline_core::embedding::EmbeddingProvider;
use ragline_core::error::{RagError, Result};

const PROVIDER: &str = "ollama";
const DEFAULT_MODEL: &str = "nomic-embed-text";
const DEFAULT_DIMS: usize = 768;
const DEFAULT_URL: &str = "http://localhost:11434";
const MAX_INPUT_TOKENS: usize = 8192;

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires an embedding model to be pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    client: Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(PROVIDER, config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dims: config.dims.unwrap_or(DEFAULT_DIMS),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn provider_name(&self) -> &str {
        PROVIDER
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dimensions(&self) -> usize {
        self.dims
    }
    fn max_input_tokens(&self) -> usize {
        MAX_INPUT_TOKENS
    }

    async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));

        let response = send_with_retry(PROVIDER, self.max_retries, || {
            self.client.post(&endpoint).json(&body)
        })
        .await
        .map_err(|e| match e {
            RagError::ProviderRequestFailed { provider, message } => {
                RagError::ProviderRequestFailed {
                    provider,
                    message: format!("{} (is Ollama running at {}?)", message, self.url),
                }
            }
            other => other,
        })?;
        let json = read_json(PROVIDER, response).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            RagError::EmbeddingFailed(
                "invalid Ollama response: missing embeddings array".to_string(),
            )
        })?;
    parse_vectors(PROVIDER, embeddings)
}
