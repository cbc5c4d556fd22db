use async_trait::async_trait;
use reqwest::Client;

use super::parse_vectors;
use crate::config::EmbeddingConfig;
use crate::http::{build_client, env_secret, read_json, send_with_retry};
use ragline_core::embedding::EmbeddingProvider;
use ragline_core::error::{RagError, Result};

const PROVIDER: &str = "cohere";
const DEFAULT_MODEL: &str = "embed-english-v3.0";
const DEFAULT_DIMS: usize = 1024;
const DEFAULT_URL: &str = "https://api.cohere.ai/v1";
const MAX_INPUT_TOKENS: usize = 2048;

/// Embedding provider using the Cohere API. Requires `COHERE_API_KEY`.
pub struct CohereProvider {
    client: Client,
    api_key: String,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl CohereProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = env_secret("COHERE_API_KEY")?;
        Ok(Self {
            client: build_client(PROVIDER, config.timeout_secs)?,
            api_key,
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
impl EmbeddingProvider for CohereProvider {
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
            "texts": texts,
            "model": self.model,
            "input_type": "search_document",
        });
        let endpoint = format!("{}/embed", self.url.trim_end_matches('/'));

        let response = send_with_retry(PROVIDER, self.max_retries, || {
            self.client
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;
        let json = read_json(PROVIDER, response).await?;
        parse_cohere_response(&json)
    }
}

fn parse_cohere_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            RagError::EmbeddingFailed(
                "invalid Cohere response: missing embeddings array".to_string(),
            )
        })?;
    parse_vectors(PROVIDER, embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cohere_response() {
        let json = serde_json::json!({"id": "x", "embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let parsed = parse_cohere_response(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!((parsed[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_parse_cohere_missing() {
        assert!(parse_cohere_response(&serde_json::json!({"message": "bad"})).is_err());
    }
}
