use async_trait::async_trait;
use reqwest::Client;

use super::parse_vectors;
use crate::config::EmbeddingConfig;
use crate::http::{build_client, env_secret, read_json, send_with_retry};
use ragline_core::embedding::EmbeddingProvider;
use ragline_core::error::{RagError, Result};

const PROVIDER: &str = "openai";
const DEFAULT_MODEL: &str = "text-embedding-ada-002";
const DEFAULT_DIMS: usize = 1536;
const DEFAULT_URL: &str = "https://api.openai.com/v1";
const MAX_INPUT_TOKENS: usize = 8191;

/// Embedding provider using the OpenAI API.
///
/// Calls `POST {url}/embeddings`. Requires `OPENAI_API_KEY`.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = env_secret("OPENAI_API_KEY")?;
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
impl EmbeddingProvider for OpenAIProvider {
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
        let endpoint = format!("{}/embeddings", self.url.trim_end_matches('/'));

        let response = send_with_retry(PROVIDER, self.max_retries, || {
            self.client
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;
        let json = read_json(PROVIDER, response).await?;
        parse_openai_response(&json)
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts the `data[].embedding` arrays, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            RagError::EmbeddingFailed("invalid OpenAI response: missing data array".to_string())
        })?;

    let mut items: Vec<(u64, serde_json::Value)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item.get("embedding").cloned().ok_or_else(|| {
            RagError::EmbeddingFailed("invalid OpenAI response: missing embedding".to_string())
        })?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);
        items.push((index, embedding));
    }
    // Sort by index to ensure order matches input
    items.sort_by_key(|(index, _)| *index);

    let arrays: Vec<serde_json::Value> = items.into_iter().map(|(_, e)| e).collect();
    parse_vectors(PROVIDER, &arrays)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let parsed = parse_openai_response(&json).unwrap();
        assert_eq!(parsed, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_missing_data() {
        let err = parse_openai_response(&serde_json::json!({"error": "x"})).unwrap_err();
        assert!(matches!(err, RagError::EmbeddingFailed(_)));
    }
}
