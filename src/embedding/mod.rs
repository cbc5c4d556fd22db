//! Embedding provider implementations.
//!
//! Concrete backends for the [`EmbeddingProvider`] trait:
//! - **[`DisabledProvider`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API.
//! - **[`CohereProvider`]**: calls the Cohere `/v1/embed` endpoint.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Every remote backend is wrapped in a [`CachedEmbedder`], which validates
//! and truncates input, serves repeated texts from an in-process cache and
//! sends the remaining misses in a single batched call.
//!
//! # Provider Selection
//!
//! Use [`create_embedder`] to instantiate the configured provider:
//!
//! ```rust
//! # use ragline::config::EmbeddingConfig;
//! # use ragline::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_embedder(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```

mod cache;
mod cohere;
mod ollama;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;

pub use cache::{CacheStats, CachedEmbedder};
pub use cohere::CohereProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;

use crate::config::EmbeddingConfig;
use ragline_core::embedding::EmbeddingProvider;
use ragline_core::error::{RagError, Result};

/// Price of OpenAI embeddings per 1k tokens, in USD.
pub const OPENAI_EMBEDDING_COST_PER_1K: f64 = 0.0001;

/// Estimated USD cost of embedding `tokens` tokens, when the provider bills.
pub fn embedding_cost(provider: &str, tokens: usize) -> Option<f64> {
    match provider {
        "openai" => Some(tokens as f64 / 1000.0 * OPENAI_EMBEDDING_COST_PER_1K),
        _ => None,
    }
}

/// Build the configured embedding provider.
///
/// # Errors
///
/// Returns [`RagError::ConfigurationMissing`] when the selected backend's
/// credentials are absent.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let inner: Box<dyn EmbeddingProvider> = match config.provider.as_str() {
        "disabled" => return Ok(Arc::new(DisabledProvider)),
        "openai" => Box::new(OpenAIProvider::new(config)?),
        "cohere" => Box::new(CohereProvider::new(config)?),
        "ollama" => Box::new(OllamaProvider::new(config)?),
        other => {
            return Err(RagError::ConfigurationMissing(format!(
                "unknown embedding provider: {}",
                other
            )))
        }
    };
    Ok(Arc::new(CachedEmbedder::new(inner, config)))
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"`. Search falls back to
/// keyword retrieval and ingestion stops after chunking.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn provider_name(&self) -> &str {
        "disabled"
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dimensions(&self) -> usize {
        0
    }
    fn max_input_tokens(&self) -> usize {
        0
    }

    async fn generate_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(RagError::ConfigurationMissing(
            "embedding provider is disabled".to_string(),
        ))
    }
}

/// Extract `[[f32]]` from a JSON array of numeric arrays.
///
/// Any non-array embedding or non-numeric component fails the whole batch.
fn parse_vectors(provider: &str, arrays: &[serde_json::Value]) -> Result<Vec<Vec<f32>>> {
    arrays
        .iter()
        .enumerate()
        .map(|(i, embedding)| {
            let values = embedding.as_array().ok_or_else(|| {
                RagError::EmbeddingFailed(format!(
                    "invalid {} response: embedding {} is not an array",
                    provider, i
                ))
            })?;
            values
                .iter()
                .map(|v| {
                    v.as_f64().map(|f| f as f32).ok_or_else(|| {
                        RagError::EmbeddingFailed(format!(
                            "invalid {} response: embedding {} has non-numeric value {}",
                            provider, i, v
                        ))
                    })
                })
                .collect()
        })
        .collect()
}
