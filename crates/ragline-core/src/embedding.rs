//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, plus pure helpers for input preparation and similarity.
//!
//! Concrete providers (OpenAI, Cohere, Ollama) and the caching layer live
//! in the `ragline` app crate.

use async_trait::async_trait;

use crate::error::{RagError, Result};

/// Approximate characters-per-token ratio used for budget estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Trait for embedding providers.
///
/// `generate_batch` returns one vector per input, in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Backend family, e.g. `"openai"`.
    fn provider_name(&self) -> &str;
    /// Model identifier, e.g. `"text-embedding-ada-002"`.
    fn model_name(&self) -> &str;
    /// Vector dimensionality, e.g. `1536`.
    fn dimensions(&self) -> usize;
    /// Largest input the backend accepts, in tokens.
    fn max_input_tokens(&self) -> usize;

    async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        self.generate_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::EmbeddingFailed("empty embedding response".to_string()))
    }

    /// Drop any cached vectors. No-op for uncached providers.
    async fn flush_cache(&self) {}
}

/// Rough token count: `ceil(len / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Validate and fit `text` to a provider's token budget.
///
/// Rejects empty or whitespace-only input. Over-budget text is cut to
/// `len × (max / estimate) × 0.9` bytes (snapped to a char boundary), so
/// the result is deterministic and never hard-fails for length alone.
pub fn prepare_input(text: &str, max_tokens: usize) -> Result<String> {
    if text.trim().is_empty() {
        return Err(RagError::EmbeddingFailed("empty text".to_string()));
    }
    let estimated = estimate_tokens(text);
    if max_tokens == 0 || estimated <= max_tokens {
        return Ok(text.to_string());
    }
    let ratio = max_tokens as f64 / estimated as f64;
    let target = (text.len() as f64 * ratio * 0.9) as usize;
    let mut end = target.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    Ok(text[..end].to_string())
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors
/// of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_prepare_rejects_blank() {
        assert_eq!(
            prepare_input("   \n", 100).unwrap_err(),
            RagError::EmbeddingFailed("empty text".to_string())
        );
        assert!(prepare_input("", 100).is_err());
    }

    #[test]
    fn test_prepare_keeps_short_text() {
        assert_eq!(prepare_input("short text", 100).unwrap(), "short text");
    }

    #[test]
    fn test_prepare_truncates_with_margin() {
        let text = "a".repeat(4000); // ~1000 tokens
        let out = prepare_input(&text, 500).unwrap();
        // 4000 × (500/1000) × 0.9
        assert_eq!(out.len(), 1800);
        assert!(estimate_tokens(&out) <= 500);
    }

    #[test]
    fn test_prepare_truncation_is_char_safe() {
        let text = "é".repeat(1000); // 2000 bytes
        let out = prepare_input(&text, 100).unwrap();
        assert!(!out.is_empty());
        assert!(out.chars().all(|c| c == 'é'));
    }
}
