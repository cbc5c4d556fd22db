//! Input preparation and caching in front of a remote embedding backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::EmbeddingConfig;
use ragline_core::embedding::{prepare_input, EmbeddingProvider};
use ragline_core::error::{RagError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CacheEntry {
    vector: Vec<f32>,
    stored_at: Instant,
}

/// Wraps a backend with validation, truncation and a TTL cache.
///
/// Cache keys are `md5(text + provider + model)`, so switching models never
/// serves stale vectors.
pub struct CachedEmbedder {
    inner: Box<dyn EmbeddingProvider>,
    enabled: bool,
    ttl: Duration,
    batch_size: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedEmbedder {
    pub fn new(inner: Box<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            inner,
            enabled: config.cache_enabled,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            batch_size: config.batch_size.max(1),
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn cache_key(&self, text: &str) -> String {
        let digest = md5::compute(format!(
            "{}{}{}",
            text,
            self.inner.provider_name(),
            self.inner.model_name()
        ));
        format!("{:x}", digest)
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().await.len(),
        }
    }

    async fn lookup(&self, key: &str) -> Option<Vec<f32>> {
        if !self.enabled {
            return None;
        }
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.vector.clone())
    }

    async fn store(&self, key: String, vector: &[f32]) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        entries.insert(
            key,
            CacheEntry {
                vector: vector.to_vec(),
                stored_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
    fn max_input_tokens(&self) -> usize {
        self.inner.max_input_tokens()
    }

    async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let max_tokens = self.inner.max_input_tokens();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_positions = Vec::new();
        let mut miss_inputs = Vec::new();
        let mut miss_keys = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let prepared = prepare_input(text, max_tokens)?;
            let key = self.cache_key(text);
            match self.lookup(&key).await {
                Some(vector) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    results[i] = Some(vector);
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    miss_positions.push(i);
                    miss_inputs.push(prepared);
                    miss_keys.push(key);
                }
            }
        }

        if !miss_inputs.is_empty() {
            debug!(
                provider = self.inner.provider_name(),
                hits = texts.len() - miss_inputs.len(),
                misses = miss_inputs.len(),
                "embedding batch"
            );
        }

        let mut fresh = Vec::with_capacity(miss_inputs.len());
        for batch in miss_inputs.chunks(self.batch_size) {
            let vectors = self.inner.generate_batch(batch).await?;
            if vectors.len() != batch.len() {
                return Err(RagError::EmbeddingFailed(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            fresh.extend(vectors);
        }

        let dims = self.inner.dimensions();
        for ((pos, key), vector) in miss_positions.into_iter().zip(miss_keys).zip(fresh) {
            if dims > 0 && vector.len() != dims {
                return Err(RagError::EmbeddingFailed(format!(
                    "expected {} dimensions, got {}",
                    dims,
                    vector.len()
                )));
            }
            self.store(key, &vector).await;
            results[pos] = Some(vector);
        }

        results
            .into_iter()
            .map(|v| v.ok_or_else(|| RagError::EmbeddingFailed("missing embedding".to_string())))
            .collect()
    }

    async fn flush_cache(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    /// Returns `[len, 1.0]` per input and records every batch it sees.
    struct Recording {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
        max_tokens: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for Recording {
        fn provider_name(&self) -> &str {
            "fake"
        }
        fn model_name(&self) -> &str {
            "fake-model"
        }
        fn dimensions(&self) -> usize {
            2
        }
        fn max_input_tokens(&self) -> usize {
            self.max_tokens
        }
        async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.lock().unwrap().push(texts.to_vec());
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn embedder(max_tokens: usize) -> (CachedEmbedder, Arc<Mutex<Vec<Vec<String>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inner = Recording {
            calls: calls.clone(),
            max_tokens,
        };
        (CachedEmbedder::new(Box::new(inner), &EmbeddingConfig::default()), calls)
    }

    #[tokio::test]
    async fn test_cache_hits_skip_provider() {
        let (e, calls) = embedder(100);
        let first = e.generate("hello").await.unwrap();
        let second = e.generate("hello").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.lock().unwrap().len(), 1);
        let stats = e.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_batch_sends_only_misses_in_order() {
        let (e, calls) = embedder(100);
        e.generate("bb").await.unwrap();
        let out = e
            .generate_batch(&["a".to_string(), "bb".to_string(), "ccc".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 1.0], vec![2.0, 1.0], vec![3.0, 1.0]]);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], vec!["a".to_string(), "ccc".to_string()]);
    }

    #[tokio::test]
    async fn test_blank_input_rejected_before_provider() {
        let (e, calls) = embedder(100);
        let err = e.generate("  ").await.unwrap_err();
        assert_eq!(err, RagError::EmbeddingFailed("empty text".to_string()));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_long_input_truncated() {
        let (e, calls) = embedder(10);
        let text = "x".repeat(400);
        e.generate(&text).await.unwrap();
        let sent = &calls.lock().unwrap()[0][0];
        // 400 × (10/100) × 0.9
        assert_eq!(sent.len(), 36);
    }

    #[tokio::test]
    async fn test_flush_cache() {
        let (e, calls) = embedder(100);
        e.generate("hello").await.unwrap();
        e.flush_cache().await;
        e.generate("hello").await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 2);
    }
}
