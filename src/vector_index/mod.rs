//! Vector index abstraction and backends.
//!
//! The remote similarity index only ever holds embeddings; the relational
//! store remains the source of truth for chunk text and sync state.
//!
//! | Backend | Selected by `vector.provider` | Transport |
//! |---------|-------------------------------|-----------|
//! | [`MemoryIndex`] | `memory` | in-process brute-force cosine |
//! | [`QdrantIndex`] | `qdrant` | REST |
//! | [`PineconeIndex`] | `pinecone` | REST |
//! | [`WeaviateIndex`] | `weaviate` | REST + GraphQL |

mod memory;
mod pinecone;
mod qdrant;
mod weaviate;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryIndex;
pub use pinecone::PineconeIndex;
pub use qdrant::QdrantIndex;
pub use weaviate::WeaviateIndex;

use crate::config::VectorConfig;
use ragline_core::error::{RagError, Result};
use ragline_core::models::Chunk;

/// Longest chunk excerpt stored alongside a vector.
pub const METADATA_CONTENT_CHARS: usize = 1000;

/// Payload stored next to each vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorMetadata {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub chunk_index: i64,
    pub content: String,
}

impl VectorMetadata {
    pub fn for_chunk(chunk: &Chunk, document_title: &str) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            document_title: document_title.to_string(),
            chunk_index: chunk.chunk_index,
            content: chunk.content.chars().take(METADATA_CONTENT_CHARS).collect(),
        }
    }
}

/// One similarity hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    /// The vector id the point was stored under.
    pub id: String,
    pub score: f64,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub count: usize,
    pub dimensions: usize,
}

/// A similarity index over chunk embeddings.
///
/// Every method is a remote failure point; errors are
/// [`RagError::VectorDatabaseError`] or one of the provider request variants.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Insert or overwrite the vector stored under `id`.
    async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<bool>;

    async fn delete(&self, ids: &[String]) -> Result<bool>;

    async fn delete_all(&self) -> Result<bool>;

    /// Up to `limit` nearest vectors. Backends filter by `threshold` when
    /// they can; callers must not rely on it.
    async fn query(&self, vector: &[f32], limit: usize, threshold: f64) -> Result<Vec<VectorMatch>>;

    async fn stats(&self) -> Result<IndexStats>;
}

/// Build the configured vector index.
pub fn create_vector_index(config: &VectorConfig) -> Result<Arc<dyn VectorIndex>> {
    match config.provider.as_str() {
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        "qdrant" => Ok(Arc::new(QdrantIndex::new(config)?)),
        "pinecone" => Ok(Arc::new(PineconeIndex::new(config)?)),
        "weaviate" => Ok(Arc::new(WeaviateIndex::new(config)?)),
        other => Err(RagError::ConfigurationMissing(format!(
            "unknown vector provider: {}",
            other
        ))),
    }
}

fn required_url(config: &VectorConfig) -> Result<String> {
    config
        .url
        .as_ref()
        .map(|u| u.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            RagError::ConfigurationMissing(format!(
                "vector.url required for {} provider",
                config.provider
            ))
        })
}

/// Backends that only accept UUID point ids get a stable UUID derived from
/// the vector id; the original id travels in the payload.
fn point_uuid(vector_id: &str) -> String {
    Uuid::from_bytes(md5::compute(vector_id.as_bytes()).0).to_string()
}

/// Re-tag provider request failures as vector database errors so callers
/// see one kind per step. Auth and rate-limit errors pass through.
fn vector_err(err: RagError) -> RagError {
    match err {
        RagError::ProviderRequestFailed { provider, message } => {
            RagError::VectorDatabaseError(format!("{}: {}", provider, message))
        }
        other => other,
    }
}

fn metadata_from_json(value: Option<&serde_json::Value>) -> VectorMetadata {
    value
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_truncates_content() {
        let chunk = Chunk::new("doc", 2, &"é".repeat(1500));
        let meta = VectorMetadata::for_chunk(&chunk, "Title");
        assert_eq!(meta.content.chars().count(), METADATA_CONTENT_CHARS);
        assert_eq!(meta.chunk_index, 2);
        assert_eq!(meta.document_title, "Title");
    }

    #[test]
    fn test_point_uuid_is_stable() {
        let a = point_uuid("chunk_1_abc");
        assert_eq!(a, point_uuid("chunk_1_abc"));
        assert_ne!(a, point_uuid("chunk_1_abd"));
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_vector_err_retags_request_failures() {
        let err = vector_err(RagError::request_failed("qdrant", "boom"));
        assert!(matches!(err, RagError::VectorDatabaseError(_)));
        let auth = RagError::ProviderAuthFailed {
            provider: "qdrant".into(),
            message: "no".into(),
        };
        assert_eq!(vector_err(auth.clone()), auth);
    }

    #[test]
    fn test_metadata_from_partial_json() {
        let json = serde_json::json!({"chunk_id": "c1", "content": "x", "extra": true});
        let meta = metadata_from_json(Some(&json));
        assert_eq!(meta.chunk_id, "c1");
        assert_eq!(meta.document_id, "");
    }
}
