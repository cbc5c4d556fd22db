use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{IndexStats, VectorIndex, VectorMatch, VectorMetadata};
use ragline_core::embedding::cosine_similarity;
use ragline_core::error::{RagError, Result};

/// In-process index with brute-force cosine search.
#[derive(Default)]
pub struct MemoryIndex {
    points: RwLock<HashMap<String, (Vec<f32>, VectorMetadata)>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, (Vec<f32>, VectorMetadata)>>> {
        self.points
            .read()
            .map_err(|_| RagError::VectorDatabaseError("memory index lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, (Vec<f32>, VectorMetadata)>>> {
        self.points
            .write()
            .map_err(|_| RagError::VectorDatabaseError("memory index lock poisoned".into()))
    }

    /// Stored vector ids, sorted.
    pub fn ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.read()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn provider_name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<bool> {
        if vector.is_empty() {
            return Err(RagError::VectorDatabaseError("empty vector".into()));
        }
        let mut points = self.write()?;
        if let Some((existing, _)) = points.values().next() {
            if existing.len() != vector.len() {
                return Err(RagError::VectorDatabaseError(format!(
                    "dimension mismatch: index holds {}, got {}",
                    existing.len(),
                    vector.len()
                )));
            }
        }
        points.insert(id.to_string(), (vector.to_vec(), metadata.clone()));
        Ok(true)
    }

    async fn delete(&self, ids: &[String]) -> Result<bool> {
        let mut points = self.write()?;
        for id in ids {
            points.remove(id);
        }
        Ok(true)
    }

    async fn delete_all(&self) -> Result<bool> {
        self.write()?.clear();
        Ok(true)
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<VectorMatch>> {
        let points = self.read()?;
        let mut matches: Vec<VectorMatch> = points
            .iter()
            .map(|(id, (stored, metadata))| VectorMatch {
                id: id.clone(),
                score: cosine_similarity(vector, stored) as f64,
                metadata: metadata.clone(),
            })
            .filter(|m| m.score >= threshold)
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let points = self.read()?;
        Ok(IndexStats {
            count: points.len(),
            dimensions: points.values().next().map(|(v, _)| v.len()).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(chunk_id: &str) -> VectorMetadata {
        VectorMetadata {
            chunk_id: chunk_id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_query_orders_and_filters() {
        let index = MemoryIndex::new();
        index.upsert("a", &[1.0, 0.0], &meta("a")).await.unwrap();
        index.upsert("b", &[0.7, 0.7], &meta("b")).await.unwrap();
        index.upsert("c", &[0.0, 1.0], &meta("c")).await.unwrap();

        let hits = index.query(&[1.0, 0.0], 10, 0.5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_and_delete() {
        let index = MemoryIndex::new();
        index.upsert("a", &[1.0, 0.0], &meta("a")).await.unwrap();
        index.upsert("a", &[0.0, 1.0], &meta("a2")).await.unwrap();
        assert_eq!(index.stats().await.unwrap(), IndexStats { count: 1, dimensions: 2 });

        index.delete(&["a".to_string(), "missing".to_string()]).await.unwrap();
        assert_eq!(index.stats().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = MemoryIndex::new();
        index.upsert("a", &[1.0, 0.0], &meta("a")).await.unwrap();
        let err = index.upsert("b", &[1.0], &meta("b")).await.unwrap_err();
        assert!(matches!(err, RagError::VectorDatabaseError(_)));
    }

    #[tokio::test]
    async fn test_delete_all() {
        let index = MemoryIndex::new();
        index.upsert("a", &[1.0], &meta("a")).await.unwrap();
        assert!(index.delete_all().await.unwrap());
        assert!(index.ids().unwrap().is_empty());
    }
}
