use async_trait::async_trait;
use reqwest::Client;

use super::{
    metadata_from_json, required_url, vector_err, IndexStats, VectorIndex, VectorMatch,
    VectorMetadata,
};
use crate::config::VectorConfig;
use crate::http::{build_client, env_secret, read_json, send_with_retry};
use ragline_core::error::Result;

const PROVIDER: &str = "pinecone";
const REQUEST_RETRIES: u32 = 1;

/// Pinecone data-plane REST API. `vector.url` is the index host;
/// `vector.collection` is used as the namespace. Requires `PINECONE_API_KEY`.
pub struct PineconeIndex {
    client: Client,
    url: String,
    namespace: String,
    api_key: String,
}

impl PineconeIndex {
    pub fn new(config: &VectorConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(PROVIDER, config.timeout_secs)?,
            url: required_url(config)?,
            namespace: config.collection.clone(),
            api_key: env_secret("PINECONE_API_KEY")?,
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let endpoint = format!("{}{}", self.url, path);
        let response = send_with_retry(PROVIDER, REQUEST_RETRIES, || {
            self.client
                .post(&endpoint)
                .header("Api-Key", &self.api_key)
                .json(body)
        })
        .await
        .map_err(vector_err)?;
        read_json(PROVIDER, response).await.map_err(vector_err)
    }
}

fn parse_matches(json: &serde_json::Value, threshold: f64) -> Vec<VectorMatch> {
    json.get("matches")
        .and_then(|m| m.as_array())
        .map(|matches| {
            matches
                .iter()
                .map(|m| VectorMatch {
                    id: m["id"].as_str().unwrap_or_default().to_string(),
                    score: m["score"].as_f64().unwrap_or(0.0),
                    metadata: metadata_from_json(m.get("metadata")),
                })
                .filter(|m| m.score >= threshold)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<bool> {
        let body = serde_json::json!({
            "vectors": [{ "id": id, "values": vector, "metadata": metadata }],
            "namespace": self.namespace,
        });
        let json = self.post("/vectors/upsert", &body).await?;
        Ok(json["upsertedCount"].as_u64().unwrap_or(0) > 0)
    }

    async fn delete(&self, ids: &[String]) -> Result<bool> {
        if ids.is_empty() {
            return Ok(true);
        }
        let body = serde_json::json!({ "ids": ids, "namespace": self.namespace });
        self.post("/vectors/delete", &body).await?;
        Ok(true)
    }

    async fn delete_all(&self) -> Result<bool> {
        let body = serde_json::json!({ "deleteAll": true, "namespace": self.namespace });
        self.post("/vectors/delete", &body).await?;
        Ok(true)
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<VectorMatch>> {
        let body = serde_json::json!({
            "vector": vector,
            "topK": limit,
            "includeMetadata": true,
            "includeValues": false,
            "namespace": self.namespace,
        });
        let json = self.post("/query", &body).await?;
        Ok(parse_matches(&json, threshold))
    }

    async fn stats(&self) -> Result<IndexStats> {
        let json = self
            .post("/describe_index_stats", &serde_json::json!({}))
            .await?;
        Ok(IndexStats {
            count: json["totalVectorCount"].as_u64().unwrap_or(0) as usize,
            dimensions: json["dimension"].as_u64().unwrap_or(0) as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches_applies_threshold() {
        let json = serde_json::json!({
            "matches": [
                {"id": "chunk_a_1", "score": 0.8, "metadata": {"chunk_id": "a", "document_title": "A"}},
                {"id": "chunk_b_2", "score": 0.69, "metadata": {"chunk_id": "b"}}
            ]
        });
        let hits = parse_matches(&json, 0.7);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.document_title, "A");
    }

    #[test]
    fn test_parse_matches_empty() {
        assert!(parse_matches(&serde_json::json!({}), 0.0).is_empty());
    }
}
