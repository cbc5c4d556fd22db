use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};

use super::{
    metadata_from_json, point_uuid, required_url, vector_err, IndexStats, VectorIndex,
    VectorMatch, VectorMetadata,
};
use crate::config::VectorConfig;
use crate::http::{build_client, read_json, send_with_retry};
use ragline_core::error::{RagError, Result};

const PROVIDER: &str = "qdrant";
const REQUEST_RETRIES: u32 = 1;

/// Qdrant over its REST API. `QDRANT_API_KEY` is sent when set.
pub struct QdrantIndex {
    client: Client,
    url: String,
    collection: String,
    api_key: Option<String>,
}

impl QdrantIndex {
    pub fn new(config: &VectorConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(PROVIDER, config.timeout_secs)?,
            url: required_url(config)?,
            collection: config.collection.clone(),
            api_key: std::env::var("QDRANT_API_KEY").ok().filter(|k| !k.is_empty()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/collections/{}{}", self.url, self.collection, path));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let response = send_with_retry(PROVIDER, REQUEST_RETRIES, || {
            self.request(method.clone(), path).json(body)
        })
        .await
        .map_err(vector_err)?;
        read_json(PROVIDER, response).await.map_err(vector_err)
    }
}

fn status_ok(json: &serde_json::Value) -> bool {
    json.get("status").and_then(|s| s.as_str()) == Some("ok")
}

fn parse_search(json: &serde_json::Value) -> Result<Vec<VectorMatch>> {
    let points = json
        .get("result")
        .and_then(|r| r.as_array())
        .ok_or_else(|| RagError::VectorDatabaseError("qdrant: missing result array".into()))?;
    Ok(points
        .iter()
        .map(|point| {
            let payload = point.get("payload");
            let id = payload
                .and_then(|p| p.get("vector_id"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| point.get("id").map(|v| v.to_string()).unwrap_or_default());
            VectorMatch {
                id,
                score: point.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0),
                metadata: metadata_from_json(payload),
            }
        })
        .collect())
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<bool> {
        let mut payload = serde_json::to_value(metadata)?;
        payload["vector_id"] = serde_json::Value::String(id.to_string());
        let body = serde_json::json!({
            "points": [{
                "id": point_uuid(id),
                "vector": vector,
                "payload": payload,
            }]
        });
        let json = self.send(reqwest::Method::PUT, "/points", &body).await?;
        Ok(status_ok(&json))
    }

    async fn delete(&self, ids: &[String]) -> Result<bool> {
        if ids.is_empty() {
            return Ok(true);
        }
        let points: Vec<String> = ids.iter().map(|id| point_uuid(id)).collect();
        let body = serde_json::json!({ "points": points });
        let json = self.send(reqwest::Method::POST, "/points/delete", &body).await?;
        Ok(status_ok(&json))
    }

    async fn delete_all(&self) -> Result<bool> {
        // An empty `must` clause matches every point.
        let body = serde_json::json!({ "filter": { "must": [] } });
        let json = self.send(reqwest::Method::POST, "/points/delete", &body).await?;
        Ok(status_ok(&json))
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<VectorMatch>> {
        let body = serde_json::json!({
            "vector": vector,
            "limit": limit,
            "score_threshold": threshold,
            "with_payload": true,
        });
        let json = self.send(reqwest::Method::POST, "/points/search", &body).await?;
        parse_search(&json)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let response = send_with_retry(PROVIDER, REQUEST_RETRIES, || {
            self.request(reqwest::Method::GET, "")
        })
        .await
        .map_err(vector_err)?;
        let json = read_json(PROVIDER, response).await.map_err(vector_err)?;
        let result = &json["result"];
        Ok(IndexStats {
            count: result["points_count"].as_u64().unwrap_or(0) as usize,
            dimensions: result["config"]["params"]["vectors"]["size"]
                .as_u64()
                .unwrap_or(0) as usize,
        })
    }
}
