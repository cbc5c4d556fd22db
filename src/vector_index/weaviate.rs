use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};

use super::{
    point_uuid, required_url, vector_err, IndexStats, VectorIndex, VectorMatch, VectorMetadata,
};
use crate::config::VectorConfig;
use crate::http::{build_client, error_for_response, read_json, send_with_retry};
use ragline_core::error::{RagError, Result};

const PROVIDER: &str = "weaviate";
const REQUEST_RETRIES: u32 = 1;

/// Weaviate REST objects API plus GraphQL `nearVector` search.
/// `WEAVIATE_API_KEY` is sent as a bearer token when set.
pub struct WeaviateIndex {
    client: Client,
    url: String,
    class_name: String,
    api_key: Option<String>,
}

impl WeaviateIndex {
    pub fn new(config: &VectorConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(PROVIDER, config.timeout_secs)?,
            url: required_url(config)?,
            class_name: class_name(&config.collection),
            api_key: std::env::var("WEAVIATE_API_KEY").ok().filter(|k| !k.is_empty()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

/// Weaviate class names are PascalCase: `rag_knowledge` → `RagKnowledge`.
fn class_name(collection: &str) -> String {
    collection
        .split(|c: char| !c.is_alphanumeric())
        .filter(|p| !p.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

fn parse_graphql(json: &serde_json::Value, class_name: &str) -> Result<Vec<VectorMatch>> {
    if let Some(errors) = json.get("errors") {
        return Err(RagError::VectorDatabaseError(format!("weaviate: {}", errors)));
    }
    let objects = json["data"]["Get"][class_name]
        .as_array()
        .cloned()
        .unwrap_or_default();
    Ok(objects
        .iter()
        .map(|object| {
            let text = |key: &str| object[key].as_str().unwrap_or_default().to_string();
            VectorMatch {
                id: text("vector_id"),
                score: object["_additional"]["certainty"].as_f64().unwrap_or(0.0),
                metadata: VectorMetadata {
                    chunk_id: text("chunk_id"),
                    document_id: text("document_id"),
                    document_title: text("document_title"),
                    chunk_index: object["chunk_index"].as_i64().unwrap_or(0),
                    content: text("content"),
                },
            }
        })
        .collect())
}

#[async_trait]
impl VectorIndex for WeaviateIndex {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    async fn upsert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<bool> {
        let mut properties = serde_json::to_value(metadata)?;
        properties["vector_id"] = serde_json::Value::String(id.to_string());
        let object_id = point_uuid(id);
        let body = serde_json::json!({
            "class": self.class_name,
            "id": object_id,
            "vector": vector,
            "properties": properties,
        });
        // PUT replaces an existing object; fall back to POST for new ones.
        let put = self
            .request(Method::PUT, &format!("/v1/objects/{}/{}", self.class_name, object_id))
            .json(&body)
            .send()
            .await
            .map_err(|e| vector_err(crate::http::classify_transport(PROVIDER, e)))?;
        if put.status().is_success() {
            return Ok(true);
        }
        if put.status() != StatusCode::NOT_FOUND {
            return Err(vector_err(error_for_response(PROVIDER, put).await));
        }
        send_with_retry(PROVIDER, REQUEST_RETRIES, || {
            self.request(Method::POST, "/v1/objects").json(&body)
        })
        .await
        .map_err(vector_err)?;
        Ok(true)
    }

    async fn delete(&self, ids: &[String]) -> Result<bool> {
        let mut all_ok = true;
        for id in ids {
            let path = format!("/v1/objects/{}/{}", self.class_name, point_uuid(id));
            let response = self
                .request(Method::DELETE, &path)
                .send()
                .await
                .map_err(|e| vector_err(crate::http::classify_transport(PROVIDER, e)))?;
            let status = response.status();
            if !(status.is_success() || status == StatusCode::NOT_FOUND) {
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    async fn delete_all(&self) -> Result<bool> {
        let path = format!("/v1/schema/{}", self.class_name);
        let response = send_with_retry(PROVIDER, REQUEST_RETRIES, || {
            self.request(Method::DELETE, &path)
        })
        .await
        .map_err(vector_err)?;
        Ok(response.status().is_success())
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<VectorMatch>> {
        let vector_json = serde_json::to_string(vector)?;
        let query = format!(
            "{{ Get {{ {class}(nearVector: {{vector: {vector}, certainty: {threshold}}}, limit: {limit}) \
             {{ vector_id chunk_id document_id document_title chunk_index content \
             _additional {{ certainty }} }} }} }}",
            class = self.class_name,
            vector = vector_json,
            threshold = threshold,
            limit = limit,
        );
        let body = serde_json::json!({ "query": query });
        let response = send_with_retry(PROVIDER, REQUEST_RETRIES, || {
            self.request(Method::POST, "/v1/graphql").json(&body)
        })
        .await
        .map_err(vector_err)?;
        let json = read_json(PROVIDER, response).await.map_err(vector_err)?;
        parse_graphql(&json, &self.class_name)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let query = format!(
            "{{ Aggregate {{ {} {{ meta {{ count }} }} }} }}",
            self.class_name
        );
        let body = serde_json::json!({ "query": query });
        let response = send_with_retry(PROVIDER, REQUEST_RETRIES, || {
            self.request(Method::POST, "/v1/graphql").json(&body)
        })
        .await
        .map_err(vector_err)?;
        let json = read_json(PROVIDER, response).await.map_err(vector_err)?;
        let count = json["data"]["Aggregate"][&self.class_name][0]["meta"]["count"]
            .as_u64()
            .unwrap_or(0);
        Ok(IndexStats {
            count: count as usize,
            dimensions: 0,
        })
    }
}
