use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder};

use super::{
    parse_chunks, ChunkExtractor, ExtractionInput, ExtractionOptions, RemoteState, RemoteStatus,
    Submission,
};
use crate::config::ExtractionConfig;
use crate::http::{build_client, env_secret, read_json, send_with_retry};
use ragline_core::error::{RagError, Result};
use ragline_core::models::ExtractedChunk;

const PROVIDER: &str = "processing_api";
const REQUEST_RETRIES: u32 = 2;

/// Client for the external document-processing API.
///
/// Requires `extraction.api_url` and `RAG_PROCESSING_API_KEY`.
pub struct HttpExtractor {
    client: Client,
    api_url: String,
    api_key: String,
}

impl HttpExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let api_url = config
            .api_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .ok_or_else(|| RagError::ConfigurationMissing("extraction.api_url".to_string()))?;
        Ok(Self {
            client: build_client(PROVIDER, config.timeout_secs)?,
            api_url,
            api_key: env_secret("RAG_PROCESSING_API_KEY")?,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.api_key)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let response =
            send_with_retry(PROVIDER, REQUEST_RETRIES, || self.request(Method::GET, path)).await?;
        read_json(PROVIDER, response).await
    }
}

fn parse_submission(json: &serde_json::Value) -> Result<Submission> {
    let job_id = json["job_id"]
        .as_str()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RagError::request_failed(PROVIDER, "response has no job_id"))?;
    Ok(Submission::Accepted {
        job_id: job_id.to_string(),
        external_document_id: json["document_id"].as_str().map(str::to_string),
        cost: json["cost"].as_f64(),
    })
}

fn parse_status(json: &serde_json::Value) -> Result<RemoteStatus> {
    let status = json["status"]
        .as_str()
        .ok_or_else(|| RagError::request_failed(PROVIDER, "status response has no status"))?;
    Ok(RemoteStatus {
        state: RemoteState::parse(status),
        progress: json["progress"].as_f64(),
        error: json["error"].as_str().map(str::to_string),
    })
}

#[async_trait]
impl ChunkExtractor for HttpExtractor {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    async fn submit(
        &self,
        input: &ExtractionInput,
        options: &ExtractionOptions,
    ) -> Result<Submission> {
        let options_json = serde_json::to_string(options)?;
        // Creating a job is not idempotent, so no transport-level retries;
        // the owning processing job retries instead.
        let response = send_with_retry(PROVIDER, 0, || {
            let file = Part::bytes(input.bytes.clone()).file_name(input.filename.clone());
            let form = Form::new()
                .part("file", file)
                .text("options", options_json.clone());
            self.request(Method::POST, "/documents/process").multipart(form)
        })
        .await?;
        let json = read_json(PROVIDER, response).await?;
        parse_submission(&json)
    }

    async fn poll(&self, job_id: &str) -> Result<RemoteStatus> {
        let json = self.get_json(&format!("/jobs/{}/status", job_id)).await?;
        parse_status(&json)
    }

    async fn fetch_result(&self, job_id: &str) -> Result<Vec<ExtractedChunk>> {
        let json = self.get_json(&format!("/jobs/{}/result", job_id)).await?;
        if !json["chunks"].is_array() {
            return Err(RagError::request_failed(PROVIDER, "result has no chunks array"));
        }
        Ok(parse_chunks(&json["chunks"]))
    }

    async fn retry(&self, job_id: &str) -> Result<()> {
        let path = format!("/jobs/{}/retry", job_id);
        send_with_retry(PROVIDER, 0, || self.request(Method::POST, &path)).await?;
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        let path = format!("/jobs/{}", job_id);
        send_with_retry(PROVIDER, REQUEST_RETRIES, || self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        send_with_retry(PROVIDER, 0, || self.request(Method::GET, "/status")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submission() {
        let json = serde_json::json!({"job_id": "job-1", "document_id": "ext-9", "cost": 0.02});
        assert_eq!(
            parse_submission(&json).unwrap(),
            Submission::Accepted {
                job_id: "job-1".to_string(),
                external_document_id: Some("ext-9".to_string()),
                cost: Some(0.02),
            }
        );
        assert!(parse_submission(&serde_json::json!({"job_id": ""})).is_err());
    }

    #[test]
    fn test_parse_status() {
        let json = serde_json::json!({"status": "in_progress", "progress": 42.5});
        let status = parse_status(&json).unwrap();
        assert_eq!(status.state, RemoteState::InProgress);
        assert_eq!(status.progress, Some(42.5));
        assert_eq!(status.error, None);

        let failed =
            parse_status(&serde_json::json!({"status": "failed", "error": "corrupt"})).unwrap();
        assert_eq!(failed.state, RemoteState::Failed);
        assert_eq!(failed.error.as_deref(), Some("corrupt"));

        assert!(parse_status(&serde_json::json!({"progress": 1})).is_err());
    }

    #[test]
    fn test_new_requires_url() {
        let config = ExtractionConfig::default();
        let err = HttpExtractor::new(&config).err().unwrap();
        assert!(matches!(err, RagError::ConfigurationMissing(_)));
    }
}
