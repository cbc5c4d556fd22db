//! Shared HTTP plumbing for remote providers.
//!
//! Every provider (embeddings, vector databases, answer models, the
//! external extractor) goes through [`send_with_retry`] so that status
//! codes map onto [`RagError`] the same way everywhere:
//!
//! - 401 / 403 → [`RagError::ProviderAuthFailed`]
//! - 429 → [`RagError::RateLimitExceeded`] (honouring `Retry-After`)
//! - other non-2xx → [`RagError::ProviderRequestFailed`]
//! - network errors and timeouts → [`RagError::ProviderRequestFailed`]
//!
//! 429, 5xx and network errors are retried with exponential backoff
//! (1s, 2s, 4s, ... capped at 2^5); other failures return immediately.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use ragline_core::error::{RagError, Result};

pub fn build_client(provider: &str, timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::request_failed(provider, e))
}

/// Read a required secret from the environment.
pub fn env_secret(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(RagError::ConfigurationMissing(format!(
            "{} environment variable not set",
            name
        ))),
    }
}

/// Map a non-success HTTP status to an error.
pub fn classify_status(
    provider: &str,
    status: StatusCode,
    body: &str,
    retry_after_secs: Option<u64>,
) -> RagError {
    match status.as_u16() {
        401 | 403 => RagError::ProviderAuthFailed {
            provider: provider.to_string(),
            message: format!("{}: {}", status, body),
        },
        429 => RagError::RateLimitExceeded {
            provider: provider.to_string(),
            retry_after_secs,
        },
        _ => RagError::request_failed(provider, format!("API error {}: {}", status, body)),
    }
}

pub fn classify_transport(provider: &str, err: reqwest::Error) -> RagError {
    if err.is_timeout() {
        RagError::request_failed(provider, format!("request timed out: {}", err))
    } else {
        RagError::request_failed(provider, err)
    }
}

fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Convert a non-success response into an error, consuming the body.
pub async fn error_for_response(provider: &str, response: Response) -> RagError {
    let status = response.status();
    let wait = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    classify_status(provider, status, &body, wait)
}

/// Send the request built by `build`, retrying transient failures.
///
/// `build` is called once per attempt since a `RequestBuilder` is consumed
/// by sending. Returns the first successful response.
pub async fn send_with_retry<F>(provider: &str, max_retries: u32, build: F) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let mut delay = Duration::from_secs(1 << (attempt - 1).min(5));
            if let Some(RagError::RateLimitExceeded {
                retry_after_secs: Some(secs),
                ..
            }) = &last_err
            {
                delay = delay.max(Duration::from_secs((*secs).min(60)));
            }
            debug!(provider, attempt, delay_secs = delay.as_secs(), "retrying request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let err = error_for_response(provider, response).await;
                // Rate limited or server error: retry
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    warn!(provider, %status, "transient provider error");
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(classify_transport(provider, e));
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| RagError::request_failed(provider, "request failed after retries")))
}

/// Decode a JSON body, mapping decode failures to a provider error.
pub async fn read_json(provider: &str, response: Response) -> Result<serde_json::Value> {
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| RagError::request_failed(provider, format!("invalid response body: {}", e)))
}
