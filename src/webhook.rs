//! Push notifications from the remote processing API.
//!
//! The processing API can report job progress by POSTing a JSON body:
//!
//! ```json
//! { "job_id": "...", "status": "completed", "progress": 100, "chunks": [ ... ] }
//! ```
//!
//! Every body must carry an `X-Webhook-Signature: sha256=<hex hmac>`
//! header computed over the raw bytes with HMAC-SHA256 under the shared
//! secret. Deliveries are refused outright while no secret is configured.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::extractor::{parse_chunks, RemoteState};
use crate::pipeline::{Pipeline, RemoteUpdate, UpdateOutcome};
use ragline_core::error::{RagError, Result};

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const SECRET_ENV: &str = "RAG_WEBHOOK_SECRET";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    /// Inline chunks, usually only on `completed`.
    #[serde(default)]
    pub chunks: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WebhookPayload {
    pub fn into_update(self) -> RemoteUpdate {
        RemoteUpdate {
            state: RemoteState::parse(&self.status),
            progress: self.progress,
            error: self.error,
            chunks: self.chunks.as_ref().map(parse_chunks),
        }
    }
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| RagError::InvalidInput(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time check of a `sha256=<hex>` signature header.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(signature) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Verify and apply one webhook delivery.
///
/// Returns `true` when the update was applied or acknowledged, `false` for
/// unknown jobs and unrecognized statuses.
pub async fn handle_webhook(
    pipeline: &Pipeline,
    secret: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
) -> Result<bool> {
    let Some(secret) = secret else {
        warn!("rejected webhook: no secret configured");
        return Err(RagError::ConfigurationMissing(format!(
            "webhook secret ({})",
            SECRET_ENV
        )));
    };
    let valid = signature
        .map(|s| verify_signature(secret, body, s))
        .unwrap_or(false);
    if !valid {
        warn!(signed = signature.is_some(), "rejected webhook with invalid signature");
        return Err(RagError::InvalidInput("invalid webhook signature".to_string()));
    }
    debug!("webhook signature verified");

    let payload: WebhookPayload = serde_json::from_slice(body)
        .map_err(|e| RagError::InvalidInput(format!("invalid webhook payload: {}", e)))?;
    let job_id = payload.job_id.clone();
    let status = payload.status.clone();

    match pipeline
        .apply_external_update(&job_id, payload.into_update())
        .await?
    {
        None => {
            warn!(external_job_id = %job_id, "webhook for unknown job");
            Ok(false)
        }
        Some(UpdateOutcome::Unrecognized) => Ok(false),
        Some(outcome) => {
            info!(external_job_id = %job_id, status = %status, ?outcome, "webhook applied");
            Ok(true)
        }
    }
}
