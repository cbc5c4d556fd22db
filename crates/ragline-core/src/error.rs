//! Error taxonomy shared by every ragline component.
//!
//! Variants map one-to-one onto the failure classes the pipeline reacts to:
//! input errors are rejected synchronously, transient provider errors are
//! retried by the owning job, and everything else is surfaced on the
//! document, chunk or processing job it happened to.

use thiserror::Error;

/// Main error type for ragline operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RagError {
    /// Bad title, disallowed file type or size, empty question or query.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A credential or setting required by the selected provider is absent.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Transient remote failure (network, 5xx, timeout, malformed response).
    #[error("{provider} request failed: {message}")]
    ProviderRequestFailed { provider: String, message: String },

    #[error("{provider} rejected credentials: {message}")]
    ProviderAuthFailed { provider: String, message: String },

    #[error("{provider} rate limit exceeded")]
    RateLimitExceeded {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    #[error("search failed: {0}")]
    SearchFailed(String),

    #[error("document processing failed: {0}")]
    DocumentProcessingFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("vector database error: {0}")]
    VectorDatabaseError(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A state machine was asked to make a move it does not allow.
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Relational store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl RagError {
    pub fn request_failed(provider: impl Into<String>, message: impl ToString) -> Self {
        RagError::ProviderRequestFailed {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    pub fn storage(err: impl ToString) -> Self {
        RagError::Storage(err.to_string())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RagError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the owning job should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::ProviderRequestFailed { .. }
                | RagError::RateLimitExceeded { .. }
                | RagError::VectorDatabaseError(_)
                | RagError::DocumentProcessingFailed(_)
                | RagError::Storage(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RagError::RateLimitExceeded { .. })
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        RagError::Storage(format!("serialization: {err}"))
    }
}

/// Result type alias for ragline operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_display() {
        let err = RagError::InvalidInput("title must not be empty".to_string());
        assert_eq!(err.to_string(), "invalid input: title must not be empty");
    }

    #[test]
    fn test_provider_request_failed_display() {
        let err = RagError::request_failed("openai", "HTTP 502: bad gateway");
        assert_eq!(err.to_string(), "openai request failed: HTTP 502: bad gateway");
    }

    #[test]
    fn test_not_found_display() {
        let err = RagError::not_found("document", "abc");
        assert_eq!(err.to_string(), "document not found: abc");
    }

    #[test]
    fn test_transition_display() {
        let err = RagError::InvalidTransition {
            entity: "job",
            from: "completed".to_string(),
            to: "processing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid job transition: completed -> processing"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RagError::request_failed("qdrant", "timeout").is_retryable());
        assert!(RagError::RateLimitExceeded {
            provider: "openai".into(),
            retry_after_secs: Some(10)
        }
        .is_retryable());
        assert!(RagError::VectorDatabaseError("down".into()).is_retryable());
        assert!(RagError::Storage("locked".into()).is_retryable());

        assert!(!RagError::InvalidInput("x".into()).is_retryable());
        assert!(!RagError::ConfigurationMissing("OPENAI_API_KEY".into()).is_retryable());
        assert!(!RagError::ProviderAuthFailed {
            provider: "openai".into(),
            message: "401".into()
        }
        .is_retryable());
        assert!(!RagError::EmbeddingFailed("empty text".into()).is_retryable());
        assert!(!RagError::not_found("chunk", "c1").is_retryable());
    }

    #[test]
    fn test_rate_limited() {
        let err = RagError::RateLimitExceeded {
            provider: "cohere".into(),
            retry_after_secs: None,
        };
        assert!(err.is_rate_limited());
        assert!(!RagError::request_failed("cohere", "boom").is_rate_limited());
    }
}
