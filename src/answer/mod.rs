//! LLM answer backends.
//!
//! [`AiAnswerer`] turns a fully built prompt into text, either in one
//! response ([`AiAnswerer::generate`]) or as a stream of [`StreamEvent`]s
//! pushed into a bounded channel ([`AiAnswerer::stream`]).
//!
//! Streaming is pull-driven by the consumer: the channel holds at most one
//! in-flight event, and a dropped receiver makes the next send fail, at
//! which point the backend returns and the HTTP response is dropped.

mod anthropic;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

pub use anthropic::AnthropicAnswerer;
pub use openai::OpenAIAnswerer;

use crate::config::AnswerConfig;
use ragline_core::error::{RagError, Result};

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: Option<f64>,
}

impl Usage {
    pub fn new(model: &str, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost_usd: calculate_cost(model, input_tokens, output_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: Usage,
}

/// One event of a streamed answer. `Complete` or `Error` is always last.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta { content: String },
    Complete { usage: Usage },
    Error { message: String },
}

#[async_trait]
pub trait AiAnswerer: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<Completion>;

    /// Stream the answer into `tx`, ending with [`StreamEvent::Complete`].
    ///
    /// Returns `Ok(())` early when the receiver is dropped. Errors are
    /// returned, not sent; the caller decides how to surface them.
    async fn stream(&self, prompt: &str, tx: mpsc::Sender<StreamEvent>) -> Result<()>;
}

/// Build the configured answer backend.
pub fn create_answerer(config: &AnswerConfig) -> Result<Arc<dyn AiAnswerer>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIAnswerer::new(config)?)),
        "anthropic" => Ok(Arc::new(AnthropicAnswerer::new(config)?)),
        other => Err(RagError::ConfigurationMissing(format!(
            "unknown answer provider: {}",
            other
        ))),
    }
}

/// USD per 1k tokens as `(input, output)`.
fn rates_per_1k(model: &str) -> Option<(f64, f64)> {
    let rates = if model.contains("gpt-4") {
        (0.03, 0.06)
    } else if model.contains("gpt-3.5") {
        (0.0015, 0.002)
    } else if model.contains("claude-3-opus") {
        (0.015, 0.075)
    } else if model.contains("claude-3-sonnet") || model.contains("claude-3-5-sonnet") {
        (0.003, 0.015)
    } else if model.contains("claude-3-haiku") {
        (0.00025, 0.00125)
    } else if model.contains("claude-2") {
        (0.008, 0.024)
    } else {
        return None;
    };
    Some(rates)
}

/// Estimated USD cost of a call, `None` for unpriced models.
pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
    rates_per_1k(model).map(|(input, output)| {
        input_tokens as f64 / 1000.0 * input + output_tokens as f64 / 1000.0 * output
    })
}

/// Line buffer for server-sent events.
///
/// Bytes arrive in arbitrary network chunks, possibly splitting a UTF-8
/// sequence; only complete `data:` lines are decoded and returned.
#[derive(Default)]
struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}
