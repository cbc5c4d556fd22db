use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::debug;

use super::{AiAnswerer, Completion, SseBuffer, StreamEvent, Usage};
use crate::config::AnswerConfig;
use crate::http::{build_client, classify_transport, env_secret, read_json, send_with_retry};
use ragline_core::error::{RagError, Result};

const PROVIDER: &str = "anthropic";
const DEFAULT_MODEL: &str = "claude-3-sonnet-20240229";
const URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const REQUEST_RETRIES: u32 = 2;

/// Anthropic messages API. Requires `ANTHROPIC_API_KEY`.
pub struct AnthropicAnswerer {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl AnthropicAnswerer {
    pub fn new(config: &AnswerConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(PROVIDER, config.timeout_secs)?,
            api_key: env_secret("ANTHROPIC_API_KEY")?,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
    }

    fn body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": stream,
        })
    }
}

fn parse_message(json: &serde_json::Value, fallback_model: &str) -> Result<Completion> {
    let blocks = json["content"]
        .as_array()
        .ok_or_else(|| RagError::request_failed(PROVIDER, "response has no content blocks"))?;
    let content: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();
    let model = json["model"].as_str().unwrap_or(fallback_model).to_string();
    let usage = Usage::new(
        &model,
        json["usage"]["input_tokens"].as_u64().unwrap_or(0),
        json["usage"]["output_tokens"].as_u64().unwrap_or(0),
    );
    Ok(Completion {
        content,
        model,
        usage,
    })
}

#[async_trait]
impl AiAnswerer for AnthropicAnswerer {
    fn provider_name(&self) -> &str {
        PROVIDER
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<Completion> {
        let body = self.body(prompt, false);
        let response = send_with_retry(PROVIDER, REQUEST_RETRIES, || self.request(&body)).await?;
        let json = read_json(PROVIDER, response).await?;
        parse_message(&json, &self.model)
    }

    async fn stream(&self, prompt: &str, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
        let body = self.body(prompt, true);
        let response = send_with_retry(PROVIDER, 0, || self.request(&body)).await?;

        let mut stream = response.bytes_stream();
        let mut sse = SseBuffer::default();
        let (mut input_tokens, mut output_tokens) = (0u64, 0u64);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_transport(PROVIDER, e))?;
            for data in sse.push(&chunk) {
                let Ok(event) = serde_json::from_str::<serde_json::Value>(&data) else {
                    debug!(line = %data, "skipping malformed stream line");
                    continue;
                };
                match event["type"].as_str() {
                    Some("message_start") => {
                        input_tokens = event["message"]["usage"]["input_tokens"]
                            .as_u64()
                            .unwrap_or(0);
                    }
                    Some("content_block_delta") => {
                        if let Some(text) = event["delta"]["text"].as_str() {
                            let delta = StreamEvent::Delta {
                                content: text.to_string(),
                            };
                            if tx.send(delta).await.is_err() {
                                debug!("answer stream receiver dropped");
                                return Ok(());
                            }
                        }
                    }
                    Some("message_delta") => {
                        output_tokens = event["usage"]["output_tokens"]
                            .as_u64()
                            .unwrap_or(output_tokens);
                    }
                    Some("message_stop") => {
                        let usage = Usage::new(&self.model, input_tokens, output_tokens);
                        let _ = tx.send(StreamEvent::Complete { usage }).await;
                        return Ok(());
                    }
                    Some("error") => {
                        return Err(RagError::request_failed(
                            PROVIDER,
                            event["error"]["message"].as_str().unwrap_or("stream error"),
                        ));
                    }
                    _ => {}
                }
            }
        }

        let usage = Usage::new(&self.model, input_tokens, output_tokens);
        let _ = tx.send(StreamEvent::Complete { usage }).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_joins_text_blocks() {
        let json = serde_json::json!({
            "model": "claude-3-sonnet-20240229",
            "content": [{"type": "text", "text": "Hello "}, {"type": "text", "text": "there."}],
            "usage": {"input_tokens": 1000, "output_tokens": 1000}
        });
        let completion = parse_message(&json, DEFAULT_MODEL).unwrap();
        assert_eq!(completion.content, "Hello there.");
        assert!((completion.usage.cost_usd.unwrap() - 0.018).abs() < 1e-12);
    }

    #[test]
    fn test_parse_message_error_shape() {
        let json = serde_json::json!({"type": "error", "error": {"message": "overloaded"}});
        assert!(parse_message(&json, DEFAULT_MODEL).is_err());
    }
}
