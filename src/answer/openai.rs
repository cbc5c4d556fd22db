use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::debug;

use super::{AiAnswerer, Completion, SseBuffer, StreamEvent, Usage};
use crate::config::AnswerConfig;
use crate::http::{build_client, classify_transport, env_secret, read_json, send_with_retry};
use ragline_core::error::{RagError, Result};

const PROVIDER: &str = "openai";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const URL: &str = "https://api.openai.com/v1/chat/completions";
const REQUEST_RETRIES: u32 = 2;

/// OpenAI chat completions. Requires `OPENAI_API_KEY`.
pub struct OpenAIAnswerer {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAIAnswerer {
    pub fn new(config: &AnswerConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(PROVIDER, config.timeout_secs)?,
            api_key: env_secret("OPENAI_API_KEY")?,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }
}

fn parse_completion(json: &serde_json::Value, fallback_model: &str) -> Result<Completion> {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| RagError::request_failed(PROVIDER, "response has no message content"))?
        .to_string();
    let model = json["model"].as_str().unwrap_or(fallback_model).to_string();
    let usage = Usage::new(
        &model,
        json["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    );
    Ok(Completion {
        content,
        model,
        usage,
    })
}

#[async_trait]
impl AiAnswerer for OpenAIAnswerer {
    fn provider_name(&self) -> &str {
        PROVIDER
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<Completion> {
        let body = self.body(prompt, false);
        let response = send_with_retry(PROVIDER, REQUEST_RETRIES, || {
            self.client.post(URL).bearer_auth(&self.api_key).json(&body)
        })
        .await?;
        let json = read_json(PROVIDER, response).await?;
        parse_completion(&json, &self.model)
    }

    async fn stream(&self, prompt: &str, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
        let body = self.body(prompt, true);
        let response = send_with_retry(PROVIDER, 0, || {
            self.client.post(URL).bearer_auth(&self.api_key).json(&body)
        })
        .await?;

        let mut stream = response.bytes_stream();
        let mut sse = SseBuffer::default();
        let (mut input_tokens, mut output_tokens) = (0u64, 0u64);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_transport(PROVIDER, e))?;
            for data in sse.push(&chunk) {
                if data == "[DONE]" {
                    let usage = Usage::new(&self.model, input_tokens, output_tokens);
                    let _ = tx.send(StreamEvent::Complete { usage }).await;
                    return Ok(());
                }
                let Ok(event) = serde_json::from_str::<serde_json::Value>(&data) else {
                    debug!(line = %data, "skipping malformed stream line");
                    continue;
                };
                if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
                    input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(input_tokens);
                    output_tokens = usage["completion_tokens"].as_u64().unwrap_or(output_tokens);
                }
                if let Some(content) = event["choices"][0]["delta"]["content"].as_str() {
                    if content.is_empty() {
                        continue;
                    }
                    let delta = StreamEvent::Delta {
                        content: content.to_string(),
                    };
                    if tx.send(delta).await.is_err() {
                        debug!("answer stream receiver dropped");
                        return Ok(());
                    }
                }
            }
        }

        // Connection ended without [DONE]
        let usage = Usage::new(&self.model, input_tokens, output_tokens);
        let _ = tx.send(StreamEvent::Complete { usage }).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "model": "gpt-4-0613",
            "choices": [{"message": {"role": "assistant", "content": "Paris."}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 1000, "total_tokens": 2000}
        });
        let completion = parse_completion(&json, "gpt-4").unwrap();
        assert_eq!(completion.content, "Paris.");
        assert_eq!(completion.usage.total_tokens, 2000);
        assert!((completion.usage.cost_usd.unwrap() - 0.09).abs() < 1e-12);
    }

    #[test]
    fn test_parse_completion_without_content() {
        let json = serde_json::json!({"choices": []});
        assert!(parse_completion(&json, "gpt-4").is_err());
    }
}
