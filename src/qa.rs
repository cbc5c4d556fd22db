//! Question answering over retrieved chunks.
//!
//! A question is answered in three steps: retrieve the best chunks, build a
//! grounded prompt from them, and hand the prompt to the [`AiAnswerer`].
//! When retrieval finds nothing the LLM is never called.
//!
//! # Prompt Format
//!
//! ```text
//! Based on the following context, please answer the question. If the
//! context doesn't contain relevant information, say so.
//!
//! Context:
//! Source: <title>
//! <chunk>
//!
//! Source: <title>
//! <chunk>
//!
//! Question: <question>
//!
//! Answer:
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::answer::{AiAnswerer, StreamEvent, Usage};
use crate::search::{RetrievalEngine, SearchOptions};
use ragline_core::error::{RagError, Result};
use ragline_core::models::{ApiUsageRecord, ScoredChunk};
use ragline_core::scoring::confidence;
use ragline_core::store::Store;

/// Answer returned when no chunk is relevant to the question.
pub const NO_INFORMATION_ANSWER: &str = "I don't have relevant information to answer your question.";

/// A chunk the answer was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub document_id: String,
    pub document_title: String,
    pub chunk_id: String,
    pub similarity_score: f64,
}

impl From<&ScoredChunk> for Source {
    fn from(chunk: &ScoredChunk) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            document_title: chunk.document_title.clone(),
            chunk_id: chunk.chunk_id.clone(),
            similarity_score: chunk.similarity_score,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub answer: String,
    pub sources: Vec<Source>,
    /// Mean similarity of the sources, in `[0, 1]`.
    pub confidence: f64,
    pub usage: Usage,
    /// `None` when no model was called.
    pub model: Option<String>,
}

/// A streamed answer. Sources and confidence are known before the first
/// event arrives.
#[derive(Debug)]
pub struct AnswerStream {
    pub sources: Vec<Source>,
    pub confidence: f64,
    pub events: mpsc::Receiver<StreamEvent>,
}

pub struct QuestionAnswerer {
    engine: Arc<RetrievalEngine>,
    answerer: Arc<dyn AiAnswerer>,
    store: Arc<dyn Store>,
    track_usage: bool,
}

impl QuestionAnswerer {
    pub fn new(
        engine: Arc<RetrievalEngine>,
        answerer: Arc<dyn AiAnswerer>,
        store: Arc<dyn Store>,
        track_usage: bool,
    ) -> Self {
        Self {
            engine,
            answerer,
            store,
            track_usage,
        }
    }

    pub async fn ask(&self, question: &str, options: &SearchOptions) -> Result<AnswerResult> {
        let results = self.retrieve(question, options).await?;
        if results.is_empty() {
            debug!(question, "no relevant chunks, skipping generation");
            return Ok(AnswerResult {
                answer: NO_INFORMATION_ANSWER.to_string(),
                sources: Vec::new(),
                confidence: 0.0,
                usage: Usage::default(),
                model: None,
            });
        }

        let prompt = build_prompt(question.trim(), &build_context(&results));
        let completion = self.answerer.generate(&prompt).await?;
        self.record_usage(&completion.usage).await;

        Ok(AnswerResult {
            answer: completion.content,
            sources: results.iter().map(Source::from).collect(),
            confidence: confidence(&results),
            usage: completion.usage,
            model: Some(completion.model),
        })
    }

    /// Like [`ask`](Self::ask), but the answer text arrives incrementally.
    ///
    /// Provider failures after the stream has started are delivered as a
    /// final [`StreamEvent::Error`]. Dropping the receiver stops generation.
    pub async fn ask_stream(
        &self,
        question: &str,
        options: &SearchOptions,
    ) -> Result<AnswerStream> {
        let results = self.retrieve(question, options).await?;
        let (tx, rx) = mpsc::channel(1);

        if results.is_empty() {
            tokio::spawn(async move {
                let delta = StreamEvent::Delta {
                    content: NO_INFORMATION_ANSWER.to_string(),
                };
                if tx.send(delta).await.is_ok() {
                    let _ = tx
                        .send(StreamEvent::Complete {
                            usage: Usage::default(),
                        })
                        .await;
                }
            });
            return Ok(AnswerStream {
                sources: Vec::new(),
                confidence: 0.0,
                events: rx,
            });
        }

        let prompt = build_prompt(question.trim(), &build_context(&results));
        let answerer = self.answerer.clone();
        tokio::spawn(async move {
            let error_tx = tx.clone();
            if let Err(e) = answerer.stream(&prompt, tx).await {
                warn!(provider = answerer.provider_name(), error = %e, "answer stream failed");
                let _ = error_tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        });

        Ok(AnswerStream {
            sources: results.iter().map(Source::from).collect(),
            confidence: confidence(&results),
            events: rx,
        })
    }

    async fn retrieve(&self, question: &str, options: &SearchOptions) -> Result<Vec<ScoredChunk>> {
        if question.trim().is_empty() {
            return Err(RagError::InvalidInput("question must not be empty".to_string()));
        }
        self.engine.search(question, options).await
    }

    async fn record_usage(&self, usage: &Usage) {
        if !self.track_usage {
            return;
        }
        let mut record = ApiUsageRecord::new(self.answerer.provider_name(), "answer_generation");
        record.tokens_used = Some(usage.total_tokens);
        record.cost_usd = usage.cost_usd;
        if let Err(e) = self.store.record_usage(&record).await {
            warn!(error = %e, "failed to record answer usage");
        }
    }
}

/// Concatenate chunks as `Source: {title}\n{content}` blocks.
pub fn build_context(results: &[ScoredChunk]) -> String {
    let mut context = String::new();
    for r in results {
        context.push_str(&format!("Source: {}\n{}\n\n", r.document_title, r.content));
    }
    context.trim().to_string()
}

pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "Based on the following context, please answer the question. \
         If the context doesn't contain relevant information, say so.\n\n\
         Context:\n{}\n\n\
         Question: {}\n\n\
         Answer:",
        context, question
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(title: &str, content: &str, similarity: f64) -> ScoredChunk {
        ScoredChunk {
            chunk_id: format!("c-{}", title),
            document_id: format!("d-{}", title),
            document_title: title.to_string(),
            content: content.to_string(),
            similarity_score: similarity,
            score: similarity,
        }
    }

    #[test]
    fn test_context_blocks() {
        let results = vec![scored("Guide", "Step one.", 0.9), scored("FAQ", "Answer two.", 0.8)];
        assert_eq!(
            build_context(&results),
            "Source: Guide\nStep one.\n\nSource: FAQ\nAnswer two."
        );
        assert_eq!(build_context(&[]), "");
    }

    #[test]
    fn test_prompt_shape() {
        let prompt = build_prompt("What is X?", "Source: A\nX is a letter.");
        assert!(prompt.starts_with("Based on the following context, please answer the question. If the context doesn't contain relevant information, say so.\n\nContext:\n"));
        assert!(prompt.contains("Source: A\nX is a letter.\n\nQuestion: What is X?\n\nAnswer:"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn test_source_from_scored() {
        let source = Source::from(&scored("Guide", "text", 0.75));
        assert_eq!(source.document_title, "Guide");
        assert_eq!(source.chunk_id, "c-Guide");
        assert_eq!(source.similarity_score, 0.75);
    }
}
