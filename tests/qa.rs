mod common;

use std::sync::Arc;

use common::{Harness, HarnessBuilder, ScriptedAnswerer, BREAD_TEXT, RUST_TEXT, SCRIPTED_ANSWER};
use ragline::answer::StreamEvent;
use ragline::qa::{AnswerStream, NO_INFORMATION_ANSWER};
use ragline::search::SearchOptions;
use ragline_core::error::RagError;

async fn seeded(builder: HarnessBuilder) -> Harness {
    let h = builder.build();
    h.ingest_text("Rust notes", RUST_TEXT).await;
    h.ingest_text("Bread notes", BREAD_TEXT).await;
    h.settle().await;
    h
}

async fn collect(mut stream: AnswerStream) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.events.recv().await {
        events.push(event);
    }
    events
}

fn text_of(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Delta { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_ask_without_matches_skips_generation() {
    let h = seeded(HarnessBuilder::new()).await;

    let result = h
        .kb
        .ask("quantum chromodynamics", &SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(result.answer, NO_INFORMATION_ANSWER);
    assert!(result.sources.is_empty());
    assert_eq!(result.confidence, 0.0);
    assert_eq!(result.model, None);
    assert_eq!(result.usage.total_tokens, 0);
    assert!(h.answerer.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_ask_grounds_prompt_in_sources() {
    let h = seeded(HarnessBuilder::new()).await;

    let result = h.kb.ask("  rust  ", &SearchOptions::default()).await.unwrap();

    assert_eq!(result.answer, SCRIPTED_ANSWER);
    assert_eq!(result.model.as_deref(), Some("scripted-llm"));
    assert_eq!(result.usage.total_tokens, 128);
    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].document_title, "Rust notes");
    assert!((result.confidence - 1.0).abs() < 1e-4);

    let prompt = h.answerer.last_prompt().unwrap();
    assert!(prompt.contains(&format!("Context:\nSource: Rust notes\n{}\n\n", RUST_TEXT)));
    assert!(prompt.ends_with("Question: rust\n\nAnswer:"));
    assert!(!prompt.contains("Bread notes"));

    let usage = h.store.usage_records().unwrap();
    let answer_usage: Vec<_> = usage
        .iter()
        .filter(|u| u.operation == "answer_generation")
        .collect();
    assert_eq!(answer_usage.len(), 1);
    assert_eq!(answer_usage[0].provider, "scripted");
    assert_eq!(answer_usage[0].tokens_used, Some(128));
}

#[tokio::test]
async fn test_ask_rejects_blank_question() {
    let h = seeded(HarnessBuilder::new()).await;

    assert!(matches!(
        h.kb.ask(" ", &SearchOptions::default()).await,
        Err(RagError::InvalidInput(_))
    ));
    assert!(matches!(
        h.kb.ask_stream("", &SearchOptions::default()).await,
        Err(RagError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_usage_tracking_can_be_disabled() {
    let h = seeded(HarnessBuilder::new().config("[analytics]\ntrack_usage = false\n")).await;

    h.kb.ask("rust", &SearchOptions::default()).await.unwrap();
    assert!(h.store.usage_records().unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_delivers_answer_then_usage() {
    let h = seeded(HarnessBuilder::new()).await;

    let stream = h.kb.ask_stream("rust", &SearchOptions::default()).await.unwrap();
    assert_eq!(stream.sources.len(), 1);
    assert!((stream.confidence - 1.0).abs() < 1e-4);

    let events = collect(stream).await;
    assert_eq!(text_of(&events), SCRIPTED_ANSWER);
    match events.last() {
        Some(StreamEvent::Complete { usage }) => assert_eq!(usage.total_tokens, 128),
        other => panic!("expected completion, got {:?}", other),
    }
    // Streamed answers are not recorded as usage.
    assert!(!h
        .store
        .usage_records()
        .unwrap()
        .iter()
        .any(|u| u.operation == "answer_generation"));
}

#[tokio::test]
async fn test_stream_without_matches() {
    let h = seeded(HarnessBuilder::new()).await;

    let stream = h
        .kb
        .ask_stream("quantum chromodynamics", &SearchOptions::default())
        .await
        .unwrap();
    assert!(stream.sources.is_empty());
    assert_eq!(stream.confidence, 0.0);

    let events = collect(stream).await;
    assert_eq!(events.len(), 2);
    assert_eq!(text_of(&events), NO_INFORMATION_ANSWER);
    assert!(matches!(events[1], StreamEvent::Complete { .. }));
    assert!(h.answerer.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_failure_ends_with_error_event() {
    let answerer: Arc<ScriptedAnswerer> = ScriptedAnswerer::failing_after(2);
    let h = seeded(HarnessBuilder::new().answerer(answerer)).await;

    let stream = h.kb.ask_stream("rust", &SearchOptions::default()).await.unwrap();
    let events = collect(stream).await;

    assert_eq!(events.len(), 3);
    assert_eq!(text_of(&events), "Rust manages ");
    match &events[2] {
        StreamEvent::Error { message } => assert!(message.contains("stream interrupted")),
        other => panic!("expected error event, got {:?}", other),
    }
}
