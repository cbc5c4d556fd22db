mod common;

use common::{Harness, HarnessBuilder, BREAD_TEXT, PYTHON_TEXT, RUST_TEXT};
use ragline::search::SearchOptions;
use ragline_core::error::RagError;
use ragline_core::models::{ScoredChunk, SearchMode};
use ragline_core::store::Store;

const MIXED_TEXT: &str = "Rust and Python work together.";

async fn seeded(builder: HarnessBuilder) -> Harness {
    let h = builder.build();
    h.ingest_text("Rust notes", RUST_TEXT).await;
    h.ingest_text("Python notes", PYTHON_TEXT).await;
    h.ingest_text("Bread notes", BREAD_TEXT).await;
    h.ingest_text("Interop notes", MIXED_TEXT).await;
    h.settle().await;
    h
}

fn mode(mode: SearchMode) -> SearchOptions {
    SearchOptions {
        mode: Some(mode),
        ..Default::default()
    }
}

fn titles(results: &[ScoredChunk]) -> Vec<&str> {
    results.iter().map(|r| r.document_title.as_str()).collect()
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-4
}

#[tokio::test]
async fn test_vector_search_applies_threshold() {
    let h = seeded(HarnessBuilder::new()).await;

    let results = h.kb.search("rust", &mode(SearchMode::Vector)).await.unwrap();
    assert_eq!(titles(&results), vec!["Rust notes", "Interop notes"]);
    assert!(approx(results[0].similarity_score, 1.0));
    assert!(approx(results[1].similarity_score, std::f64::consts::FRAC_1_SQRT_2));
    assert_eq!(results[0].score, results[0].similarity_score);
    assert_eq!(results[0].content, RUST_TEXT);

    let strict = SearchOptions {
        threshold: Some(0.8),
        ..mode(SearchMode::Vector)
    };
    let results = h.kb.search("rust", &strict).await.unwrap();
    assert_eq!(titles(&results), vec!["Rust notes"]);
}

#[tokio::test]
async fn test_keyword_search_uses_fixed_score() {
    let h = seeded(HarnessBuilder::new()).await;

    let results = h.kb.search("bread", &mode(SearchMode::Keyword)).await.unwrap();
    assert_eq!(titles(&results), vec!["Bread notes"]);
    assert_eq!(results[0].score, 0.5);
    assert_eq!(results[0].similarity_score, 0.5);
}

#[tokio::test]
async fn test_hybrid_merges_both_paths() {
    let h = seeded(HarnessBuilder::new()).await;

    // Default mode is hybrid. "sourdough" only matches by keyword.
    let results = h
        .kb
        .search("sourdough rust", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(
        titles(&results),
        vec!["Rust notes", "Interop notes", "Bread notes"]
    );
    assert!(approx(results[0].score, 0.8 + 0.1));
    assert!(approx(
        results[1].score,
        0.8 * std::f64::consts::FRAC_1_SQRT_2 + 0.1
    ));
    assert!(approx(results[2].score, 0.1));
    assert!(approx(results[2].similarity_score, 0.5));
}

#[tokio::test]
async fn test_limit_caps_results() {
    let h = seeded(HarnessBuilder::new()).await;

    let results = h
        .kb
        .search("sourdough rust", &SearchOptions::with_limit(1))
        .await
        .unwrap();
    assert_eq!(titles(&results), vec!["Rust notes"]);
}

#[tokio::test]
async fn test_vector_failure_falls_back_to_keyword() {
    let h = seeded(HarnessBuilder::new()).await;
    h.index.fail_queries(1);

    let results = h.kb.search("python", &mode(SearchMode::Vector)).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.score == 0.5));

    let records = h.store.search_records().unwrap();
    assert_eq!(records.last().unwrap().mode, SearchMode::Keyword);
}

#[tokio::test]
async fn test_hybrid_vector_failure_keeps_keyword_hits() {
    let h = seeded(HarnessBuilder::new()).await;
    h.index.fail_queries(1);

    let results = h.kb.search("bread", &SearchOptions::default()).await.unwrap();
    assert_eq!(titles(&results), vec!["Bread notes"]);
    assert_eq!(results[0].score, 0.5);
}

#[tokio::test]
async fn test_vector_failure_without_fallback_errors() {
    let h = seeded(HarnessBuilder::new().config("[search]\nfallback_to_keyword = false\n")).await;
    h.index.fail_queries(2);

    let vector = h.kb.search("python", &mode(SearchMode::Vector)).await;
    assert!(matches!(vector, Err(RagError::SearchFailed(_))));

    let hybrid = h.kb.search("python", &SearchOptions::default()).await;
    assert!(matches!(hybrid, Err(RagError::SearchFailed(_))));

    let records = h.store.search_records().unwrap();
    let modes: Vec<SearchMode> = records.iter().map(|r| r.mode).collect();
    assert_eq!(modes, vec![SearchMode::Vector, SearchMode::Hybrid]);
    assert!(records.iter().all(|r| r.result_count == 0 && r.query_text == "python"));
}

#[tokio::test]
async fn test_recording_failure_does_not_fail_search() {
    let h = seeded(HarnessBuilder::new()).await;
    h.faults.fail_search_records(1);

    let results = h.kb.search("bread", &mode(SearchMode::Keyword)).await.unwrap();
    assert_eq!(titles(&results), vec!["Bread notes"]);
    assert!(h.store.search_records().unwrap().is_empty());

    h.kb.search("bread", &mode(SearchMode::Keyword)).await.unwrap();
    assert_eq!(h.store.search_records().unwrap().len(), 1);
}

#[tokio::test]
async fn test_no_embedder_uses_keyword_search() {
    let h = seeded(HarnessBuilder::new().without_embeddings()).await;

    let results = h.kb.search("rust", &mode(SearchMode::Vector)).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.score == 0.5));

    let strict = seeded(
        HarnessBuilder::new()
            .without_embeddings()
            .config("[search]\nfallback_to_keyword = false\n"),
    )
    .await;
    assert!(matches!(
        strict.kb.search("rust", &SearchOptions::default()).await,
        Err(RagError::SearchFailed(_))
    ));
    assert_eq!(
        strict.kb.search("rust", &mode(SearchMode::Keyword)).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_blank_query_is_not_recorded() {
    let h = seeded(HarnessBuilder::new()).await;

    assert!(h.kb.search("   ", &SearchOptions::default()).await.unwrap().is_empty());
    assert!(h.store.search_records().unwrap().is_empty());

    let results = h.kb.search("rust", &mode(SearchMode::Vector)).await.unwrap();
    let records = h.store.search_records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].query_text, "rust");
    assert_eq!(records[0].mode, SearchMode::Vector);
    assert_eq!(records[0].result_count, results.len());
    assert_eq!(records[0].similarity_scores.len(), results.len());
}

#[tokio::test]
async fn test_search_tracking_can_be_disabled() {
    let h = seeded(HarnessBuilder::new().config("[analytics]\ntrack_searches = false\n")).await;

    h.kb.search("rust", &SearchOptions::default()).await.unwrap();
    assert!(h.store.search_records().unwrap().is_empty());
}

#[tokio::test]
async fn test_vectors_without_chunks_are_skipped() {
    let h = seeded(HarnessBuilder::new()).await;
    let rust = h
        .kb
        .list_documents(None)
        .await
        .unwrap()
        .into_iter()
        .find(|d| d.title == "Rust notes")
        .unwrap();
    // Drop the chunk rows but leave the vector behind.
    h.store.replace_chunks(&rust.id, &[]).await.unwrap();
    assert_eq!(h.index.ids().len(), 4);

    let results = h.kb.search("rust", &mode(SearchMode::Vector)).await.unwrap();
    assert_eq!(titles(&results), vec!["Interop notes"]);
}
