use chrono::{Duration, Utc};
use tempfile::TempDir;

use ragline::config::parse_config;
use ragline::pipeline::IngestRequest;
use ragline::search::SearchOptions;
use ragline::service::KnowledgeBase;
use ragline::sqlite_store::SqliteStore;
use ragline::{db, migrate};
use ragline_core::chunk::sha256_hex;
use ragline_core::models::{
    ApiUsageRecord, Chunk, Document, DocumentStatus, JobKind, JobStatus, Metadata, ProcessingJob,
    SearchMode, SearchQueryRecord, SourceKind,
};
use ragline_core::queue::{TaskPayload, TaskQueue};
use ragline_core::store::Store;

async fn open_store() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("data/rag.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    // Migrations are idempotent.
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, SqliteStore::new(pool))
}

fn document(title: &str, body: &str) -> Document {
    let mut metadata = Metadata::new();
    metadata.insert("team".to_string(), "platform".to_string());
    Document::new(
        title,
        SourceKind::Text,
        sha256_hex(body.as_bytes()),
        body.len() as u64,
        "text/plain",
        metadata,
    )
}

#[tokio::test]
async fn test_documents_round_trip_and_dedup() {
    let (_tmp, store) = open_store().await;

    let doc = document("Runbook", "restart the service");
    let stored = store.insert_document(&doc).await.unwrap();
    assert_eq!(stored.id, doc.id);
    assert_eq!(stored.metadata.get("team").map(String::as_str), Some("platform"));
    assert_eq!(stored.status, DocumentStatus::Pending);

    let mut twin = document("Other title", "restart the service");
    twin.id = "another-id".to_string();
    let existing = store.insert_document(&twin).await.unwrap();
    assert_eq!(existing.id, doc.id);
    assert_eq!(store.list_documents().await.unwrap().len(), 1);

    let mut updated = stored.clone();
    updated.transition(DocumentStatus::Processing).unwrap();
    updated.external_job_id = Some("ext-9".to_string());
    store.update_document(&updated).await.unwrap();
    let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, DocumentStatus::Processing);
    assert_eq!(loaded.external_job_id.as_deref(), Some("ext-9"));
    assert!(loaded.processing_started_at.is_some());

    let mut ghost = document("Ghost", "nobody");
    ghost.id = "ghost".to_string();
    assert!(store.update_document(&ghost).await.is_err());
}

#[tokio::test]
async fn test_chunks_sync_state_and_keyword_search() {
    let (_tmp, store) = open_store().await;
    let doc = store
        .insert_document(&document("Deploy guide", "deploy body"))
        .await
        .unwrap();

    let chunks = vec![
        Chunk::new(&doc.id, 0, "Deploy the service with kubectl apply."),
        Chunk::new(&doc.id, 1, "Roll back with kubectl rollout undo."),
        Chunk::new(&doc.id, 2, "Ask the platform team for access."),
    ];
    store.replace_chunks(&doc.id, &chunks).await.unwrap();

    let listed = store.list_chunks(&doc.id).await.unwrap();
    let indexes: Vec<i64> = listed.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);

    let mut synced = listed[1].clone();
    synced.record_embedding("text-embedding-ada-002", 1536);
    let vector_id = synced.expected_vector_id();
    synced.mark_synced(vector_id.clone());
    store.update_chunk(&synced).await.unwrap();

    let counts = store.count_chunks(&doc.id).await.unwrap();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.synced, 1);
    let unsynced: Vec<i64> = store
        .unsynced_chunks(&doc.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.chunk_index)
        .collect();
    assert_eq!(unsynced, vec![0, 2]);
    let reloaded = store.get_chunk(&synced.id).await.unwrap().unwrap();
    assert_eq!(reloaded.vector_id.as_deref(), Some(vector_id.as_str()));
    assert_eq!(reloaded.embedding_dimensions, Some(1536));

    // A chunk whose hash no longer matches its content is rejected.
    let mut tampered = listed[0].clone();
    tampered.content.push_str(" edited");
    assert!(store.update_chunk(&tampered).await.is_err());

    let hits = store.keyword_search("kubectl", 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.document_title == "Deploy guide"));
    assert!(store.keyword_search("?!", 10).await.unwrap().is_empty());
    assert_eq!(store.keyword_search("platform kubectl", 1).await.unwrap().len(), 1);

    // Replacing purges the old rows from the full-text index too.
    store.replace_chunks(&doc.id, &[]).await.unwrap();
    assert!(store.keyword_search("kubectl", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_jobs_and_cascading_delete() {
    let (_tmp, store) = open_store().await;
    let doc = store
        .insert_document(&document("Report", "quarterly numbers"))
        .await
        .unwrap();
    store
        .replace_chunks(&doc.id, &[Chunk::new(&doc.id, 0, "Revenue grew.")])
        .await
        .unwrap();

    let mut job = ProcessingJob::new(JobKind::DocumentProcessing, Some(&doc.id), "external", 3);
    store.insert_job(&job).await.unwrap();
    job.mark_started().unwrap();
    job.external_job_id = Some("ext-42".to_string());
    job.update_progress(35.0);
    store.update_job(&job).await.unwrap();

    let found = store.find_job_by_external_id("ext-42").await.unwrap().unwrap();
    assert_eq!(found.id, job.id);
    assert_eq!(found.status, JobStatus::Processing);
    assert_eq!(found.progress, 35.0);
    assert_eq!(found.max_retries, 3);
    assert_eq!(store.jobs_for_document(&doc.id).await.unwrap().len(), 1);

    assert!(store.delete_document(&doc.id).await.unwrap());
    assert!(store.get_document(&doc.id).await.unwrap().is_none());
    assert!(store.list_chunks(&doc.id).await.unwrap().is_empty());
    assert!(store.get_job(&job.id).await.unwrap().is_none());
    assert!(store.keyword_search("revenue", 10).await.unwrap().is_empty());
    assert!(!store.delete_document(&doc.id).await.unwrap());
}

#[tokio::test]
async fn test_stats_count_analytics() {
    let (_tmp, store) = open_store().await;
    let doc = store
        .insert_document(&document("Notes", "some notes"))
        .await
        .unwrap();
    store
        .replace_chunks(&doc.id, &[Chunk::new(&doc.id, 0, "Some notes.")])
        .await
        .unwrap();

    store
        .record_search(&SearchQueryRecord {
            id: "q1".to_string(),
            query_text: "notes".to_string(),
            mode: SearchMode::Hybrid,
            result_count: 1,
            latency_ms: 4,
            similarity_scores: vec![0.9],
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let mut usage = ApiUsageRecord::new("openai", "embedding");
    usage.tokens_used = Some(3);
    usage.cost_usd = Some(0.25);
    store.record_usage(&usage).await.unwrap();
    store
        .record_usage(&ApiUsageRecord::new("local", "document_processing"))
        .await
        .unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.documents_by_status.get("pending"), Some(&1));
    assert_eq!(stats.total_chunks, 1);
    assert_eq!(stats.synced_chunks, 0);
    assert_eq!(stats.search_queries, 1);
    assert_eq!(stats.api_calls, 2);
    assert!((stats.total_cost_usd - 0.25).abs() < 1e-9);
}

#[tokio::test]
async fn test_prune_old_analytics_and_failed_jobs() {
    let (_tmp, store) = open_store().await;
    let doc = store
        .insert_document(&document("Notes", "old notes"))
        .await
        .unwrap();
    store
        .replace_chunks(&doc.id, &[Chunk::new(&doc.id, 0, "Old notes.")])
        .await
        .unwrap();
    let cutoff = Utc::now() - Duration::days(90);
    let old = cutoff - Duration::days(1);

    for (id, at) in [("q-old", old), ("q-new", Utc::now())] {
        store
            .record_search(&SearchQueryRecord {
                id: id.to_string(),
                query_text: "notes".to_string(),
                mode: SearchMode::Keyword,
                result_count: 0,
                latency_ms: 2,
                similarity_scores: Vec::new(),
                created_at: at,
            })
            .await
            .unwrap();
    }
    let mut usage = ApiUsageRecord::new("openai", "embedding");
    usage.created_at = old;
    store.record_usage(&usage).await.unwrap();

    let mut failed = ProcessingJob::new(JobKind::EmbeddingGeneration, Some(&doc.id), "openai", 0);
    failed.created_at = old;
    failed.mark_started().unwrap();
    failed.mark_failed("401 unauthorized").unwrap();
    store.insert_job(&failed).await.unwrap();
    let mut recent = ProcessingJob::new(JobKind::EmbeddingGeneration, Some(&doc.id), "openai", 0);
    recent.mark_started().unwrap();
    recent.mark_failed("401 unauthorized").unwrap();
    store.insert_job(&recent).await.unwrap();

    let counts = store.prune(cutoff).await.unwrap();
    assert_eq!(counts.search_queries, 1);
    assert_eq!(counts.api_usage, 1);
    assert_eq!(counts.failed_jobs, 1);
    assert!(store.get_job(&failed.id).await.unwrap().is_none());
    assert_eq!(store.get_job(&recent.id).await.unwrap().unwrap().status, JobStatus::Failed);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.search_queries, 1);
    assert_eq!(stats.api_calls, 0);
    assert_eq!(stats.total_chunks, 1);

    store.optimize_search().await.unwrap();
    assert_eq!(store.keyword_search("notes", 10).await.unwrap().len(), 1);
    assert_eq!(store.prune(cutoff).await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_task_queue_leases() {
    let (_tmp, store) = open_store().await;
    let now = Utc::now();
    let lease = Duration::minutes(10);

    let due = store
        .enqueue(
            TaskPayload::ProcessDocument {
                document_id: "d1".to_string(),
                job_id: "j1".to_string(),
            },
            now,
        )
        .await
        .unwrap();
    store
        .enqueue(
            TaskPayload::SyncVector {
                chunk_id: "c1".to_string(),
                job_id: "j2".to_string(),
                chunk_hash: "h".to_string(),
                embedding: vec![0.25, -1.0],
            },
            now + Duration::seconds(30),
        )
        .await
        .unwrap();
    assert_eq!(store.pending().await.unwrap(), 2);
    assert_eq!(
        store.next_run_at().await.unwrap().map(|t| t.timestamp_millis()),
        Some(now.timestamp_millis())
    );

    let claimed = store.claim_due(now, 10, lease).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, due);
    assert_eq!(claimed[0].attempts, 1);
    assert_eq!(claimed[0].payload.kind(), "process_document");

    // Leased tasks are invisible until the lease runs out.
    let later = now + Duration::seconds(60);
    let claimed = store.claim_due(later, 10, lease).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(
        claimed[0].payload,
        TaskPayload::SyncVector {
            chunk_id: "c1".to_string(),
            job_id: "j2".to_string(),
            chunk_hash: "h".to_string(),
            embedding: vec![0.25, -1.0],
        }
    );

    let expired = store
        .claim_due(now + lease + Duration::seconds(1), 10, lease)
        .await
        .unwrap();
    let redelivered = expired.iter().find(|t| t.id == due).unwrap();
    assert_eq!(redelivered.attempts, 2);

    store.ack(&due).await.unwrap();
    assert_eq!(store.pending().await.unwrap(), 1);
    TaskQueue::clear(&store).await.unwrap();
    assert_eq!(store.pending().await.unwrap(), 0);
    assert_eq!(store.next_run_at().await.unwrap(), None);
}

#[tokio::test]
async fn test_knowledge_base_on_sqlite() {
    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        "[db]\npath = \"{root}/data/rag.sqlite\"\n\n[storage]\npath = \"{root}/blobs\"\n",
        root = tmp.path().display()
    ))
    .unwrap();
    let kb = KnowledgeBase::open(config).await.unwrap();

    let doc = kb
        .ingest(IngestRequest::file(
            "Onboarding",
            "onboarding.md",
            b"# Onboarding\n\nRequest a laptop from IT. Join the deploy channel on day one.".to_vec(),
        ))
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert!(tmp
        .path()
        .join("blobs")
        .join(format!("{}/source.md", doc.id))
        .exists());

    let status = kb.get_status(&doc.id).await.unwrap();
    assert_eq!(status.total_chunks, 1);
    assert_eq!(status.jobs.len(), 1);

    let results = kb.search("laptop", &SearchOptions::default()).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].document_title, "Onboarding");

    assert!(kb.delete(&doc.id).await.unwrap());
    assert!(!tmp
        .path()
        .join("blobs")
        .join(format!("{}/source.md", doc.id))
        .exists());
    assert!(kb.search("laptop", &SearchOptions::default()).await.unwrap().is_empty());
}
