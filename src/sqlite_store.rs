//! SQLite-backed [`Store`] and [`TaskQueue`] implementation.
//!
//! Maps each trait operation onto the schema created by
//! [`run_migrations`](crate::migrate::run_migrations). Timestamps are stored
//! as Unix milliseconds; metadata, keywords and task payloads as JSON text.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use ragline_core::error::{RagError, Result};
use ragline_core::models::{
    ApiUsageRecord, Chunk, Document, DocumentStatus, JobKind, JobStatus, Metadata, ProcessingJob,
    SearchQueryRecord, SourceKind,
};
use ragline_core::queue::{Task, TaskPayload, TaskQueue};
use ragline_core::scoring::Candidate;
use ragline_core::store::{query_terms, ChunkCounts, PruneCounts, Store, StoreStats};

/// SQLite implementation of the [`Store`] and [`TaskQueue`] traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> RagError {
    RagError::storage(e)
}

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn opt_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_ms)
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

fn bad_column(column: &str, value: &str) -> RagError {
    RagError::storage(format!("unexpected value '{}' in column {}", value, column))
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let source_kind: String = row.get("source_kind");
    let status: String = row.get("status");
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json)?;
    let byte_size: i64 = row.get("byte_size");

    Ok(Document {
        id: row.get("id"),
        title: row.get("title"),
        source_kind: SourceKind::parse(&source_kind)
            .ok_or_else(|| bad_column("source_kind", &source_kind))?,
        source_path: row.get("source_path"),
        original_filename: row.get("original_filename"),
        content_hash: row.get("content_hash"),
        byte_size: byte_size.max(0) as u64,
        media_type: row.get("media_type"),
        status: DocumentStatus::parse(&status).ok_or_else(|| bad_column("status", &status))?,
        external_job_id: row.get("external_job_id"),
        processing_job_id: row.get("processing_job_id"),
        processing_started_at: opt_from_ms(row.get("processing_started_at")),
        processing_completed_at: opt_from_ms(row.get("processing_completed_at")),
        metadata,
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let metadata_json: String = row.get("metadata_json");
    let keywords_json: String = row.get("keywords_json");
    let dims: Option<i64> = row.get("embedding_dimensions");

    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        chunk_hash: row.get("chunk_hash"),
        vector_id: row.get("vector_id"),
        vector_synced_at: opt_from_ms(row.get("vector_synced_at")),
        embedding_model: row.get("embedding_model"),
        embedding_dimensions: dims.map(|d| d.max(0) as usize),
        metadata: serde_json::from_str(&metadata_json)?,
        keywords: serde_json::from_str(&keywords_json)?,
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    })
}

fn row_to_job(row: &SqliteRow) -> Result<ProcessingJob> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let retry_count: i64 = row.get("retry_count");
    let max_retries: i64 = row.get("max_retries");

    Ok(ProcessingJob {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_id: row.get("chunk_id"),
        kind: JobKind::parse(&kind).ok_or_else(|| bad_column("kind", &kind))?,
        status: JobStatus::parse(&status).ok_or_else(|| bad_column("status", &status))?,
        external_job_id: row.get("external_job_id"),
        provider: row.get("provider"),
        progress: row.get("progress"),
        error_message: row.get("error_message"),
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        started_at: opt_from_ms(row.get("started_at")),
        completed_at: opt_from_ms(row.get("completed_at")),
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    })
}

fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let payload_json: String = row.get("payload_json");
    let payload: TaskPayload = serde_json::from_str(&payload_json)?;
    let attempts: i64 = row.get("attempts");

    Ok(Task {
        id: row.get("id"),
        payload,
        run_at: from_ms(row.get("run_at")),
        attempts: attempts.max(0) as u32,
        created_at: from_ms(row.get("created_at")),
    })
}

/// FTS5 query matching any of the query's terms. Terms are quoted so user
/// punctuation never reaches the FTS parser.
fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

const DOCUMENT_COLUMNS: &str = "id, title, source_kind, source_path, original_filename, \
     content_hash, byte_size, media_type, status, external_job_id, processing_job_id, \
     processing_started_at, processing_completed_at, metadata_json, created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, document_id, chunk_index, content, chunk_hash, vector_id, \
     vector_synced_at, embedding_model, embedding_dimensions, metadata_json, keywords_json, \
     created_at, updated_at";

const JOB_COLUMNS: &str = "id, document_id, chunk_id, kind, status, external_job_id, provider, \
     progress, error_message, retry_count, max_retries, started_at, completed_at, created_at, \
     updated_at";

#[async_trait]
impl Store for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<Document> {
        let metadata_json = serde_json::to_string(&doc.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, title, source_kind, source_path, original_filename,
                                   content_hash, byte_size, media_type, status, external_job_id,
                                   processing_job_id, processing_started_at,
                                   processing_completed_at, metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(doc.source_kind.as_str())
        .bind(&doc.source_path)
        .bind(&doc.original_filename)
        .bind(&doc.content_hash)
        .bind(doc.byte_size as i64)
        .bind(&doc.media_type)
        .bind(doc.status.as_str())
        .bind(&doc.external_job_id)
        .bind(&doc.processing_job_id)
        .bind(opt_ms(doc.processing_started_at))
        .bind(opt_ms(doc.processing_completed_at))
        .bind(&metadata_json)
        .bind(to_ms(doc.created_at))
        .bind(to_ms(doc.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.find_document_by_hash(&doc.content_hash)
            .await?
            .ok_or_else(|| RagError::storage("document vanished after insert"))
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let metadata_json = serde_json::to_string(&doc.metadata)?;
        let result = sqlx::query(
            r#"
            UPDATE documents SET
                title = ?, source_path = ?, original_filename = ?, media_type = ?, status = ?,
                external_job_id = ?, processing_job_id = ?, processing_started_at = ?,
                processing_completed_at = ?, metadata_json = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&doc.title)
        .bind(&doc.source_path)
        .bind(&doc.original_filename)
        .bind(&doc.media_type)
        .bind(doc.status.as_str())
        .bind(&doc.external_job_id)
        .bind(&doc.processing_job_id)
        .bind(opt_ms(doc.processing_started_at))
        .bind(opt_ms(doc.processing_completed_at))
        .bind(&metadata_json)
        .bind(to_ms(doc.updated_at))
        .bind(&doc.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RagError::not_found("document", &doc.id));
        }
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE content_hash = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents ORDER BY created_at DESC, id",
            DOCUMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM processing_jobs WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for table in ["chunks_fts", "chunks", "processing_jobs", "documents"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        if !exists {
            return Err(RagError::not_found("document", document_id));
        }

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for chunk in chunks {
            let metadata_json = serde_json::to_string(&chunk.metadata)?;
            let keywords_json = serde_json::to_string(&chunk.keywords)?;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, content, chunk_hash, vector_id,
                                    vector_synced_at, embedding_model, embedding_dimensions,
                                    metadata_json, keywords_json, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.chunk_hash)
            .bind(&chunk.vector_id)
            .bind(opt_ms(chunk.vector_synced_at))
            .bind(&chunk.embedding_model)
            .bind(chunk.embedding_dimensions.map(|d| d as i64))
            .bind(&metadata_json)
            .bind(&keywords_json)
            .bind(to_ms(chunk.created_at))
            .bind(to_ms(chunk.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(document_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!("SELECT {} FROM chunks WHERE id = ?", CHUNK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn update_chunk(&self, chunk: &Chunk) -> Result<()> {
        if !chunk.hash_matches() {
            return Err(RagError::InvalidInput(format!(
                "chunk {} hash does not match its content",
                chunk.id
            )));
        }
        let metadata_json = serde_json::to_string(&chunk.metadata)?;
        let keywords_json = serde_json::to_string(&chunk.keywords)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"
            UPDATE chunks SET
                content = ?, chunk_hash = ?, vector_id = ?, vector_synced_at = ?,
                embedding_model = ?, embedding_dimensions = ?, metadata_json = ?,
                keywords_json = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&chunk.content)
        .bind(&chunk.chunk_hash)
        .bind(&chunk.vector_id)
        .bind(opt_ms(chunk.vector_synced_at))
        .bind(&chunk.embedding_model)
        .bind(chunk.embedding_dimensions.map(|d| d as i64))
        .bind(&metadata_json)
        .bind(&keywords_json)
        .bind(to_ms(chunk.updated_at))
        .bind(&chunk.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RagError::not_found("chunk", &chunk.id));
        }

        sqlx::query("UPDATE chunks_fts SET content = ? WHERE chunk_id = ?")
            .bind(&chunk.content)
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE document_id = ? ORDER BY chunk_index",
            CHUNK_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn unsynced_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE document_id = ? AND vector_synced_at IS NULL \
             ORDER BY chunk_index",
            CHUNK_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn count_chunks(&self, document_id: &str) -> Result<ChunkCounts> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(vector_synced_at) AS synced \
             FROM chunks WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let total: i64 = row.get("total");
        let synced: i64 = row.get("synced");
        Ok(ChunkCounts {
            total: total as usize,
            synced: synced as usize,
        })
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.chunk_id AS chunk_id, chunks_fts.document_id AS document_id,
                   chunks_fts.content AS content, chunks_fts.rank AS rank,
                   documents.title AS title
            FROM chunks_fts
            JOIN documents ON documents.id = chunks_fts.document_id
            WHERE chunks_fts MATCH ?
            ORDER BY chunks_fts.rank
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                Candidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    document_title: row.get("title"),
                    content: row.get("content"),
                    // FTS5 rank is negative; flip so higher is better
                    raw_score: -rank,
                }
            })
            .collect())
    }

    async fn insert_job(&self, job: &ProcessingJob) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO processing_jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            JOB_COLUMNS
        ))
        .bind(&job.id)
        .bind(&job.document_id)
        .bind(&job.chunk_id)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(&job.external_job_id)
        .bind(&job.provider)
        .bind(job.progress)
        .bind(&job.error_message)
        .bind(job.retry_count as i64)
        .bind(job.max_retries as i64)
        .bind(opt_ms(job.started_at))
        .bind(opt_ms(job.completed_at))
        .bind(to_ms(job.created_at))
        .bind(to_ms(job.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_job(&self, job: &ProcessingJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE processing_jobs SET
                status = ?, external_job_id = ?, progress = ?, error_message = ?,
                retry_count = ?, max_retries = ?, started_at = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(&job.external_job_id)
        .bind(job.progress)
        .bind(&job.error_message)
        .bind(job.retry_count as i64)
        .bind(job.max_retries as i64)
        .bind(opt_ms(job.started_at))
        .bind(opt_ms(job.completed_at))
        .bind(to_ms(job.updated_at))
        .bind(&job.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RagError::not_found("job", &job.id));
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<ProcessingJob>> {
        let row = sqlx::query(&format!("SELECT {} FROM processing_jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_job_by_external_id(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ProcessingJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM processing_jobs WHERE external_job_id = ? \
             ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(external_job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn jobs_for_document(&self, document_id: &str) -> Result<Vec<ProcessingJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM processing_jobs WHERE document_id = ? ORDER BY created_at, id",
            JOB_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn record_search(&self, record: &SearchQueryRecord) -> Result<()> {
        let scores_json = serde_json::to_string(&record.similarity_scores)?;
        sqlx::query(
            r#"
            INSERT INTO search_queries (id, query_text, mode, result_count, latency_ms,
                                        similarity_scores_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.query_text)
        .bind(record.mode.as_str())
        .bind(record.result_count as i64)
        .bind(record.latency_ms as i64)
        .bind(&scores_json)
        .bind(to_ms(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_usage(&self, record: &ApiUsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_usage (id, provider, operation, tokens_used, cost_usd, document_id,
                                   created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.provider)
        .bind(&record.operation)
        .bind(record.tokens_used.map(|t| t as i64))
        .bind(record.cost_usd)
        .bind(&record.document_id)
        .bind(to_ms(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut documents_by_status = BTreeMap::new();
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        for row in &rows {
            let n: i64 = row.get("n");
            documents_by_status.insert(row.get::<String, _>("status"), n as usize);
        }

        let mut jobs_by_status = BTreeMap::new();
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM processing_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        for row in &rows {
            let n: i64 = row.get("n");
            jobs_by_status.insert(row.get::<String, _>("status"), n as usize);
        }

        let chunk_row =
            sqlx::query("SELECT COUNT(*) AS total, COUNT(vector_synced_at) AS synced FROM chunks")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        let total_chunks: i64 = chunk_row.get("total");
        let synced_chunks: i64 = chunk_row.get("synced");

        let search_queries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_queries")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let usage_row = sqlx::query(
            "SELECT COUNT(*) AS calls, COALESCE(SUM(cost_usd), 0.0) AS cost FROM api_usage",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let api_calls: i64 = usage_row.get("calls");
        let total_cost_usd: f64 = usage_row.get("cost");

        Ok(StoreStats {
            documents_by_status,
            total_chunks: total_chunks as usize,
            synced_chunks: synced_chunks as usize,
            jobs_by_status,
            search_queries: search_queries as usize,
            api_calls: api_calls as usize,
            total_cost_usd,
        })
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneCounts> {
        let cutoff = to_ms(cutoff);
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let searches = sqlx::query("DELETE FROM search_queries WHERE created_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let usage = sqlx::query("DELETE FROM api_usage WHERE created_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let jobs = sqlx::query("DELETE FROM processing_jobs WHERE status = ? AND created_at < ?")
            .bind(JobStatus::Failed.as_str())
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(PruneCounts {
            search_queries: searches.rows_affected() as usize,
            api_usage: usage.rows_affected() as usize,
            failed_jobs: jobs.rows_affected() as usize,
        })
    }

    async fn optimize_search(&self) -> Result<()> {
        sqlx::query("INSERT INTO chunks_fts(chunks_fts) VALUES('optimize')")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for SqliteStore {
    async fn enqueue(&self, payload: TaskPayload, run_at: DateTime<Utc>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let payload_json = serde_json::to_string(&payload)?;
        sqlx::query(
            "INSERT INTO tasks (id, kind, payload_json, run_at, attempts, leased_until, created_at) \
             VALUES (?, ?, ?, ?, 0, NULL, ?)",
        )
        .bind(&id)
        .bind(payload.kind())
        .bind(&payload_json)
        .bind(to_ms(run_at))
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Task>> {
        let now_ms = to_ms(now);
        // Single statement so concurrent workers never claim the same row.
        let rows = sqlx::query(
            r#"
            UPDATE tasks SET leased_until = ?, attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM tasks
                WHERE run_at <= ? AND (leased_until IS NULL OR leased_until <= ?)
                ORDER BY run_at, created_at
                LIMIT ?
            )
            RETURNING id, payload_json, run_at, attempts, created_at
            "#,
        )
        .bind(to_ms(now + lease))
        .bind(now_ms)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut tasks = rows.iter().map(row_to_task).collect::<Result<Vec<_>>>()?;
        tasks.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.created_at.cmp(&b.created_at)));
        Ok(tasks)
    }

    async fn ack(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n as usize)
    }

    async fn next_run_at(&self) -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> = sqlx::query_scalar("SELECT MIN(run_at) FROM tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(opt_from_ms(ms))
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM tasks")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(
            fts_query("deploy: the \"app\"").as_deref(),
            Some("\"deploy\" OR \"the\" OR \"app\"")
        );
        assert_eq!(fts_query("?!"), None);
    }

    #[test]
    fn test_millis_round_trip() {
        let now = from_ms(to_ms(Utc::now()));
        assert_eq!(from_ms(to_ms(now)), now);
        assert_eq!(opt_from_ms(None), None);
    }
}
