//! Durable task queue contract.
//!
//! Every pipeline step is an independently schedulable [`Task`]. Workers
//! claim due tasks under a lease and acknowledge them when done; a task
//! whose worker dies before acknowledging becomes claimable again once the
//! lease expires, which gives at-least-once delivery.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RagError, Result};

/// What a task does. Serialized as tagged JSON in durable backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    ProcessDocument {
        document_id: String,
        job_id: String,
    },
    PollExtraction {
        document_id: String,
        job_id: String,
        /// Consecutive poll failures so far.
        errors: u32,
    },
    GenerateEmbedding {
        chunk_id: String,
        job_id: String,
    },
    SyncVector {
        chunk_id: String,
        job_id: String,
        chunk_hash: String,
        embedding: Vec<f32>,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::ProcessDocument { .. } => "process_document",
            TaskPayload::PollExtraction { .. } => "poll_extraction",
            TaskPayload::GenerateEmbedding { .. } => "generate_embedding",
            TaskPayload::SyncVector { .. } => "sync_vector",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            TaskPayload::ProcessDocument { job_id, .. }
            | TaskPayload::PollExtraction { job_id, .. }
            | TaskPayload::GenerateEmbedding { job_id, .. }
            | TaskPayload::SyncVector { job_id, .. } => job_id,
        }
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub payload: TaskPayload,
    pub run_at: DateTime<Utc>,
    /// Number of times the task has been claimed.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedule `payload` to run no earlier than `run_at`. Returns the task id.
    async fn enqueue(&self, payload: TaskPayload, run_at: DateTime<Utc>) -> Result<String>;

    /// Lease up to `limit` tasks due at `now`, earliest first.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize, lease: Duration)
        -> Result<Vec<Task>>;

    /// Remove a finished task.
    async fn ack(&self, task_id: &str) -> Result<()>;

    /// Tasks not yet acknowledged.
    async fn pending(&self) -> Result<usize>;

    /// Earliest `run_at` among pending tasks.
    async fn next_run_at(&self) -> Result<Option<DateTime<Utc>>>;

    async fn clear(&self) -> Result<()>;
}

struct Entry {
    task: Task,
    leased_until: Option<DateTime<Utc>>,
}

/// In-memory queue for tests and single-process runs. Not durable.
#[derive(Default)]
pub struct MemoryQueue {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| RagError::storage("memory queue lock poisoned"))
    }

    /// Snapshot of pending payloads, earliest first.
    pub fn snapshot(&self) -> Result<Vec<Task>> {
        let entries = self.lock()?;
        let mut tasks: Vec<Task> = entries.values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.created_at.cmp(&b.created_at)));
        Ok(tasks)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, payload: TaskPayload, run_at: DateTime<Utc>) -> Result<String> {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            payload,
            run_at,
            attempts: 0,
            created_at: Utc::now(),
        };
        let id = task.id.clone();
        self.lock()?.insert(
            id.clone(),
            Entry {
                task,
                leased_until: None,
            },
        );
        Ok(id)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Task>> {
        let mut entries = self.lock()?;
        let mut due: Vec<&mut Entry> = entries
            .values_mut()
            .filter(|e| e.task.run_at <= now && e.leased_until.map_or(true, |t| t <= now))
            .collect();
        due.sort_by(|a, b| {
            a.task
                .run_at
                .cmp(&b.task.run_at)
                .then(a.task.created_at.cmp(&b.task.created_at))
        });
        Ok(due
            .into_iter()
            .take(limit)
            .map(|e| {
                e.leased_until = Some(now + lease);
                e.task.attempts += 1;
                e.task.clone()
            })
            .collect())
    }

    async fn ack(&self, task_id: &str) -> Result<()> {
        self.lock()?.remove(task_id);
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    async fn next_run_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock()?.values().map(|e| e.task.run_at).min())
    }

    async fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u32) -> TaskPayload {
        TaskPayload::PollExtraction {
            document_id: "d".to_string(),
            job_id: format!("j{n}"),
            errors: 0,
        }
    }

    #[tokio::test]
    async fn test_claim_only_due_tasks() {
        let q = MemoryQueue::new();
        let now = Utc::now();
        q.enqueue(payload(1), now - Duration::seconds(5)).await.unwrap();
        q.enqueue(payload(2), now + Duration::seconds(60)).await.unwrap();

        let claimed = q.claim_due(now, 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload.job_id(), "j1");
        assert_eq!(claimed[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_lease_hides_then_redelivers() {
        let q = MemoryQueue::new();
        let now = Utc::now();
        q.enqueue(payload(1), now).await.unwrap();

        let first = q.claim_due(now, 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(q.claim_due(now, 10, Duration::seconds(30)).await.unwrap().is_empty());

        let later = now + Duration::seconds(31);
        let again = q.claim_due(later, 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);

        q.ack(&again[0].id).await.unwrap();
        assert_eq!(q.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_order() {
        let q = MemoryQueue::new();
        let now = Utc::now();
        q.enqueue(payload(2), now - Duration::seconds(1)).await.unwrap();
        q.enqueue(payload(1), now - Duration::seconds(10)).await.unwrap();
        q.enqueue(payload(3), now).await.unwrap();

        let claimed = q.claim_due(now, 2, Duration::seconds(30)).await.unwrap();
        let ids: Vec<&str> = claimed.iter().map(|t| t.payload.job_id()).collect();
        assert_eq!(ids, vec!["j1", "j2"]);
        assert_eq!(q.next_run_at().await.unwrap(), Some(now - Duration::seconds(10)));
    }

    #[test]
    fn test_payload_json_shape() {
        let p = TaskPayload::GenerateEmbedding {
            chunk_id: "c1".into(),
            job_id: "j1".into(),
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["type"], "generate_embedding");
        assert_eq!(json["chunk_id"], "c1");
        let back: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }
}
