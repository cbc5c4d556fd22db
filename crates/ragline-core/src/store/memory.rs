//! In-memory [`Store`] implementation for tests and ephemeral runs.
//!
//! All state lives behind one `std::sync::RwLock`, so every operation sees
//! a consistent snapshot. Keyword search scores chunks by the number of
//! distinct query terms that appear as whole words in their content.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{RagError, Result};
use crate::models::{ApiUsageRecord, Chunk, Document, JobStatus, ProcessingJob, SearchQueryRecord};
use crate::scoring::Candidate;

use super::{query_terms, ChunkCounts, PruneCounts, Store, StoreStats};

#[derive(Default)]
struct State {
    docs: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    jobs: HashMap<String, ProcessingJob>,
    searches: Vec<SearchQueryRecord>,
    usage: Vec<ApiUsageRecord>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| RagError::storage("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| RagError::storage("in-memory store lock poisoned"))
    }

    /// Recorded search analytics, oldest first.
    pub fn search_records(&self) -> Result<Vec<SearchQueryRecord>> {
        Ok(self.read()?.searches.clone())
    }

    /// Recorded API usage, oldest first.
    pub fn usage_records(&self) -> Result<Vec<ApiUsageRecord>> {
        Ok(self.read()?.usage.clone())
    }
}

fn sorted_chunks<'a>(chunks: impl Iterator<Item = &'a Chunk>) -> Vec<Chunk> {
    let mut out: Vec<Chunk> = chunks.cloned().collect();
    out.sort_by_key(|c| c.chunk_index);
    out
}

/// Lowercased words of `text`, split the way the SQLite FTS tokenizer does.
fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<Document> {
        let mut state = self.write()?;
        if let Some(existing) = state
            .docs
            .values()
            .find(|d| d.content_hash == doc.content_hash)
        {
            return Ok(existing.clone());
        }
        state.docs.insert(doc.id.clone(), doc.clone());
        Ok(doc.clone())
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let mut state = self.write()?;
        match state.docs.get_mut(&doc.id) {
            Some(slot) => {
                *slot = doc.clone();
                Ok(())
            }
            None => Err(RagError::not_found("document", &doc.id)),
        }
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.docs.get(id).cloned())
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        Ok(self
            .read()?
            .docs
            .values()
            .find(|d| d.content_hash == content_hash)
            .cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self.read()?.docs.values().cloned().collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        if state.docs.remove(id).is_none() {
            return Ok(false);
        }
        state.chunks.retain(|_, c| c.document_id != id);
        state
            .jobs
            .retain(|_, j| j.document_id.as_deref() != Some(id));
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.write()?;
        state.docs.clear();
        state.chunks.clear();
        state.jobs.clear();
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.write()?;
        if !state.docs.contains_key(document_id) {
            return Err(RagError::not_found("document", document_id));
        }
        state.chunks.retain(|_, c| c.document_id != document_id);
        for chunk in chunks {
            state.chunks.insert(chunk.id.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self.read()?.chunks.get(id).cloned())
    }

    async fn update_chunk(&self, chunk: &Chunk) -> Result<()> {
        if !chunk.hash_matches() {
            return Err(RagError::InvalidInput(format!(
                "chunk {} hash does not match its content",
                chunk.id
            )));
        }
        let mut state = self.write()?;
        match state.chunks.get_mut(&chunk.id) {
            Some(slot) => {
                *slot = chunk.clone();
                Ok(())
            }
            None => Err(RagError::not_found("chunk", &chunk.id)),
        }
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let state = self.read()?;
        Ok(sorted_chunks(
            state.chunks.values().filter(|c| c.document_id == document_id),
        ))
    }

    async fn unsynced_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let state = self.read()?;
        Ok(sorted_chunks(state.chunks.values().filter(|c| {
            c.document_id == document_id && c.vector_synced_at.is_none()
        })))
    }

    async fn count_chunks(&self, document_id: &str) -> Result<ChunkCounts> {
        let state = self.read()?;
        let mut counts = ChunkCounts::default();
        for c in state.chunks.values().filter(|c| c.document_id == document_id) {
            counts.total += 1;
            if c.is_synced() {
                counts.synced += 1;
            }
        }
        Ok(counts)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        let mut candidates: Vec<(i64, Candidate)> = state
            .chunks
            .values()
            .filter_map(|chunk| {
                let words = words(&chunk.content);
                let matches = terms.iter().filter(|t| words.contains(*t)).count();
                if matches == 0 {
                    return None;
                }
                let title = state
                    .docs
                    .get(&chunk.document_id)
                    .map(|d| d.title.clone())
                    .unwrap_or_default();
                Some((
                    chunk.chunk_index,
                    Candidate {
                        chunk_id: chunk.id.clone(),
                        document_id: chunk.document_id.clone(),
                        document_title: title,
                        content: chunk.content.clone(),
                        raw_score: matches as f64,
                    },
                ))
            })
            .collect();
        candidates.sort_by(|(ia, a), (ib, b)| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.document_id.cmp(&b.document_id))
                .then(ia.cmp(ib))
        });
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, c)| c)
            .collect())
    }

    async fn insert_job(&self, job: &ProcessingJob) -> Result<()> {
        self.write()?.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &ProcessingJob) -> Result<()> {
        let mut state = self.write()?;
        match state.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(RagError::not_found("job", &job.id)),
        }
    }

    async fn get_job(&self, id: &str) -> Result<Option<ProcessingJob>> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    async fn find_job_by_external_id(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ProcessingJob>> {
        Ok(self
            .read()?
            .jobs
            .values()
            .find(|j| j.external_job_id.as_deref() == Some(external_job_id))
            .cloned())
    }

    async fn jobs_for_document(&self, document_id: &str) -> Result<Vec<ProcessingJob>> {
        let mut jobs: Vec<ProcessingJob> = self
            .read()?
            .jobs
            .values()
            .filter(|j| j.document_id.as_deref() == Some(document_id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn record_search(&self, record: &SearchQueryRecord) -> Result<()> {
        self.write()?.searches.push(record.clone());
        Ok(())
    }

    async fn record_usage(&self, record: &ApiUsageRecord) -> Result<()> {
        self.write()?.usage.push(record.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.read()?;
        let mut documents_by_status = BTreeMap::new();
        for doc in state.docs.values() {
            *documents_by_status
                .entry(doc.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        let mut jobs_by_status = BTreeMap::new();
        for job in state.jobs.values() {
            *jobs_by_status
                .entry(job.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(StoreStats {
            documents_by_status,
            total_chunks: state.chunks.len(),
            synced_chunks: state.chunks.values().filter(|c| c.is_synced()).count(),
            jobs_by_status,
            search_queries: state.searches.len(),
            api_calls: state.usage.len(),
            total_cost_usd: state.usage.iter().filter_map(|u| u.cost_usd).sum(),
        })
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneCounts> {
        let mut state = self.write()?;
        let searches = state.searches.len();
        state.searches.retain(|r| r.created_at >= cutoff);
        let usage = state.usage.len();
        state.usage.retain(|u| u.created_at >= cutoff);
        let jobs = state.jobs.len();
        state
            .jobs
            .retain(|_, j| !(j.status == JobStatus::Failed && j.created_at < cutoff));
        Ok(PruneCounts {
            search_queries: searches - state.searches.len(),
            api_usage: usage - state.usage.len(),
            failed_jobs: jobs - state.jobs.len(),
        })
    }
}
