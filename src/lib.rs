//! # Ragline
//!
//! **A retrieval-augmented knowledge base.**
//!
//! Ragline ingests documents, splits them into chunks, embeds the chunks
//! and keeps a vector index in sync with a relational store, then answers
//! questions grounded in the best-matching chunks.
//!
//! ## Architecture
//!
//! ```text
//!  ingest ─▶ ┌────────────┐  tasks  ┌──────────┐
//!            │  Pipeline  │ ──────▶ │  Worker  │
//!            └─────┬──────┘ ◀────── └──────────┘
//!                  │ extract / embed / sync
//!      ┌───────────┼──────────────┬──────────────┐
//!      ▼           ▼              ▼              ▼
//! ┌─────────┐ ┌──────────┐ ┌────────────┐ ┌─────────────┐
//! │ SQLite  │ │Extractor │ │ Embeddings │ │ VectorIndex │
//! │ + FTS5  │ │local/http│ │            │ │             │
//! └────┬────┘ └──────────┘ └────────────┘ └──────┬──────┘
//!      └──────────────┐          ┌───────────────┘
//!                     ▼          ▼
//!                 ┌──────────────────┐     ┌────────────┐
//!                 │ RetrievalEngine  │ ──▶ │ Answerer   │
//!                 └──────────────────┘     └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. [`pipeline::Pipeline::ingest`] validates and deduplicates the input,
//!    stores the raw bytes ([`blob`]) and queues extraction.
//! 2. The [`worker`] runs each step as an independent task: extraction
//!    ([`extractor`]), one embedding per chunk ([`embedding`]) and one vector
//!    upsert per chunk ([`vector_index`]). Failed steps are retried per
//!    [`jobs::RetryPolicy`].
//! 3. [`search::RetrievalEngine`] merges vector and full-text hits.
//! 4. [`qa::QuestionAnswerer`] builds a grounded prompt and calls the
//!    configured LLM ([`answer`]), optionally streaming.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | SQLite document store and task queue |
//! | [`blob`] | Raw upload storage |
//! | [`extract`] | Local text extraction (PDF, DOCX, HTML) |
//! | [`extractor`] | Chunk extractors (local and remote API) |
//! | [`embedding`] | Embedding providers |
//! | [`vector_index`] | Vector index backends |
//! | [`answer`] | LLM answer backends |
//! | [`jobs`] | Job tracking and retry policy |
//! | [`pipeline`] | Ingestion pipeline |
//! | [`webhook`] | Processing-API webhook receiver |
//! | [`worker`] | Background task worker |
//! | [`search`] | Vector, keyword and hybrid retrieval |
//! | [`qa`] | Question answering |
//! | [`service`] | Assembled knowledge base |

pub mod answer;
pub mod blob;
pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod extractor;
pub mod http;
pub mod jobs;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod qa;
pub mod search;
pub mod service;
pub mod sqlite_store;
pub mod vector_index;
pub mod webhook;
pub mod worker;
