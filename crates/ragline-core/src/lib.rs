//! # ragline core
//!
//! Runtime-free logic shared by the ragline pipeline: data models and
//! their state machines, the error taxonomy, sentence chunking, ranking
//! math, and the storage, queue and embedding contracts.
//!
//! This crate contains no tokio, sqlx, network or filesystem I/O. Backends
//! that need them live in the `ragline` app crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod queue;
pub mod scoring;
pub mod store;
