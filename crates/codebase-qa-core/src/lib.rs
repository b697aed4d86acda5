//! # Codebase QA Core
//!
//! Runtime-agnostic retrieval pipeline for answering questions about a
//! source repository: line-window chunking, per-codebase embedding
//! indexes, the index registry, and the retrieval orchestrator that ties
//! them together.
//!
//! This crate contains no filesystem, network, or database code. Those
//! collaborators (repository loading, embedding providers, answer
//! generation, persistence) are reached through the traits defined here
//! and implemented by the `codebase-qa` application crate.
//!
//! ## Data flow
//!
//! ```text
//! ingest:  files ──▶ chunk ──▶ IndexRegistry ──▶ CodebaseIndex ──▶ ChunkStore
//! query:   question ──▶ Orchestrator ──▶ CodebaseIndex::query ──▶ assemble_context
//! ```

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod index;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{QaError, Result};
