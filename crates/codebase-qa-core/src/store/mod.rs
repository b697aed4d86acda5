//! Persistence abstraction for indexes and codebase metadata.
//!
//! [`ChunkStore`] holds embedded chunks so an index can be reopened after
//! a restart without re-embedding. [`MetadataStore`] holds codebase
//! records, per-file fingerprints, and chat history.
//!
//! Both are `Send + Sync` and async (via `async-trait`). The in-memory
//! implementations in [`memory`] return immediately-ready futures; the
//! SQLite implementations live in the app crate.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ChatEntry, Chunk, CodebaseRecord, FileFingerprint};

/// A chunk together with its embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Durable storage for embedded chunks, partitioned by codebase.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`load`](ChunkStore::load) | Read every stored chunk of a codebase |
/// | [`upsert`](ChunkStore::upsert) | Insert or replace chunks by key |
/// | [`replace_file`](ChunkStore::replace_file) | Swap one file's chunk set atomically |
/// | [`remove_file`](ChunkStore::remove_file) | Drop one file's chunks |
/// | [`drop_codebase`](ChunkStore::drop_codebase) | Drop everything for a codebase |
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn load(&self, codebase_id: &str) -> Result<Vec<StoredChunk>>;

    async fn upsert(&self, codebase_id: &str, entries: &[StoredChunk]) -> Result<()>;

    /// Remove every chunk of `source_path` and insert `entries` in one step.
    async fn replace_file(
        &self,
        codebase_id: &str,
        source_path: &str,
        entries: &[StoredChunk],
    ) -> Result<()>;

    /// Returns the number of chunks removed.
    async fn remove_file(&self, codebase_id: &str, source_path: &str) -> Result<usize>;

    async fn drop_codebase(&self, codebase_id: &str) -> Result<()>;
}

/// Durable codebase metadata: records, file manifests, and chat history.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn load_records(&self) -> Result<Vec<CodebaseRecord>>;

    /// Insert or overwrite the record keyed by its `codebase_id`.
    async fn save_record(&self, record: &CodebaseRecord) -> Result<()>;

    /// Remove the record, its manifest, and its chat history.
    async fn delete_codebase(&self, codebase_id: &str) -> Result<()>;

    async fn load_manifest(&self, codebase_id: &str) -> Result<BTreeMap<String, FileFingerprint>>;

    async fn put_fingerprint(
        &self,
        codebase_id: &str,
        source_path: &str,
        fingerprint: &FileFingerprint,
    ) -> Result<()>;

    async fn remove_fingerprint(&self, codebase_id: &str, source_path: &str) -> Result<()>;

    async fn clear_manifest(&self, codebase_id: &str) -> Result<()>;

    async fn add_chat_entry(&self, entry: &ChatEntry) -> Result<()>;

    /// Most recent entries first.
    async fn chat_history(&self, codebase_id: &str, limit: usize) -> Result<Vec<ChatEntry>>;
}
