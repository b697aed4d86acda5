//! Core data models used throughout the retrieval pipeline.
//!
//! These types represent the chunks, ranked results, and codebase records
//! that flow between the chunker, the indexes, and the orchestrator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QaError;

/// A contiguous span of lines from one file.
///
/// Line numbers are 1-indexed and inclusive. `text` is the exact
/// substring of the file covering those lines, line terminators included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub source_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    /// 0-based position among the chunks emitted for the same file.
    pub sequence_index: usize,
    pub language_hint: String,
}

impl Chunk {
    /// Identity key: `(source_path, sequence_index)`.
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            source_path: self.source_path.clone(),
            sequence_index: self.sequence_index,
        }
    }
}

/// Stable identity of a chunk within one codebase.
///
/// Ordering is `source_path` then `sequence_index`, which is also the
/// tie-break order for equally scored results.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub source_path: String,
    pub sequence_index: usize,
}

/// A chunk paired with its cosine similarity to the question (higher is better).
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Lifecycle status of a codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodebaseStatus {
    Empty,
    Indexing,
    Ready,
    Stale,
    Failed,
}

impl CodebaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodebaseStatus::Empty => "empty",
            CodebaseStatus::Indexing => "indexing",
            CodebaseStatus::Ready => "ready",
            CodebaseStatus::Stale => "stale",
            CodebaseStatus::Failed => "failed",
        }
    }

    /// Whether queries may be served in this status.
    pub fn is_queryable(&self) -> bool {
        matches!(self, CodebaseStatus::Ready | CodebaseStatus::Stale)
    }
}

impl fmt::Display for CodebaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodebaseStatus {
    type Err = QaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(CodebaseStatus::Empty),
            "indexing" => Ok(CodebaseStatus::Indexing),
            "ready" => Ok(CodebaseStatus::Ready),
            "stale" => Ok(CodebaseStatus::Stale),
            "failed" => Ok(CodebaseStatus::Failed),
            other => Err(QaError::Storage(format!("unknown codebase status '{other}'"))),
        }
    }
}

/// Persisted metadata for one codebase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodebaseRecord {
    pub codebase_id: String,
    pub name: String,
    /// Repository URL or local path the files are loaded from.
    pub repo_ref: String,
    pub description: String,
    pub status: CodebaseStatus,
    pub chunk_count: usize,
    pub file_count: usize,
    /// Chunks excluded during the last indexing run because embedding failed.
    pub degraded_chunks: usize,
    pub commit_hash: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

impl CodebaseRecord {
    pub fn new(codebase_id: &str, repo_ref: &str) -> Self {
        Self {
            codebase_id: codebase_id.to_string(),
            name: codebase_id.to_string(),
            repo_ref: repo_ref.to_string(),
            description: String::new(),
            status: CodebaseStatus::Empty,
            chunk_count: 0,
            file_count: 0,
            degraded_chunks: 0,
            commit_hash: None,
            last_error: None,
            created_at: Utc::now(),
            last_indexed_at: None,
        }
    }
}

/// Chunk and file counts of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IndexStats {
    pub chunk_count: usize,
    pub file_count: usize,
}

/// Last successfully indexed state of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// SHA-256 of the file text.
    pub content_hash: String,
    pub chunk_count: usize,
}

/// One question/answer exchange against a codebase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub codebase_id: String,
    pub question: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}
