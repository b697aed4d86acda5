//! Embedding-backed chunk index for exactly one codebase.
//!
//! A [`CodebaseIndex`] keeps every chunk and its vector in memory, keyed
//! by `(source_path, sequence_index)`, and writes through to a
//! [`ChunkStore`] so it can be reopened after a restart without calling
//! the embedding provider again.
//!
//! # Concurrency
//!
//! Mutations (`upsert`, `replace_file`, `remove_file`, `destroy`) are
//! serialized by a writer mutex held for the whole operation, including
//! the embedding calls. Queries only take the state read lock. A mutation
//! embeds first, persists second, and applies its result to the in-memory
//! map under a single write guard last, so a query sees either none or
//! all of it.
//!
//! # Embedding failures
//!
//! Chunks are embedded in batches of `batch_size`. When a batch call fails
//! (or returns the wrong number of vectors), each chunk of that batch is
//! retried on its own up to `chunk_attempts` times; chunks that still fail
//! are excluded and reported in [`UpsertReport::failed`]. A chunk the
//! provider rejects with a non-transient error is excluded at once.
//!
//! If a batch fails with a transient error and the single-chunk retry of
//! its first chunk fails the same way, the provider is treated as down:
//! the mutation returns [`QaError::EmbeddingUnavailable`] and nothing is
//! stored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{QaError, Result};
use crate::models::{Chunk, ChunkKey, IndexStats, ScoredChunk};
use crate::store::{ChunkStore, StoredChunk};

/// Batching and retry limits for embedding calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// Texts per embedding call.
    pub batch_size: usize,
    /// Per-chunk attempts after its batch failed.
    pub chunk_attempts: u32,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            chunk_attempts: 2,
        }
    }
}

/// Outcome of an upsert: how many chunks were stored and which were excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub added: usize,
    pub failed: Vec<ChunkKey>,
}

struct IndexState {
    entries: BTreeMap<ChunkKey, StoredChunk>,
    destroyed: bool,
}

impl IndexState {
    /// Dimensionality of stored vectors; `None` while empty.
    fn dims(&self) -> Option<usize> {
        self.entries.values().next().map(|e| e.vector.len())
    }
}

/// The chunk index of one codebase.
pub struct CodebaseIndex {
    codebase_id: String,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn ChunkStore>,
    options: IndexOptions,
    state: RwLock<IndexState>,
    writer: Mutex<()>,
}

impl CodebaseIndex {
    /// Open the index for `codebase_id`, loading whatever the store holds.
    pub async fn open(
        codebase_id: &str,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ChunkStore>,
        options: IndexOptions,
    ) -> Result<Self> {
        let stored = store.load(codebase_id).await?;
        let entries: BTreeMap<ChunkKey, StoredChunk> = stored
            .into_iter()
            .map(|entry| (entry.chunk.key(), entry))
            .collect();
        debug!(codebase_id, chunks = entries.len(), "opened codebase index");

        Ok(Self {
            codebase_id: codebase_id.to_string(),
            embedder,
            store,
            options,
            state: RwLock::new(IndexState {
                entries,
                destroyed: false,
            }),
            writer: Mutex::new(()),
        })
    }

    pub fn codebase_id(&self) -> &str {
        &self.codebase_id
    }

    /// Embed and store `chunks`, replacing any stored chunk with the same key.
    pub async fn upsert(&self, chunks: &[Chunk]) -> Result<UpsertReport> {
        let _writer = self.writer.lock().await;
        self.ensure_live().await?;

        let (embedded, failed) = self.embed_chunks(chunks).await?;
        self.check_dims(&embedded, None).await?;
        if !embedded.is_empty() {
            self.store.upsert(&self.codebase_id, &embedded).await?;
        }

        let added = embedded.len();
        let mut state = self.state.write().await;
        for entry in embedded {
            state.entries.insert(entry.chunk.key(), entry);
        }
        Ok(UpsertReport { added, failed })
    }

    /// Replace every chunk of `source_path` with `chunks`.
    ///
    /// If none of a non-empty `chunks` could be embedded, the file's
    /// current chunks are left in place and all keys are reported failed.
    pub async fn replace_file(&self, source_path: &str, chunks: &[Chunk]) -> Result<UpsertReport> {
        if let Some(stray) = chunks.iter().find(|c| c.source_path != source_path) {
            return Err(QaError::Configuration(format!(
                "chunk from '{}' passed to replace_file for '{}'",
                stray.source_path, source_path
            )));
        }

        let _writer = self.writer.lock().await;
        self.ensure_live().await?;

        let (embedded, failed) = self.embed_chunks(chunks).await?;
        if !chunks.is_empty() && embedded.is_empty() {
            warn!(
                codebase_id = %self.codebase_id,
                path = source_path,
                "no chunk of file could be embedded, keeping previous chunks"
            );
            return Ok(UpsertReport { added: 0, failed });
        }
        self.check_dims(&embedded, Some(source_path)).await?;
        self.store
            .replace_file(&self.codebase_id, source_path, &embedded)
            .await?;

        let added = embedded.len();
        let mut state = self.state.write().await;
        state.entries.retain(|key, _| key.source_path != source_path);
        for entry in embedded {
            state.entries.insert(entry.chunk.key(), entry);
        }
        Ok(UpsertReport { added, failed })
    }

    /// Remove every chunk whose `source_path` matches. Returns the count removed.
    pub async fn remove_file(&self, source_path: &str) -> Result<usize> {
        let _writer = self.writer.lock().await;
        self.ensure_live().await?;

        self.store.remove_file(&self.codebase_id, source_path).await?;
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|key, _| key.source_path != source_path);
        Ok(before - state.entries.len())
    }

    /// Return the `top_k` chunks most similar to `question`.
    ///
    /// Scores are cosine similarity (higher is more relevant). Equal
    /// scores are ordered by `(source_path, sequence_index)` ascending.
    /// An empty index returns an empty result without embedding the question.
    pub async fn query(&self, question: &str, top_k: usize) -> Result<Vec<ScoredChunk>> {
        if top_k == 0 {
            return Err(QaError::Configuration("top_k must be >= 1".to_string()));
        }
        {
            let state = self.state.read().await;
            if state.destroyed {
                return Err(QaError::IndexDestroyed(self.codebase_id.clone()));
            }
            if state.entries.is_empty() {
                return Ok(Vec::new());
            }
        }

        let question_vec = self
            .embedder
            .embed(&[question.to_string()])
            .await
            .map_err(as_unavailable)?
            .into_iter()
            .next()
            .ok_or_else(|| QaError::EmbeddingUnavailable("empty embedding response".to_string()))?;

        let state = self.state.read().await;
        if state.destroyed {
            return Err(QaError::IndexDestroyed(self.codebase_id.clone()));
        }
        if let Some(expected) = state.dims() {
            if expected != question_vec.len() {
                return Err(QaError::EmbeddingDimensionMismatch {
                    expected,
                    actual: question_vec.len(),
                });
            }
        }

        let mut scored: Vec<(&ChunkKey, &StoredChunk, f32)> = state
            .entries
            .iter()
            .map(|(key, entry)| (key, entry, cosine_similarity(&question_vec, &entry.vector)))
            .collect();
        scored.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(b.0)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(_, entry, score)| ScoredChunk {
                chunk: entry.chunk.clone(),
                score,
            })
            .collect())
    }

    /// Chunk count and distinct file count.
    pub async fn stats(&self) -> Result<IndexStats> {
        let state = self.state.read().await;
        if state.destroyed {
            return Err(QaError::IndexDestroyed(self.codebase_id.clone()));
        }
        let files: BTreeSet<&str> = state
            .entries
            .keys()
            .map(|k| k.source_path.as_str())
            .collect();
        Ok(IndexStats {
            chunk_count: state.entries.len(),
            file_count: files.len(),
        })
    }

    /// Distinct source paths with at least one stored chunk.
    pub async fn file_paths(&self) -> Result<BTreeSet<String>> {
        let state = self.state.read().await;
        if state.destroyed {
            return Err(QaError::IndexDestroyed(self.codebase_id.clone()));
        }
        Ok(state.entries.keys().map(|k| k.source_path.clone()).collect())
    }

    /// Drop all stored vectors and text. Every later call fails with
    /// [`QaError::IndexDestroyed`].
    pub async fn destroy(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.ensure_live().await?;

        self.store.drop_codebase(&self.codebase_id).await?;
        let mut state = self.state.write().await;
        state.entries.clear();
        state.destroyed = true;
        debug!(codebase_id = %self.codebase_id, "destroyed codebase index");
        Ok(())
    }

    async fn ensure_live(&self) -> Result<()> {
        if self.state.read().await.destroyed {
            return Err(QaError::IndexDestroyed(self.codebase_id.clone()));
        }
        Ok(())
    }

    /// Every new vector must match the dimensionality of what stays stored.
    async fn check_dims(&self, embedded: &[StoredChunk], replacing: Option<&str>) -> Result<()> {
        let state = self.state.read().await;
        let existing = state
            .entries
            .iter()
            .find(|(key, _)| Some(key.source_path.as_str()) != replacing)
            .map(|(_, e)| e.vector.len());
        let Some(expected) = existing.or_else(|| embedded.first().map(|e| e.vector.len())) else {
            return Ok(());
        };
        if let Some(bad) = embedded.iter().find(|e| e.vector.len() != expected) {
            return Err(QaError::EmbeddingDimensionMismatch {
                expected,
                actual: bad.vector.len(),
            });
        }
        Ok(())
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<(Vec<StoredChunk>, Vec<ChunkKey>)> {
        let mut embedded = Vec::with_capacity(chunks.len());
        let mut failed = Vec::new();

        for batch in chunks.chunks(self.options.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            match self.embedder.embed(&texts).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    for (chunk, vector) in batch.iter().zip(vectors) {
                        embedded.push(StoredChunk {
                            chunk: chunk.clone(),
                            vector,
                        });
                    }
                }
                Ok(vectors) => {
                    warn!(
                        codebase_id = %self.codebase_id,
                        expected = batch.len(),
                        got = vectors.len(),
                        "embedding batch returned wrong vector count, retrying per chunk"
                    );
                    self.embed_individually(batch, false, &mut embedded, &mut failed)
                        .await?;
                }
                Err(e) => {
                    warn!(
                        codebase_id = %self.codebase_id,
                        batch = batch.len(),
                        "embedding batch failed, retrying per chunk: {e}"
                    );
                    self.embed_individually(batch, e.is_transient(), &mut embedded, &mut failed)
                        .await?;
                }
            }
        }

        Ok((embedded, failed))
    }

    /// Embed `batch` one chunk at a time.
    ///
    /// With `outage_check`, a transient failure of the very first call means
    /// the provider is down and is returned as an error.
    async fn embed_individually(
        &self,
        batch: &[Chunk],
        outage_check: bool,
        embedded: &mut Vec<StoredChunk>,
        failed: &mut Vec<ChunkKey>,
    ) -> Result<()> {
        let mut first_call = outage_check;
        for chunk in batch {
            let mut last_err = String::new();
            let mut vector = None;
            for attempt in 1..=self.options.chunk_attempts.max(1) {
                let outcome = self.embedder.embed(std::slice::from_ref(&chunk.text)).await;
                let checks_outage = std::mem::take(&mut first_call);
                match outcome {
                    Ok(mut vectors) if vectors.len() == 1 => {
                        vector = vectors.pop();
                        break;
                    }
                    Ok(vectors) => {
                        last_err = format!("expected 1 vector, got {}", vectors.len());
                    }
                    Err(e) if checks_outage && e.is_transient() => {
                        warn!(
                            codebase_id = %self.codebase_id,
                            "embedding provider down, giving up on batch: {e}"
                        );
                        return Err(as_unavailable(e));
                    }
                    Err(e) if !e.is_transient() => {
                        last_err = e.to_string();
                        break;
                    }
                    Err(e) => last_err = e.to_string(),
                }
                debug!(
                    path = %chunk.source_path,
                    sequence_index = chunk.sequence_index,
                    attempt,
                    "chunk embedding attempt failed: {last_err}"
                );
            }

            match vector {
                Some(vector) => embedded.push(StoredChunk {
                    chunk: chunk.clone(),
                    vector,
                }),
                None => {
                    warn!(
                        codebase_id = %self.codebase_id,
                        path = %chunk.source_path,
                        sequence_index = chunk.sequence_index,
                        "excluding chunk after failed embedding attempts: {last_err}"
                    );
                    failed.push(chunk.key());
                }
            }
        }
        Ok(())
    }
}

fn as_unavailable(err: QaError) -> QaError {
    match err {
        QaError::EmbeddingUnavailable(_) => err,
        other => QaError::EmbeddingUnavailable(other.to_string()),
    }
}
