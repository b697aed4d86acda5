//! Retrieval orchestrator: codebase lifecycle, ingestion, and query-time
//! context assembly.
//!
//! # Status machine
//!
//! ```text
//! Empty ──ingest──▶ Indexing ──success──▶ Ready ──new commits──▶ Stale
//!                      │  ▲                 │                      │
//!              failure ▼  └──── refresh ────┴──────────────────────┘
//!                    Failed ──refresh (manual)──▶ Indexing
//! ```
//!
//! Every transition is written to the [`MetadataStore`] before the next
//! step runs. Ingestion and refresh compare each file's SHA-256 against
//! the per-codebase manifest and only re-chunk and re-embed files that were
//! added or changed; files that disappeared are removed from the index.
//!
//! Operations that change one codebase (ingest, refresh, delete) hold that
//! codebase's operation lock for their whole run. Queries never take it.
//! Operation locks are never dropped, so every caller for an id contends
//! on the same lock even across a delete.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunk::{chunk_file, validate_window};
use crate::context::{assemble_context, RetrievedContext};
use crate::embedding::content_hash;
use crate::error::{QaError, Result};
use crate::models::{ChatEntry, CodebaseRecord, CodebaseStatus, FileFingerprint};
use crate::registry::IndexRegistry;
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::MetadataStore;

/// Supplies repository content and version information.
#[async_trait]
pub trait RepositoryLoader: Send + Sync {
    /// Every indexable file as `relative_path → text`.
    async fn get_files(&self, repo_ref: &str) -> Result<BTreeMap<String, String>>;

    /// Current HEAD commit, or `None` when the repository is not versioned.
    async fn head_commit(&self, repo_ref: &str) -> Result<Option<String>>;

    /// Whether the repository has moved past `since` (the last indexed commit).
    async fn has_new_commits(&self, repo_ref: &str, since: Option<&str>) -> Result<bool>;
}

/// Chunking and retrieval parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub chunk_size_lines: usize,
    pub overlap_lines: usize,
    /// Character cap on the assembled context.
    pub max_context_chars: usize,
    /// Retry policy for query-time embedding outages.
    pub query_retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_size_lines: 40,
            overlap_lines: 10,
            max_context_chars: 12_000,
            query_retry: RetryPolicy::default(),
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        validate_window(self.chunk_size_lines, self.overlap_lines)?;
        if self.max_context_chars == 0 {
            return Err(QaError::Configuration(
                "max_context_chars must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// What an ingest or refresh run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub chunks_added: usize,
    /// Chunks excluded because embedding kept failing.
    pub chunks_failed: usize,
}

/// Coordinates the registry, the metadata store, and the repository loader.
pub struct Orchestrator {
    registry: Arc<IndexRegistry>,
    metadata: Arc<dyn MetadataStore>,
    loader: Arc<dyn RepositoryLoader>,
    settings: PipelineSettings,
    records: RwLock<HashMap<String, CodebaseRecord>>,
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<IndexRegistry>,
        metadata: Arc<dyn MetadataStore>,
        loader: Arc<dyn RepositoryLoader>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            registry,
            metadata,
            loader,
            settings,
            records: RwLock::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Load persisted records. A record left in `Indexing` by an interrupted
    /// process comes back as `Failed`. Returns the number of records loaded.
    pub async fn restore(&self) -> Result<usize> {
        let stored = self.metadata.load_records().await?;
        let mut restored = Vec::with_capacity(stored.len());
        for mut record in stored {
            if record.status == CodebaseStatus::Indexing {
                warn!(codebase_id = %record.codebase_id, "indexing was interrupted, marking failed");
                record.status = CodebaseStatus::Failed;
                record.last_error = Some("indexing was interrupted".to_string());
                self.metadata.save_record(&record).await?;
            }
            restored.push(record);
        }

        let count = restored.len();
        let mut records = self.records.write().await;
        for record in restored {
            records.insert(record.codebase_id.clone(), record);
        }
        Ok(count)
    }

    /// Create the codebase record (status `Empty`) or update its descriptive fields.
    pub async fn register(
        &self,
        codebase_id: &str,
        repo_ref: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<CodebaseRecord> {
        let record = {
            let mut records = self.records.write().await;
            let record = records
                .entry(codebase_id.to_string())
                .or_insert_with(|| CodebaseRecord::new(codebase_id, repo_ref));
            record.repo_ref = repo_ref.to_string();
            if let Some(name) = name {
                record.name = name.to_string();
            }
            if let Some(description) = description {
                record.description = description.to_string();
            }
            record.clone()
        };
        self.metadata.save_record(&record).await?;
        Ok(record)
    }

    /// Index `files` into `codebase_id`, creating the codebase if needed.
    pub async fn ingest(
        &self,
        codebase_id: &str,
        files: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let lock = self.op_lock(codebase_id).await;
        let _guard = lock.lock().await;

        if !self.records.read().await.contains_key(codebase_id) {
            self.register(codebase_id, "", None, None).await?;
        }
        let previous = self.begin_indexing(codebase_id).await?;
        self.index_files(codebase_id, previous, files, None, cancel)
            .await
    }

    /// Register a repository and index it.
    pub async fn add(
        &self,
        codebase_id: &str,
        repo_ref: &str,
        name: Option<&str>,
        description: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        self.register(codebase_id, repo_ref, name, description)
            .await?;
        self.refresh(codebase_id, cancel).await
    }

    /// Reload the codebase's repository and re-index what changed.
    pub async fn refresh(&self, codebase_id: &str, cancel: &CancellationToken) -> Result<IngestReport> {
        let lock = self.op_lock(codebase_id).await;
        let _guard = lock.lock().await;
        self.refresh_locked(codebase_id, cancel).await
    }

    /// Drop the index and manifest, then re-index everything.
    ///
    /// Required after an [`QaError::EmbeddingDimensionMismatch`].
    pub async fn refresh_full(
        &self,
        codebase_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let lock = self.op_lock(codebase_id).await;
        let _guard = lock.lock().await;

        self.status(codebase_id).await?;
        self.registry.delete(codebase_id).await?;
        self.metadata.clear_manifest(codebase_id).await?;
        info!(codebase_id, "cleared index for full refresh");
        self.refresh_locked(codebase_id, cancel).await
    }

    /// Mark a `Ready` codebase `Stale` when its repository has new commits.
    ///
    /// Skipped while an ingest or refresh of the codebase is running.
    pub async fn check_for_updates(&self, codebase_id: &str) -> Result<CodebaseStatus> {
        let lock = self.op_lock(codebase_id).await;
        let Ok(_guard) = lock.try_lock() else {
            return Ok(self.status(codebase_id).await?.status);
        };

        let record = self.status(codebase_id).await?;
        if record.status != CodebaseStatus::Ready || record.repo_ref.is_empty() {
            return Ok(record.status);
        }
        let newer = self
            .loader
            .has_new_commits(&record.repo_ref, record.commit_hash.as_deref())
            .await?;
        if !newer {
            return Ok(record.status);
        }
        let record = self
            .update_record(codebase_id, |r| r.status = CodebaseStatus::Stale)
            .await?;
        info!(codebase_id, "repository has new commits, marked stale");
        Ok(record.status)
    }

    /// Destroy the codebase's index and forget it. Unknown ids are a no-op.
    pub async fn delete(&self, codebase_id: &str) -> Result<()> {
        let lock = self.op_lock(codebase_id).await;
        let _guard = lock.lock().await;

        // Unlist first so no query can reopen the index while it is torn down.
        let removed = self.records.write().await.remove(codebase_id);
        let teardown = async {
            self.registry.delete(codebase_id).await?;
            self.metadata.delete_codebase(codebase_id).await
        };
        if let Err(e) = teardown.await {
            if let Some(record) = removed {
                self.records
                    .write()
                    .await
                    .insert(codebase_id.to_string(), record);
            }
            return Err(e);
        }
        info!(codebase_id, "deleted codebase");
        Ok(())
    }

    /// Retrieve and assemble grounding context for `question`.
    ///
    /// Requires status `Ready` or `Stale`. Embedding outages are retried
    /// with backoff; no partial result is ever returned.
    pub async fn answer_query(
        &self,
        codebase_id: &str,
        question: &str,
        max_context_chunks: usize,
    ) -> Result<RetrievedContext> {
        if max_context_chunks == 0 {
            return Err(QaError::Configuration(
                "max_context_chunks must be >= 1".to_string(),
            ));
        }
        // The record stays listed while the index is resolved; `delete`
        // unlists it before destroying the index.
        let index = {
            let records = self.records.read().await;
            let record = records
                .get(codebase_id)
                .ok_or_else(|| QaError::NotFound(codebase_id.to_string()))?;
            if !record.status.is_queryable() {
                return Err(QaError::CodebaseNotReady {
                    codebase_id: codebase_id.to_string(),
                    status: record.status.to_string(),
                });
            }
            self.registry.get_or_create(codebase_id).await?
        };

        let ranked = with_backoff(self.settings.query_retry, "query embedding", || {
            index.query(question, max_context_chunks)
        })
        .await
        .map_err(|e| match e {
            QaError::IndexDestroyed(_) => QaError::NotFound(codebase_id.to_string()),
            other => other,
        })?;
        Ok(assemble_context(ranked, self.settings.max_context_chars))
    }

    /// Current record (status and statistics) of a codebase.
    pub async fn status(&self, codebase_id: &str) -> Result<CodebaseRecord> {
        self.records
            .read()
            .await
            .get(codebase_id)
            .cloned()
            .ok_or_else(|| QaError::NotFound(codebase_id.to_string()))
    }

    /// All known codebases, ordered by id.
    pub async fn list(&self) -> Vec<CodebaseRecord> {
        let records = self.records.read().await;
        let mut all: Vec<CodebaseRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.codebase_id.cmp(&b.codebase_id));
        all
    }

    /// Append a question/answer pair to the codebase's chat history.
    pub async fn record_exchange(&self, codebase_id: &str, question: &str, answer: &str) -> Result<()> {
        self.status(codebase_id).await?;
        self.metadata
            .add_chat_entry(&ChatEntry {
                codebase_id: codebase_id.to_string(),
                question: question.to_string(),
                answer: answer.to_string(),
                created_at: Utc::now(),
            })
            .await
    }

    pub async fn chat_history(&self, codebase_id: &str, limit: usize) -> Result<Vec<ChatEntry>> {
        self.status(codebase_id).await?;
        self.metadata.chat_history(codebase_id, limit).await
    }

    async fn op_lock(&self, codebase_id: &str) -> Arc<Mutex<()>> {
        self.op_locks
            .lock()
            .await
            .entry(codebase_id.to_string())
            .or_default()
            .clone()
    }

    async fn refresh_locked(&self, codebase_id: &str, cancel: &CancellationToken) -> Result<IngestReport> {
        let record = self.status(codebase_id).await?;
        if record.repo_ref.is_empty() {
            return Err(QaError::Configuration(format!(
                "codebase '{codebase_id}' has no repository to refresh from"
            )));
        }

        let previous = self.begin_indexing(codebase_id).await?;
        let files = match self.loader.get_files(&record.repo_ref).await {
            Ok(files) => files,
            Err(e) => return self.fail(codebase_id, e).await,
        };
        let commit = match self.loader.head_commit(&record.repo_ref).await {
            Ok(commit) => commit,
            Err(e) => {
                warn!(codebase_id, "could not read head commit: {e}");
                None
            }
        };
        self.index_files(codebase_id, previous, files, commit, cancel)
            .await
    }

    /// Move to `Indexing`, returning the record as it was before.
    async fn begin_indexing(&self, codebase_id: &str) -> Result<CodebaseRecord> {
        let previous = self.status(codebase_id).await?;
        self.update_record(codebase_id, |r| r.status = CodebaseStatus::Indexing)
            .await?;
        info!(codebase_id, from = %previous.status, "indexing started");
        Ok(previous)
    }

    async fn index_files(
        &self,
        codebase_id: &str,
        previous: CodebaseRecord,
        files: BTreeMap<String, String>,
        commit: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let index = match self.registry.get_or_create(codebase_id).await {
            Ok(index) => index,
            Err(e) => return self.fail(codebase_id, e).await,
        };
        let manifest = match self.metadata.load_manifest(codebase_id).await {
            Ok(manifest) => manifest,
            Err(e) => return self.fail(codebase_id, e).await,
        };
        let indexed = match index.file_paths().await {
            Ok(paths) => paths,
            Err(e) => return self.fail(codebase_id, e).await,
        };

        let mut report = IngestReport::default();
        let mut attempted = 0usize;

        let vanished: BTreeSet<&String> = manifest
            .keys()
            .chain(indexed.iter())
            .filter(|path| !files.contains_key(*path))
            .collect();
        for path in vanished {
            if cancel.is_cancelled() {
                return self.cancelled(codebase_id, &previous).await;
            }
            if let Err(e) = index.remove_file(path).await {
                return self.fail(codebase_id, e).await;
            }
            if let Err(e) = self.metadata.remove_fingerprint(codebase_id, path).await {
                return self.fail(codebase_id, e).await;
            }
            report.files_removed += 1;
        }

        for (path, text) in &files {
            if cancel.is_cancelled() {
                return self.cancelled(codebase_id, &previous).await;
            }

            let hash = content_hash(text);
            if manifest
                .get(path)
                .is_some_and(|fp| fp.content_hash == hash)
            {
                report.files_unchanged += 1;
                continue;
            }

            let chunks = match chunk_file(
                path,
                text,
                self.settings.chunk_size_lines,
                self.settings.overlap_lines,
            ) {
                Ok(chunks) => chunks,
                Err(e) => return self.fail(codebase_id, e).await,
            };
            attempted += chunks.len();

            let upsert = match index.replace_file(path, &chunks).await {
                Ok(upsert) => upsert,
                Err(e) => return self.fail(codebase_id, e).await,
            };
            report.files_indexed += 1;
            report.chunks_added += upsert.added;
            report.chunks_failed += upsert.failed.len();

            // Files with excluded chunks stay out of the manifest so the next
            // refresh retries them.
            let manifest_write = if upsert.failed.is_empty() {
                let fingerprint = FileFingerprint {
                    content_hash: hash,
                    chunk_count: upsert.added,
                };
                self.metadata
                    .put_fingerprint(codebase_id, path, &fingerprint)
                    .await
            } else {
                self.metadata.remove_fingerprint(codebase_id, path).await
            };
            if let Err(e) = manifest_write {
                return self.fail(codebase_id, e).await;
            }
        }

        if attempted > 0 && report.chunks_added == 0 {
            let err = QaError::EmbeddingUnavailable(format!(
                "none of {attempted} chunks could be embedded"
            ));
            return self.fail(codebase_id, err).await;
        }

        let stats = match index.stats().await {
            Ok(stats) => stats,
            Err(e) => return self.fail(codebase_id, e).await,
        };
        let degraded = report.chunks_failed;
        let record = self
            .update_record(codebase_id, |r| {
                r.status = CodebaseStatus::Ready;
                r.chunk_count = stats.chunk_count;
                r.file_count = stats.file_count;
                r.degraded_chunks = degraded;
                r.last_error = None;
                r.last_indexed_at = Some(Utc::now());
                if commit.is_some() {
                    r.commit_hash = commit;
                }
            })
            .await?;

        if degraded > 0 {
            warn!(codebase_id, degraded, "indexing finished with excluded chunks");
        }
        info!(
            codebase_id,
            files = record.file_count,
            chunks = record.chunk_count,
            indexed = report.files_indexed,
            unchanged = report.files_unchanged,
            removed = report.files_removed,
            "indexing finished"
        );
        Ok(report)
    }

    /// Record the failure and return it.
    async fn fail<T>(&self, codebase_id: &str, err: QaError) -> Result<T> {
        warn!(codebase_id, "indexing failed: {err}");
        let message = err.to_string();
        let stats = match self.registry.get(codebase_id).await {
            Ok(index) => index.stats().await.ok(),
            Err(_) => None,
        };
        let saved = self
            .update_record(codebase_id, |r| {
                r.status = CodebaseStatus::Failed;
                r.last_error = Some(message);
                if let Some(stats) = stats {
                    r.chunk_count = stats.chunk_count;
                    r.file_count = stats.file_count;
                }
            })
            .await;
        if let Err(e) = saved {
            warn!(codebase_id, "could not record failure: {e}");
        }
        Err(err)
    }

    /// Stop a run early. Content indexed before still counts, so a codebase
    /// that was queryable becomes `Stale`; one that never finished becomes `Failed`.
    async fn cancelled<T>(&self, codebase_id: &str, previous: &CodebaseRecord) -> Result<T> {
        let status = if previous.last_indexed_at.is_some() {
            CodebaseStatus::Stale
        } else {
            CodebaseStatus::Failed
        };
        let stats = match self.registry.get(codebase_id).await {
            Ok(index) => index.stats().await.ok(),
            Err(_) => None,
        };
        warn!(codebase_id, %status, "indexing cancelled");
        self.update_record(codebase_id, |r| {
            r.status = status;
            r.last_error = Some(QaError::Cancelled.to_string());
            if let Some(stats) = stats {
                r.chunk_count = stats.chunk_count;
                r.file_count = stats.file_count;
            }
        })
        .await?;
        Err(QaError::Cancelled)
    }

    async fn update_record<F>(&self, codebase_id: &str, apply: F) -> Result<CodebaseRecord>
    where
        F: FnOnce(&mut CodebaseRecord),
    {
        let snapshot = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(codebase_id)
                .ok_or_else(|| QaError::NotFound(codebase_id.to_string()))?;
            apply(record);
            record.clone()
        };
        self.metadata.save_record(&snapshot).await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexOptions;
    use crate::store::memory::{InMemoryChunkStore, InMemoryMetadataStore};
    use crate::store::ChunkStore;
    use crate::testing::{FixedDimsEmbedder, KeywordEmbedder};
    use crate::embedding::Embedder;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const VOCAB: &[&str] = &["alpha", "omega", "beta", "gamma"];

    /// Serves fixed file maps and commit ids per repo reference.
    #[derive(Default)]
    struct StaticLoader {
        repos: StdMutex<HashMap<String, (BTreeMap<String, String>, Option<String>)>>,
    }

    impl StaticLoader {
        fn set(&self, repo_ref: &str, files: &[(&str, &str)], commit: Option<&str>) {
            let files = files
                .iter()
                .map(|(p, t)| (p.to_string(), t.to_string()))
                .collect();
            self.repos
                .lock()
                .unwrap()
                .insert(repo_ref.to_string(), (files, commit.map(str::to_string)));
        }
    }

    #[async_trait]
    impl RepositoryLoader for StaticLoader {
        async fn get_files(&self, repo_ref: &str) -> Result<BTreeMap<String, String>> {
            self.repos
                .lock()
                .unwrap()
                .get(repo_ref)
                .map(|(files, _)| files.clone())
                .ok_or_else(|| QaError::Repository(format!("cannot read {repo_ref}")))
        }

        async fn head_commit(&self, repo_ref: &str) -> Result<Option<String>> {
            Ok(self
                .repos
                .lock()
                .unwrap()
                .get(repo_ref)
                .and_then(|(_, c)| c.clone()))
        }

        async fn has_new_commits(&self, repo_ref: &str, since: Option<&str>) -> Result<bool> {
            let head = self.head_commit(repo_ref).await?;
            Ok(head.as_deref() != since)
        }
    }

    /// Metadata store that remembers every status it was asked to save.
    #[derive(Default)]
    struct RecordingMetadata {
        inner: InMemoryMetadataStore,
        statuses: StdMutex<Vec<CodebaseStatus>>,
    }

    #[async_trait]
    impl MetadataStore for RecordingMetadata {
        async fn load_records(&self) -> Result<Vec<CodebaseRecord>> {
            self.inner.load_records().await
        }
        async fn save_record(&self, record: &CodebaseRecord) -> Result<()> {
            self.statuses.lock().unwrap().push(record.status);
            self.inner.save_record(record).await
        }
        async fn delete_codebase(&self, codebase_id: &str) -> Result<()> {
            self.inner.delete_codebase(codebase_id).await
        }
        async fn load_manifest(&self, codebase_id: &str) -> Result<BTreeMap<String, FileFingerprint>> {
            self.inner.load_manifest(codebase_id).await
        }
        async fn put_fingerprint(
            &self,
            codebase_id: &str,
            source_path: &str,
            fingerprint: &FileFingerprint,
        ) -> Result<()> {
            self.inner
                .put_fingerprint(codebase_id, source_path, fingerprint)
                .await
        }
        async fn remove_fingerprint(&self, codebase_id: &str, source_path: &str) -> Result<()> {
            self.inner.remove_fingerprint(codebase_id, source_path).await
        }
        async fn clear_manifest(&self, codebase_id: &str) -> Result<()> {
            self.inner.clear_manifest(codebase_id).await
        }
        async fn add_chat_entry(&self, entry: &ChatEntry) -> Result<()> {
            self.inner.add_chat_entry(entry).await
        }
        async fn chat_history(&self, codebase_id: &str, limit: usize) -> Result<Vec<ChatEntry>> {
            self.inner.chat_history(codebase_id, limit).await
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        embedder: Arc<KeywordEmbedder>,
        loader: Arc<StaticLoader>,
        metadata: Arc<RecordingMetadata>,
        chunks: Arc<InMemoryChunkStore>,
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            query_retry: RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            ..PipelineSettings::default()
        }
    }

    fn build(
        embedder: Arc<dyn Embedder>,
        loader: Arc<StaticLoader>,
        metadata: Arc<RecordingMetadata>,
        chunks: Arc<InMemoryChunkStore>,
    ) -> Orchestrator {
        let registry = Arc::new(IndexRegistry::new(
            embedder,
            chunks,
            IndexOptions {
                batch_size: 8,
                chunk_attempts: 2,
            },
        ));
        Orchestrator::new(registry, metadata, loader, settings()).unwrap()
    }

    fn harness() -> Harness {
        let embedder = Arc::new(KeywordEmbedder::new(VOCAB));
        let loader = Arc::new(StaticLoader::default());
        let metadata = Arc::new(RecordingMetadata::default());
        let chunks = Arc::new(InMemoryChunkStore::new());
        let orchestrator = build(embedder.clone(), loader.clone(), metadata.clone(), chunks.clone());
        Harness {
            orchestrator,
            embedder,
            loader,
            metadata,
            chunks,
        }
    }

    /// 100 lines: 1-60 say "alpha", 61-100 say "omega".
    fn hundred_line_file() -> String {
        (1..=100)
            .map(|i| {
                if i <= 60 {
                    format!("let alpha_{i} = alpha;\n")
                } else {
                    format!("let omega_{i} = omega;\n")
                }
            })
            .collect()
    }

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, t)| (p.to_string(), t.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn single_file_scenario() {
        let h = harness();
        let text = hundred_line_file();
        let report = h
            .orchestrator
            .ingest("demo", files(&[("src/main.rs", &text)]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.chunks_added, 3);

        assert_eq!(
            *h.metadata.statuses.lock().unwrap(),
            vec![CodebaseStatus::Empty, CodebaseStatus::Indexing, CodebaseStatus::Ready]
        );
        let record = h.orchestrator.status("demo").await.unwrap();
        assert_eq!(record.status, CodebaseStatus::Ready);
        assert_eq!((record.chunk_count, record.file_count), (3, 1));
        assert!(record.last_indexed_at.is_some());

        let ctx = h
            .orchestrator
            .answer_query("demo", "what does omega on line 65 do?", 1)
            .await
            .unwrap();
        assert_eq!(ctx.ranked_chunks.len(), 1);
        let top = &ctx.ranked_chunks[0].chunk;
        assert_eq!((top.start_line, top.end_line, top.sequence_index), (61, 100, 2));
        assert!(ctx.context.starts_with("### src/main.rs (lines 61-100)\n"));
    }

    #[tokio::test]
    async fn query_requires_ready_codebase() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.answer_query("ghost", "q", 3).await,
            Err(QaError::NotFound(_))
        ));

        h.orchestrator
            .register("empty", "/repo", None, None)
            .await
            .unwrap();
        match h.orchestrator.answer_query("empty", "q", 3).await {
            Err(QaError::CodebaseNotReady { status, .. }) => assert_eq!(status, "empty"),
            other => panic!("expected CodebaseNotReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ready_codebase_without_chunks_answers_empty() {
        let h = harness();
        h.orchestrator
            .ingest("blank", BTreeMap::new(), &CancellationToken::new())
            .await
            .unwrap();
        let ctx = h.orchestrator.answer_query("blank", "anything", 3).await.unwrap();
        assert!(ctx.is_empty());
        assert_eq!(ctx.context, "");
    }

    #[tokio::test]
    async fn refresh_only_reembeds_changed_files() {
        let h = harness();
        h.loader.set(
            "repo",
            &[("a.rs", "alpha\n"), ("b.rs", "beta\n"), ("c.rs", "gamma\n")],
            Some("c1"),
        );
        let cancel = CancellationToken::new();
        h.orchestrator
            .add("cb", "repo", Some("Demo"), None, &cancel)
            .await
            .unwrap();
        assert_eq!(h.orchestrator.status("cb").await.unwrap().commit_hash.as_deref(), Some("c1"));
        let embedded = h.embedder.texts_embedded.load(Ordering::SeqCst);

        h.loader.set(
            "repo",
            &[("a.rs", "alpha\n"), ("b.rs", "beta beta omega\n"), ("d.rs", "omega\n")],
            Some("c2"),
        );
        let report = h.orchestrator.refresh("cb", &cancel).await.unwrap();
        assert_eq!(report.files_unchanged, 1);
        assert_eq!(report.files_indexed, 2);
        assert_eq!(report.files_removed, 1);
        assert_eq!(h.embedder.texts_embedded.load(Ordering::SeqCst), embedded + 2);

        let record = h.orchestrator.status("cb").await.unwrap();
        assert_eq!(record.name, "Demo");
        assert_eq!(record.file_count, 3);
        assert_eq!(record.commit_hash.as_deref(), Some("c2"));

        let ctx = h.orchestrator.answer_query("cb", "gamma", 10).await.unwrap();
        assert!(ctx.ranked_chunks.iter().all(|r| r.chunk.source_path != "c.rs"));
    }

    #[tokio::test]
    async fn unreadable_repository_fails_and_can_be_retried() {
        let h = harness();
        let cancel = CancellationToken::new();
        let err = h
            .orchestrator
            .add("cb", "missing", None, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::Repository(_)));
        let record = h.orchestrator.status("cb").await.unwrap();
        assert_eq!(record.status, CodebaseStatus::Failed);
        assert!(record.last_error.unwrap().contains("cannot read missing"));

        h.loader.set("missing", &[("a.rs", "alpha\n")], None);
        h.orchestrator.refresh("cb", &cancel).await.unwrap();
        assert_eq!(h.orchestrator.status("cb").await.unwrap().status, CodebaseStatus::Ready);
    }

    #[tokio::test]
    async fn total_embedding_outage_fails_ingest() {
        let h = harness();
        h.embedder.set_offline(true);
        let err = h
            .orchestrator
            .ingest("cb", files(&[("a.rs", "alpha\n"), ("b.rs", "beta\n")]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::EmbeddingUnavailable(_)));
        assert_eq!(h.orchestrator.status("cb").await.unwrap().status, CodebaseStatus::Failed);

        h.embedder.set_offline(false);
        h.orchestrator
            .ingest("cb", files(&[("a.rs", "alpha\n"), ("b.rs", "beta\n")]), &CancellationToken::new())
            .await
            .unwrap();
        let record = h.orchestrator.status("cb").await.unwrap();
        assert_eq!(record.status, CodebaseStatus::Ready);
        assert_eq!(record.chunk_count, 2);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn embedding_outage_gives_up_after_first_file() {
        let h = harness();
        h.embedder.set_offline(true);
        let text = hundred_line_file();
        let names: Vec<String> = (0..20).map(|i| format!("src/file_{i:02}.rs")).collect();
        let input: BTreeMap<String, String> =
            names.iter().map(|n| (n.clone(), text.clone())).collect();

        let err = h
            .orchestrator
            .ingest("cb", input, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::EmbeddingUnavailable(_)));
        // one batch for the first file, then one single-chunk call
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.orchestrator.status("cb").await.unwrap().status, CodebaseStatus::Failed);
        assert!(h.metadata.inner.load_manifest("cb").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_failures_degrade_but_complete() {
        let h = harness();
        h.embedder.poison("broken");
        let input = files(&[("good.rs", "alpha\n"), ("bad.rs", "broken\n")]);
        let report = h
            .orchestrator
            .ingest("cb", input.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.chunks_failed, 1);
        let record = h.orchestrator.status("cb").await.unwrap();
        assert_eq!(record.status, CodebaseStatus::Ready);
        assert_eq!(record.degraded_chunks, 1);
        assert_eq!(record.chunk_count, 1);

        // the degraded file is retried on the next run, the good one is not
        h.embedder.clear_poison();
        let report = h
            .orchestrator
            .ingest("cb", input, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.files_unchanged, 1);
        assert_eq!(report.files_indexed, 1);
        assert_eq!(h.orchestrator.status("cb").await.unwrap().degraded_chunks, 0);
    }

    #[tokio::test]
    async fn cancellation_leaves_index_untouched() {
        let h = harness();
        let input = files(&[("a.rs", "alpha\n")]);
        h.orchestrator
            .ingest("cb", input, &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h
            .orchestrator
            .ingest("cb", files(&[("a.rs", "omega\n"), ("b.rs", "beta\n")]), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, QaError::Cancelled);

        let record = h.orchestrator.status("cb").await.unwrap();
        assert_eq!(record.status, CodebaseStatus::Stale);
        let ctx = h.orchestrator.answer_query("cb", "alpha", 5).await.unwrap();
        assert_eq!(ctx.ranked_chunks.len(), 1);
        assert_eq!(ctx.ranked_chunks[0].chunk.text, "alpha\n");

        let fresh = CancellationToken::new();
        fresh.cancel();
        h.orchestrator
            .ingest("new", files(&[("x.rs", "alpha\n")]), &fresh)
            .await
            .unwrap_err();
        assert_eq!(h.orchestrator.status("new").await.unwrap().status, CodebaseStatus::Failed);
    }

    /// Cancels `token` once `embed` has been called `after` times.
    struct CancelAfterCalls {
        inner: Arc<KeywordEmbedder>,
        token: CancellationToken,
        after: usize,
    }

    #[async_trait]
    impl Embedder for CancelAfterCalls {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }

        fn dims(&self) -> usize {
            self.inner.dims()
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let out = self.inner.embed(texts).await;
            if self.inner.calls.load(Ordering::SeqCst) >= self.after {
                self.token.cancel();
            }
            out
        }
    }

    #[tokio::test]
    async fn cancellation_mid_run_keeps_finished_files() {
        let keyword = Arc::new(KeywordEmbedder::new(VOCAB));
        let cancel = CancellationToken::new();
        let embedder = Arc::new(CancelAfterCalls {
            inner: keyword.clone(),
            token: cancel.clone(),
            // first run embeds a.rs and b.rs, the second run stops after a.rs
            after: 3,
        });
        let metadata = Arc::new(RecordingMetadata::default());
        let chunks = Arc::new(InMemoryChunkStore::new());
        let orchestrator = build(
            embedder,
            Arc::new(StaticLoader::default()),
            metadata.clone(),
            chunks.clone(),
        );

        orchestrator
            .ingest("cb", files(&[("a.rs", "alpha\n"), ("b.rs", "beta\n")]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(keyword.calls.load(Ordering::SeqCst), 2);

        let new_a: String = (0..50).map(|_| "omega\n").collect();
        let err = orchestrator
            .ingest("cb", files(&[("a.rs", new_a.as_str()), ("b.rs", "gamma\n")]), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, QaError::Cancelled);

        // a.rs was fully replaced: 50 lines at 40/10 give two chunks
        let stored = chunks.load("cb").await.unwrap();
        let a_chunks: Vec<_> = stored.iter().filter(|e| e.chunk.source_path == "a.rs").collect();
        assert_eq!(a_chunks.len(), 2);
        assert!(a_chunks.iter().all(|e| e.chunk.text.starts_with("omega")));
        assert_eq!(
            (a_chunks[1].chunk.start_line, a_chunks[1].chunk.end_line),
            (31, 50)
        );

        // b.rs was never reached and keeps its old chunk
        let b_chunks: Vec<_> = stored.iter().filter(|e| e.chunk.source_path == "b.rs").collect();
        assert_eq!(b_chunks.len(), 1);
        assert_eq!(b_chunks[0].chunk.text, "beta\n");

        let manifest = metadata.inner.load_manifest("cb").await.unwrap();
        assert_eq!(manifest["a.rs"].content_hash, content_hash(&new_a));
        assert_eq!(manifest["a.rs"].chunk_count, 2);
        assert_eq!(manifest["b.rs"].content_hash, content_hash("beta\n"));
        let indexed: BTreeSet<String> = stored.iter().map(|e| e.chunk.source_path.clone()).collect();
        assert_eq!(manifest.keys().cloned().collect::<BTreeSet<_>>(), indexed);

        let record = orchestrator.status("cb").await.unwrap();
        assert_eq!(record.status, CodebaseStatus::Stale);
        assert_eq!(record.chunk_count, 3);
        let ctx = orchestrator.answer_query("cb", "beta", 1).await.unwrap();
        assert_eq!(ctx.ranked_chunks[0].chunk.source_path, "b.rs");
    }

    #[tokio::test]
    async fn delete_removes_everything_and_is_idempotent() {
        let h = harness();
        h.orchestrator
            .ingest("cb", files(&[("a.rs", "alpha\n")]), &CancellationToken::new())
            .await
            .unwrap();
        h.orchestrator.record_exchange("cb", "q", "a").await.unwrap();

        h.orchestrator.delete("cb").await.unwrap();
        assert!(matches!(h.orchestrator.status("cb").await, Err(QaError::NotFound(_))));
        assert!(matches!(
            h.orchestrator.answer_query("cb", "alpha", 1).await,
            Err(QaError::NotFound(_))
        ));
        assert!(h.chunks.load("cb").await.unwrap().is_empty());
        assert!(h.metadata.inner.chat_history("cb", 10).await.unwrap().is_empty());

        h.orchestrator.delete("cb").await.unwrap();
        h.orchestrator.delete("never").await.unwrap();
    }

    #[tokio::test]
    async fn operation_lock_outlives_delete() {
        let h = harness();
        h.orchestrator
            .ingest("cb", files(&[("a.rs", "alpha\n")]), &CancellationToken::new())
            .await
            .unwrap();

        let before = h.orchestrator.op_lock("cb").await;
        h.orchestrator.delete("cb").await.unwrap();
        let after = h.orchestrator.op_lock("cb").await;

        assert!(Arc::ptr_eq(&before, &after));
        let _held = before.lock().await;
        assert!(after.try_lock().is_err());
    }

    #[tokio::test]
    async fn queries_racing_delete_do_not_resurrect_index() {
        let h = harness();
        h.orchestrator
            .ingest("cb", files(&[("a.rs", "alpha\n")]), &CancellationToken::new())
            .await
            .unwrap();
        assert!(h.orchestrator.registry.list_ids().await.contains("cb"));

        let (deleted, q1, q2) = tokio::join!(
            h.orchestrator.delete("cb"),
            h.orchestrator.answer_query("cb", "alpha", 1),
            h.orchestrator.answer_query("cb", "alpha", 1),
        );
        deleted.unwrap();
        for outcome in [q1, q2] {
            match outcome {
                Ok(_) | Err(QaError::NotFound(_)) => {}
                Err(e) => panic!("unexpected query error: {e}"),
            }
        }

        assert!(!h.orchestrator.registry.list_ids().await.contains("cb"));
        assert!(matches!(
            h.orchestrator.answer_query("cb", "alpha", 1).await,
            Err(QaError::NotFound(_))
        ));
        assert!(!h.orchestrator.registry.list_ids().await.contains("cb"));
    }

    #[tokio::test]
    async fn new_commits_mark_stale_and_queries_still_serve() {
        let h = harness();
        h.loader.set("repo", &[("a.rs", "alpha\n")], Some("c1"));
        let cancel = CancellationToken::new();
        h.orchestrator.add("cb", "repo", None, None, &cancel).await.unwrap();
        assert_eq!(h.orchestrator.check_for_updates("cb").await.unwrap(), CodebaseStatus::Ready);

        h.loader.set("repo", &[("a.rs", "alpha omega\n")], Some("c2"));
        assert_eq!(h.orchestrator.check_for_updates("cb").await.unwrap(), CodebaseStatus::Stale);
        assert_eq!(
            h.orchestrator.answer_query("cb", "alpha", 1).await.unwrap().ranked_chunks[0]
                .chunk
                .text,
            "alpha\n"
        );

        h.orchestrator.refresh("cb", &cancel).await.unwrap();
        assert_eq!(h.orchestrator.status("cb").await.unwrap().status, CodebaseStatus::Ready);
    }

    #[tokio::test]
    async fn query_retries_transient_embedding_failures() {
        let h = harness();
        h.orchestrator
            .ingest("cb", files(&[("a.rs", "alpha\n")]), &CancellationToken::new())
            .await
            .unwrap();

        h.embedder.fail_next(2);
        let ctx = h.orchestrator.answer_query("cb", "alpha", 1).await.unwrap();
        assert_eq!(ctx.ranked_chunks.len(), 1);

        h.embedder.set_offline(true);
        assert!(matches!(
            h.orchestrator.answer_query("cb", "alpha", 1).await,
            Err(QaError::EmbeddingUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn restore_marks_interrupted_runs_failed() {
        let h = harness();
        h.orchestrator
            .ingest("done", files(&[("a.rs", "alpha\n")]), &CancellationToken::new())
            .await
            .unwrap();
        let mut interrupted = CodebaseRecord::new("half", "/repo");
        interrupted.status = CodebaseStatus::Indexing;
        h.metadata.inner.save_record(&interrupted).await.unwrap();

        let restarted = build(
            h.embedder.clone(),
            h.loader.clone(),
            h.metadata.clone(),
            h.chunks.clone(),
        );
        assert_eq!(restarted.restore().await.unwrap(), 2);
        let half = restarted.status("half").await.unwrap();
        assert_eq!(half.status, CodebaseStatus::Failed);
        assert!(half.last_error.is_some());

        // the reopened index serves without re-embedding stored chunks
        let embedded = h.embedder.texts_embedded.load(Ordering::SeqCst);
        let ctx = restarted.answer_query("done", "alpha", 1).await.unwrap();
        assert_eq!(ctx.ranked_chunks.len(), 1);
        assert_eq!(h.embedder.texts_embedded.load(Ordering::SeqCst), embedded + 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_needs_full_refresh() {
        let h = harness();
        let loader = h.loader.clone();
        loader.set("repo", &[("a.rs", "alpha\n"), ("b.rs", "beta\n")], None);

        let four = build(
            Arc::new(FixedDimsEmbedder(4)),
            loader.clone(),
            h.metadata.clone(),
            h.chunks.clone(),
        );
        let cancel = CancellationToken::new();
        four.add("cb", "repo", None, None, &cancel).await.unwrap();

        loader.set("repo", &[("a.rs", "alpha\n"), ("b.rs", "beta changed\n")], None);
        let eight = build(
            Arc::new(FixedDimsEmbedder(8)),
            loader.clone(),
            h.metadata.clone(),
            h.chunks.clone(),
        );
        eight.restore().await.unwrap();
        let err = eight.refresh("cb", &cancel).await.unwrap_err();
        assert!(matches!(err, QaError::EmbeddingDimensionMismatch { .. }));
        assert_eq!(eight.status("cb").await.unwrap().status, CodebaseStatus::Failed);

        let report = eight.refresh_full("cb", &cancel).await.unwrap();
        assert_eq!(report.files_indexed, 2);
        assert_eq!(eight.status("cb").await.unwrap().status, CodebaseStatus::Ready);
        assert_eq!(eight.answer_query("cb", "alpha", 5).await.unwrap().ranked_chunks.len(), 2);
    }

    #[tokio::test]
    async fn refresh_without_repository_is_rejected() {
        let h = harness();
        h.orchestrator
            .ingest("cb", files(&[("a.rs", "alpha\n")]), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            h.orchestrator.refresh("cb", &CancellationToken::new()).await,
            Err(QaError::Configuration(_))
        ));
        assert!(matches!(
            h.orchestrator.refresh("ghost", &CancellationToken::new()).await,
            Err(QaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let registry = Arc::new(IndexRegistry::new(
            Arc::new(KeywordEmbedder::new(VOCAB)),
            Arc::new(InMemoryChunkStore::new()),
            IndexOptions::default(),
        ));
        let bad = PipelineSettings {
            chunk_size_lines: 10,
            overlap_lines: 10,
            ..PipelineSettings::default()
        };
        let result = Orchestrator::new(
            registry,
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(StaticLoader::default()),
            bad,
        );
        assert!(matches!(result, Err(QaError::Configuration(_))));
    }
}
