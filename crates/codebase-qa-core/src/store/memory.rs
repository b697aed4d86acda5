//! In-memory [`ChunkStore`] and [`MetadataStore`] implementations.
//!
//! Use `HashMap`/`BTreeMap` behind `std::sync::RwLock`. Nothing survives
//! the process; intended for tests and ephemeral sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{QaError, Result};
use crate::models::{ChatEntry, ChunkKey, CodebaseRecord, FileFingerprint};

use super::{ChunkStore, MetadataStore, StoredChunk};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| QaError::Storage("in-memory store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| QaError::Storage("in-memory store lock poisoned".to_string()))
}

type Partition = BTreeMap<ChunkKey, StoredChunk>;

/// In-memory chunk store.
#[derive(Default)]
pub struct InMemoryChunkStore {
    partitions: RwLock<HashMap<String, Partition>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn load(&self, codebase_id: &str) -> Result<Vec<StoredChunk>> {
        let partitions = read(&self.partitions)?;
        Ok(partitions
            .get(codebase_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, codebase_id: &str, entries: &[StoredChunk]) -> Result<()> {
        let mut partitions = write(&self.partitions)?;
        let partition = partitions.entry(codebase_id.to_string()).or_default();
        for entry in entries {
            partition.insert(entry.chunk.key(), entry.clone());
        }
        Ok(())
    }

    async fn replace_file(
        &self,
        codebase_id: &str,
        source_path: &str,
        entries: &[StoredChunk],
    ) -> Result<()> {
        let mut partitions = write(&self.partitions)?;
        let partition = partitions.entry(codebase_id.to_string()).or_default();
        partition.retain(|key, _| key.source_path != source_path);
        for entry in entries {
            partition.insert(entry.chunk.key(), entry.clone());
        }
        Ok(())
    }

    async fn remove_file(&self, codebase_id: &str, source_path: &str) -> Result<usize> {
        let mut partitions = write(&self.partitions)?;
        let Some(partition) = partitions.get_mut(codebase_id) else {
            return Ok(0);
        };
        let before = partition.len();
        partition.retain(|key, _| key.source_path != source_path);
        Ok(before - partition.len())
    }

    async fn drop_codebase(&self, codebase_id: &str) -> Result<()> {
        write(&self.partitions)?.remove(codebase_id);
        Ok(())
    }
}

/// In-memory metadata store.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<BTreeMap<String, CodebaseRecord>>,
    manifests: RwLock<HashMap<String, BTreeMap<String, FileFingerprint>>>,
    chats: RwLock<HashMap<String, Vec<ChatEntry>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn load_records(&self) -> Result<Vec<CodebaseRecord>> {
        Ok(read(&self.records)?.values().cloned().collect())
    }

    async fn save_record(&self, record: &CodebaseRecord) -> Result<()> {
        write(&self.records)?.insert(record.codebase_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_codebase(&self, codebase_id: &str) -> Result<()> {
        write(&self.records)?.remove(codebase_id);
        write(&self.manifests)?.remove(codebase_id);
        write(&self.chats)?.remove(codebase_id);
        Ok(())
    }

    async fn load_manifest(&self, codebase_id: &str) -> Result<BTreeMap<String, FileFingerprint>> {
        Ok(read(&self.manifests)?
            .get(codebase_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_fingerprint(
        &self,
        codebase_id: &str,
        source_path: &str,
        fingerprint: &FileFingerprint,
    ) -> Result<()> {
        write(&self.manifests)?
            .entry(codebase_id.to_string())
            .or_default()
            .insert(source_path.to_string(), fingerprint.clone());
        Ok(())
    }

    async fn remove_fingerprint(&self, codebase_id: &str, source_path: &str) -> Result<()> {
        if let Some(manifest) = write(&self.manifests)?.get_mut(codebase_id) {
            manifest.remove(source_path);
        }
        Ok(())
    }

    async fn clear_manifest(&self, codebase_id: &str) -> Result<()> {
        write(&self.manifests)?.remove(codebase_id);
        Ok(())
    }

    async fn add_chat_entry(&self, entry: &ChatEntry) -> Result<()> {
        write(&self.chats)?
            .entry(entry.codebase_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn chat_history(&self, codebase_id: &str, limit: usize) -> Result<Vec<ChatEntry>> {
        let chats = read(&self.chats)?;
        Ok(chats
            .get(codebase_id)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;
    use chrono::Utc;

    fn stored(path: &str, seq: usize, text: &str) -> StoredChunk {
        StoredChunk {
            chunk: Chunk {
                source_path: path.to_string(),
                start_line: seq * 10 + 1,
                end_line: seq * 10 + 10,
                text: text.to_string(),
                sequence_index: seq,
                language_hint: "rust".to_string(),
            },
            vector: vec![seq as f32, 1.0],
        }
    }

    #[tokio::test]
    async fn chunk_partitions_are_isolated() {
        let store = InMemoryChunkStore::new();
        store.upsert("a", &[stored("x.rs", 0, "a0")]).await.unwrap();
        store.upsert("b", &[stored("x.rs", 0, "b0")]).await.unwrap();

        store.drop_codebase("a").await.unwrap();
        assert!(store.load("a").await.unwrap().is_empty());
        let b = store.load("b").await.unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].chunk.text, "b0");
    }

    #[tokio::test]
    async fn replace_file_swaps_only_that_file() {
        let store = InMemoryChunkStore::new();
        store
            .upsert(
                "a",
                &[stored("x.rs", 0, "x0"), stored("x.rs", 1, "x1"), stored("y.rs", 0, "y0")],
            )
            .await
            .unwrap();
        store
            .replace_file("a", "x.rs", &[stored("x.rs", 0, "new")])
            .await
            .unwrap();

        let texts: Vec<String> = store
            .load("a")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.chunk.text)
            .collect();
        assert_eq!(texts, vec!["new".to_string(), "y0".to_string()]);
        assert_eq!(store.remove_file("a", "y.rs").await.unwrap(), 1);
        assert_eq!(store.remove_file("missing", "y.rs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn chat_history_is_newest_first_and_deleted_with_codebase() {
        let store = InMemoryMetadataStore::new();
        store.save_record(&CodebaseRecord::new("a", "/repo")).await.unwrap();
        for q in ["first", "second", "third"] {
            store
                .add_chat_entry(&ChatEntry {
                    codebase_id: "a".into(),
                    question: q.into(),
                    answer: "ok".into(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let history = store.chat_history("a", 2).await.unwrap();
        let questions: Vec<&str> = history.iter().map(|e| e.question.as_str()).collect();
        assert_eq!(questions, vec!["third", "second"]);

        store.delete_codebase("a").await.unwrap();
        assert!(store.chat_history("a", 10).await.unwrap().is_empty());
        assert!(store.load_records().await.unwrap().is_empty());
    }
}
