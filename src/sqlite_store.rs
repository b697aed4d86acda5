//! SQLite-backed [`ChunkStore`] and [`MetadataStore`] implementations.
//!
//! Both wrap a shared [`SqlitePool`] against the schema created by
//! [`migrate::apply`](crate::migrate::apply). Multi-statement operations
//! run in a transaction so a file's chunk set is swapped all at once.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use codebase_qa_core::embedding::{blob_to_vec, vec_to_blob};
use codebase_qa_core::models::{ChatEntry, Chunk, CodebaseRecord, FileFingerprint};
use codebase_qa_core::store::{ChunkStore, MetadataStore, StoredChunk};
use codebase_qa_core::{QaError, Result};

fn storage(err: sqlx::Error) -> QaError {
    QaError::Storage(err.to_string())
}

fn to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

/// SQLite implementation of [`ChunkStore`].
pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_stored_chunk(row: &SqliteRow) -> std::result::Result<StoredChunk, sqlx::Error> {
    let blob: Vec<u8> = row.try_get("vector")?;
    Ok(StoredChunk {
        chunk: Chunk {
            source_path: row.try_get("source_path")?,
            start_line: row.try_get::<i64, _>("start_line")? as usize,
            end_line: row.try_get::<i64, _>("end_line")? as usize,
            text: row.try_get("text")?,
            sequence_index: row.try_get::<i64, _>("sequence_index")? as usize,
            language_hint: row.try_get("language_hint")?,
        },
        vector: blob_to_vec(&blob),
    })
}

async fn insert_chunk(
    conn: &mut sqlx::SqliteConnection,
    codebase_id: &str,
    entry: &StoredChunk,
) -> std::result::Result<(), sqlx::Error> {
    let c = &entry.chunk;
    sqlx::query(
        r#"
        INSERT INTO chunks (codebase_id, source_path, sequence_index, start_line, end_line,
                            language_hint, text, dims, vector)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(codebase_id, source_path, sequence_index) DO UPDATE SET
            start_line = excluded.start_line,
            end_line = excluded.end_line,
            language_hint = excluded.language_hint,
            text = excluded.text,
            dims = excluded.dims,
            vector = excluded.vector
        "#,
    )
    .bind(codebase_id)
    .bind(&c.source_path)
    .bind(c.sequence_index as i64)
    .bind(c.start_line as i64)
    .bind(c.end_line as i64)
    .bind(&c.language_hint)
    .bind(&c.text)
    .bind(entry.vector.len() as i64)
    .bind(vec_to_blob(&entry.vector))
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn load(&self, codebase_id: &str) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT source_path, sequence_index, start_line, end_line, language_hint, text, vector
            FROM chunks
            WHERE codebase_id = ?
            ORDER BY source_path, sequence_index
            "#,
        )
        .bind(codebase_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| row_to_stored_chunk(row).map_err(storage))
            .collect()
    }

    async fn upsert(&self, codebase_id: &str, entries: &[StoredChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for entry in entries {
            insert_chunk(&mut *tx, codebase_id, entry)
                .await
                .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)
    }

    async fn replace_file(
        &self,
        codebase_id: &str,
        source_path: &str,
        entries: &[StoredChunk],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query("DELETE FROM chunks WHERE codebase_id = ? AND source_path = ?")
            .bind(codebase_id)
            .bind(source_path)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        for entry in entries {
            insert_chunk(&mut *tx, codebase_id, entry)
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)
    }

    async fn remove_file(&self, codebase_id: &str, source_path: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM chunks WHERE codebase_id = ? AND source_path = ?")
            .bind(codebase_id)
            .bind(source_path)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() as usize)
    }

    async fn drop_codebase(&self, codebase_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE codebase_id = ?")
            .bind(codebase_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

/// SQLite implementation of [`MetadataStore`].
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &SqliteRow) -> Result<CodebaseRecord> {
    let status: String = row.try_get("status").map_err(storage)?;
    let last_indexed_at: Option<i64> = row.try_get("last_indexed_at").map_err(storage)?;
    Ok(CodebaseRecord {
        codebase_id: row.try_get("codebase_id").map_err(storage)?,
        name: row.try_get("name").map_err(storage)?,
        repo_ref: row.try_get("repo_ref").map_err(storage)?,
        description: row.try_get("description").map_err(storage)?,
        status: status.parse()?,
        chunk_count: row.try_get::<i64, _>("chunk_count").map_err(storage)? as usize,
        file_count: row.try_get::<i64, _>("file_count").map_err(storage)? as usize,
        degraded_chunks: row.try_get::<i64, _>("degraded_chunks").map_err(storage)? as usize,
        commit_hash: row.try_get("commit_hash").map_err(storage)?,
        last_error: row.try_get("last_error").map_err(storage)?,
        created_at: to_datetime(row.try_get("created_at").map_err(storage)?),
        last_indexed_at: last_indexed_at.map(to_datetime),
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn load_records(&self) -> Result<Vec<CodebaseRecord>> {
        let rows = sqlx::query("SELECT * FROM codebases ORDER BY codebase_id")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn save_record(&self, record: &CodebaseRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO codebases (codebase_id, name, repo_ref, description, status,
                                   chunk_count, file_count, degraded_chunks, commit_hash,
                                   last_error, created_at, last_indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(codebase_id) DO UPDATE SET
                name = excluded.name,
                repo_ref = excluded.repo_ref,
                description = excluded.description,
                status = excluded.status,
                chunk_count = excluded.chunk_count,
                file_count = excluded.file_count,
                degraded_chunks = excluded.degraded_chunks,
                commit_hash = excluded.commit_hash,
                last_error = excluded.last_error,
                last_indexed_at = excluded.last_indexed_at
            "#,
        )
        .bind(&record.codebase_id)
        .bind(&record.name)
        .bind(&record.repo_ref)
        .bind(&record.description)
        .bind(record.status.as_str())
        .bind(record.chunk_count as i64)
        .bind(record.file_count as i64)
        .bind(record.degraded_chunks as i64)
        .bind(&record.commit_hash)
        .bind(&record.last_error)
        .bind(record.created_at.timestamp())
        .bind(record.last_indexed_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn delete_codebase(&self, codebase_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for table in ["codebases", "file_manifest", "chat_history"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE codebase_id = ?"))
                .bind(codebase_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)
    }

    async fn load_manifest(&self, codebase_id: &str) -> Result<BTreeMap<String, FileFingerprint>> {
        let rows = sqlx::query(
            "SELECT source_path, content_hash, chunk_count FROM file_manifest WHERE codebase_id = ?",
        )
        .bind(codebase_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut manifest = BTreeMap::new();
        for row in rows {
            let path: String = row.try_get("source_path").map_err(storage)?;
            manifest.insert(
                path,
                FileFingerprint {
                    content_hash: row.try_get("content_hash").map_err(storage)?,
                    chunk_count: row.try_get::<i64, _>("chunk_count").map_err(storage)? as usize,
                },
            );
        }
        Ok(manifest)
    }

    async fn put_fingerprint(
        &self,
        codebase_id: &str,
        source_path: &str,
        fingerprint: &FileFingerprint,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_manifest (codebase_id, source_path, content_hash, chunk_count, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(codebase_id, source_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(codebase_id)
        .bind(source_path)
        .bind(&fingerprint.content_hash)
        .bind(fingerprint.chunk_count as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn remove_fingerprint(&self, codebase_id: &str, source_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM file_manifest WHERE codebase_id = ? AND source_path = ?")
            .bind(codebase_id)
            .bind(source_path)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn clear_manifest(&self, codebase_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM file_manifest WHERE codebase_id = ?")
            .bind(codebase_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn add_chat_entry(&self, entry: &ChatEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_history (codebase_id, question, answer, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.codebase_id)
        .bind(&entry.question)
        .bind(&entry.answer)
        .bind(entry.created_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn chat_history(&self, codebase_id: &str, limit: usize) -> Result<Vec<ChatEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT codebase_id, question, answer, created_at
            FROM chat_history
            WHERE codebase_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(codebase_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| {
                Ok(ChatEntry {
                    codebase_id: row.try_get("codebase_id").map_err(storage)?,
                    question: row.try_get("question").map_err(storage)?,
                    answer: row.try_get("answer").map_err(storage)?,
                    created_at: to_datetime(row.try_get("created_at").map_err(storage)?),
                })
            })
            .collect()
    }
}
