use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database and its schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Codebase records
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS codebases (
            codebase_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            repo_ref TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            file_count INTEGER NOT NULL DEFAULT 0,
            degraded_chunks INTEGER NOT NULL DEFAULT 0,
            commit_hash TEXT,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            last_indexed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embedded chunks, one row per (codebase, file, window)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            codebase_id TEXT NOT NULL,
            source_path TEXT NOT NULL,
            sequence_index INTEGER NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            language_hint TEXT NOT NULL,
            text TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            PRIMARY KEY (codebase_id, source_path, sequence_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Last indexed content hash per file
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_manifest (
            codebase_id TEXT NOT NULL,
            source_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (codebase_id, source_path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            codebase_id TEXT NOT NULL,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_history_codebase ON chat_history(codebase_id, id DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
