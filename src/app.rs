//! Wiring: builds the orchestrator and its collaborators from [`Config`].

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use codebase_qa_core::embedding::Embedder;
use codebase_qa_core::orchestrator::{Orchestrator, RepositoryLoader};
use codebase_qa_core::registry::IndexRegistry;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::loader::FsGitLoader;
use crate::migrate;
use crate::sqlite_store::{SqliteChunkStore, SqliteMetadataStore};

/// An opened database plus the orchestrator running on top of it.
pub struct App {
    pub config: Config,
    pub orchestrator: Orchestrator,
    pool: SqlitePool,
}

impl App {
    /// Open with the embedder and loader chosen by `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let loader = Arc::new(FsGitLoader::new(config)?);
        Self::open_with(config, embedder, loader).await
    }

    /// Open with explicit collaborators.
    pub async fn open_with(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        loader: Arc<dyn RepositoryLoader>,
    ) -> Result<Self> {
        let pool = db::connect(config)
            .await
            .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
        migrate::apply(&pool).await?;

        let registry = Arc::new(IndexRegistry::new(
            embedder,
            Arc::new(SqliteChunkStore::new(pool.clone())),
            config.index_options(),
        ));
        let orchestrator = Orchestrator::new(
            registry,
            Arc::new(SqliteMetadataStore::new(pool.clone())),
            loader,
            config.pipeline_settings(),
        )?;
        orchestrator.restore().await?;

        Ok(Self {
            config: config.clone(),
            orchestrator,
            pool,
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
