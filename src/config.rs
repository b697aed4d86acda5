//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional; missing keys fall back to the
//! defaults below. See `config/cqa.example.toml` for a full example.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use codebase_qa_core::index::IndexOptions;
use codebase_qa_core::orchestrator::PipelineSettings;
use codebase_qa_core::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size_lines")]
    pub chunk_size_lines: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_lines: default_chunk_size_lines(),
            overlap_lines: default_overlap_lines(),
        }
    }
}

fn default_chunk_size_lines() -> usize {
    40
}
fn default_overlap_lines() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_context_chunks")]
    pub max_context_chunks: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Attempts for query embedding and answer generation.
    #[serde(default = "default_query_retries")]
    pub query_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_context_chunks: default_max_context_chunks(),
            max_context_chars: default_max_context_chars(),
            query_retries: default_query_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_max_context_chunks() -> usize {
    3
}
fn default_max_context_chars() -> usize {
    12_000
}
fn default_query_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash`, `openai`, or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// HTTP retries inside one embedding request.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Single-chunk attempts after a batch failed. A provider that is
    /// down stops the run after the first of them.
    #[serde(default = "default_chunk_attempts")]
    pub chunk_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// OpenAI-compatible embeddings endpoint.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            chunk_attempts: default_chunk_attempts(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_chunk_attempts() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

/// Dimensionality of the hash embedder when `dims` is not set.
pub const DEFAULT_HASH_DIMS: usize = 256;

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    /// `openrouter` or `disabled`.
    #[serde(default = "default_generator_provider")]
    pub provider: String,
    #[serde(default = "default_generator_model")]
    pub model: String,
    #[serde(default = "default_generator_url")]
    pub url: String,
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model catalog endpoint used by `cqa models`.
    #[serde(default = "default_models_url")]
    pub models_url: String,
    /// Alternative models `cqa models` checks alongside `model`.
    #[serde(default)]
    pub models: Vec<String>,
}

impl GeneratorConfig {
    /// `model` followed by the alternatives, without duplicates.
    pub fn candidate_models(&self) -> Vec<String> {
        let mut out = vec![self.model.clone()];
        for model in &self.models {
            if !out.contains(model) {
                out.push(model.clone());
            }
        }
        out
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_generator_provider(),
            model: default_generator_model(),
            url: default_generator_url(),
            timeout_secs: default_generator_timeout_secs(),
            api_key_env: default_api_key_env(),
            models_url: default_models_url(),
            models: Vec::new(),
        }
    }
}

fn default_generator_provider() -> String {
    "openrouter".to_string()
}
fn default_generator_model() -> String {
    "deepseek/deepseek-chat".to_string()
}
fn default_generator_url() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}
fn default_generator_timeout_secs() -> u64 {
    120
}
fn default_models_url() -> String {
    "https://openrouter.ai/api/v1/models".to_string()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    /// File extensions (without the dot) or exact file names to index.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Globs matched against repository-relative paths.
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Larger files are skipped.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Where remote repositories are cloned. Defaults to `.repo-cache`
    /// next to the database.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Delete remote clones once their files have been read.
    #[serde(default)]
    pub temporary: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            exclude_globs: default_exclude_globs(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
            cache_dir: None,
            temporary: false,
        }
    }
}

fn default_extensions() -> Vec<String> {
    [
        "py", "ipynb", "js", "jsx", "ts", "tsx", "java", "kt", "scala", "go", "rs", "c", "h",
        "cpp", "hpp", "cc", "cs", "rb", "php", "swift", "m", "sh", "bash", "sql", "r", "lua",
        "html", "css", "scss", "vue", "svelte", "json", "yaml", "yml", "toml", "ini", "cfg",
        "xml", "md", "rst", "txt", "Dockerfile", "Makefile",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_globs() -> Vec<String> {
    [
        "**/.*/**",
        "**/node_modules/**",
        "**/target/**",
        "**/build/**",
        "**/dist/**",
        "**/__pycache__/**",
        "**/venv/**",
        "**/*.min.js",
        "**/package-lock.json",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_file_bytes() -> u64 {
    1_000_000
}

impl Config {
    /// Defaults for everything, with the database under `./data`.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/cqa.sqlite"),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            generator: GeneratorConfig::default(),
            loader: LoaderConfig::default(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retrieval.query_retries,
            base_delay: Duration::from_millis(self.retrieval.retry_base_ms),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            chunk_size_lines: self.chunking.chunk_size_lines,
            overlap_lines: self.chunking.overlap_lines,
            max_context_chars: self.retrieval.max_context_chars,
            query_retry: self.retry_policy(),
        }
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            batch_size: self.embedding.batch_size,
            chunk_attempts: self.embedding.chunk_attempts,
        }
    }

    /// Clone cache for remote repositories.
    pub fn repo_cache_dir(&self) -> PathBuf {
        match &self.loader.cache_dir {
            Some(dir) => dir.clone(),
            None => self
                .db
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(".repo-cache"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.chunk_size_lines == 0 {
        anyhow::bail!("chunking.chunk_size_lines must be > 0");
    }
    if config.chunking.overlap_lines >= config.chunking.chunk_size_lines {
        anyhow::bail!(
            "chunking.overlap_lines ({}) must be smaller than chunking.chunk_size_lines ({})",
            config.chunking.overlap_lines,
            config.chunking.chunk_size_lines
        );
    }

    // Validate retrieval
    if config.retrieval.max_context_chunks < 1 {
        anyhow::bail!("retrieval.max_context_chunks must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        anyhow::bail!("retrieval.max_context_chars must be > 0");
    }
    if config.retrieval.query_retries == 0 {
        anyhow::bail!("retrieval.query_retries must be >= 1");
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.chunk_attempts == 0 {
        anyhow::bail!("embedding.chunk_attempts must be >= 1");
    }
    match config.embedding.provider.as_str() {
        "disabled" => {}
        "hash" => {
            if config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0");
            }
        }
        "openai" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or disabled.",
            other
        ),
    }

    // Validate generator
    match config.generator.provider.as_str() {
        "openrouter" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown generator provider: '{}'. Must be openrouter or disabled.",
            other
        ),
    }

    if config.loader.extensions.is_empty() {
        anyhow::bail!("loader.extensions must not be empty");
    }

    Ok(())
}
