//! Error taxonomy for the retrieval pipeline.
//!
//! Every fallible core operation returns [`QaError`]. The application
//! crate converts to `anyhow::Error` at the CLI boundary.

/// Errors produced by chunking, indexing, and retrieval.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QaError {
    /// Invalid chunking or retrieval parameters. Caller's fault, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The embedding provider could not produce vectors.
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The answer generator could not produce a response.
    #[error("answer generator unavailable: {0}")]
    GeneratorUnavailable(String),

    /// A vector's dimensionality differs from the one the index was built with.
    #[error("embedding dimension mismatch: index has {expected}, provider returned {actual}; run a full refresh")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    /// The index was destroyed (its codebase was deleted) and may not be used.
    #[error("index for codebase '{0}' has been destroyed")]
    IndexDestroyed(String),

    /// The codebase exists but cannot serve queries in its current status.
    #[error("codebase '{codebase_id}' is not ready (status: {status})")]
    CodebaseNotReady { codebase_id: String, status: String },

    /// No codebase with this identifier is known.
    #[error("codebase '{0}' not found")]
    NotFound(String),

    /// The repository could not be read.
    #[error("repository error: {0}")]
    Repository(String),

    /// The persistence layer failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl QaError {
    /// Whether the failure is a transient collaborator outage worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QaError::EmbeddingUnavailable(_) | QaError::GeneratorUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QaError>;
