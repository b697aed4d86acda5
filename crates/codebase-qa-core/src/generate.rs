//! Answer generator capability and prompt template.
//!
//! The orchestrator never calls a generator; it returns the assembled
//! context and the caller pairs it with a [`Prompt`] built here.

use async_trait::async_trait;

use crate::error::Result;

/// A chat-style prompt: system instruction plus user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// A remote (or fake) language model that turns a prompt into text.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn model_name(&self) -> &str;
    /// Fails with [`QaError::GeneratorUnavailable`](crate::QaError::GeneratorUnavailable) on outage.
    async fn generate(&self, prompt: &Prompt) -> Result<String>;
}

/// Build the question prompt for `codebase_name` from retrieved context.
pub fn build_prompt(codebase_name: &str, context: &str, question: &str) -> Prompt {
    Prompt {
        system: format!(
            "You are a helpful assistant analyzing the '{codebase_name}' codebase. \
             Answer clearly and accurately using only the provided code context. \
             If the context does not contain the answer, say so."
        ),
        user: format!(
            "Here are relevant code snippets from {codebase_name}:\n\n{context}\n\nQuestion: {question}"
        ),
    }
}
