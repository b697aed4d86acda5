//! Deterministic test doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::embedding::Embedder;
use crate::error::{QaError, Result};

/// Embeds text as counts of a fixed keyword vocabulary, one axis per word.
///
/// Texts containing any word from `poison` are rejected with a
/// non-transient error, and the whole provider can be switched off to
/// simulate an outage.
pub struct KeywordEmbedder {
    vocabulary: Vec<String>,
    poison: Mutex<HashSet<String>>,
    offline: Mutex<bool>,
    /// Number of `embed` calls that failed before succeeding is allowed.
    flaky_failures: AtomicUsize,
    pub calls: AtomicUsize,
    pub texts_embedded: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(vocabulary: &[&str]) -> Self {
        Self {
            vocabulary: vocabulary.iter().map(|w| w.to_string()).collect(),
            poison: Mutex::new(HashSet::new()),
            offline: Mutex::new(false),
            flaky_failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
        }
    }

    pub fn poison(&self, word: &str) {
        self.poison.lock().unwrap().insert(word.to_string());
    }

    pub fn clear_poison(&self) {
        self.poison.lock().unwrap().clear();
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    /// Fail the next `n` calls, then behave normally.
    pub fn fail_next(&self, n: usize) {
        self.flaky_failures.store(n, Ordering::SeqCst);
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();
        self.vocabulary
            .iter()
            .map(|v| words.iter().filter(|w| *w == v).count() as f32)
            .collect()
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    fn dims(&self) -> usize {
        self.vocabulary.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.offline.lock().unwrap() {
            return Err(QaError::EmbeddingUnavailable("provider offline".into()));
        }
        if self
            .flaky_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QaError::EmbeddingUnavailable("transient failure".into()));
        }
        let poison = self.poison.lock().unwrap().clone();
        for text in texts {
            let lower = text.to_lowercase();
            if poison.iter().any(|p| lower.contains(p.as_str())) {
                return Err(QaError::Configuration("rejected input".into()));
            }
        }
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Returns vectors of a fixed length regardless of input.
pub struct FixedDimsEmbedder(pub usize);

#[async_trait]
impl Embedder for FixedDimsEmbedder {
    fn model_name(&self) -> &str {
        "fixed"
    }

    fn dims(&self) -> usize {
        self.0
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0; self.0]).collect())
    }
}
