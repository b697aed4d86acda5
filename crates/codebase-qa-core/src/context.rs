//! Grounding context assembly.
//!
//! Turns a ranked retrieval result into the text handed to the answer
//! generator. Each chunk is labeled with its path and line range; chunks
//! are joined in rank order. When the total would exceed the length cap,
//! the lowest-ranked chunks are dropped whole. A chunk is never cut.

use serde::Serialize;

use crate::models::ScoredChunk;

/// Separator placed between labeled chunks.
pub const CHUNK_SEPARATOR: &str = "\n---\n";

/// Assembled context plus the chunks it contains, in rank order.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedContext {
    pub context: String,
    pub ranked_chunks: Vec<ScoredChunk>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.ranked_chunks.is_empty()
    }
}

/// Label a chunk with its origin, e.g. `### src/lib.rs (lines 31-70)`.
pub fn format_chunk(scored: &ScoredChunk) -> String {
    let c = &scored.chunk;
    format!(
        "### {} (lines {}-{})\n{}",
        c.source_path, c.start_line, c.end_line, c.text
    )
}

/// Concatenate ranked chunks, stopping before the first that would push
/// the total past `max_chars` characters.
pub fn assemble_context(ranked: Vec<ScoredChunk>, max_chars: usize) -> RetrievedContext {
    let mut context = String::new();
    let mut used = 0usize;
    let mut kept = Vec::with_capacity(ranked.len());

    for scored in ranked {
        let block = format_chunk(&scored);
        let sep = if kept.is_empty() { 0 } else { CHUNK_SEPARATOR.len() };
        let cost = sep + block.chars().count();
        if used + cost > max_chars {
            break;
        }
        if sep > 0 {
            context.push_str(CHUNK_SEPARATOR);
        }
        context.push_str(&block);
        used += cost;
        kept.push(scored);
    }

    RetrievedContext {
        context,
        ranked_chunks: kept,
    }
}
