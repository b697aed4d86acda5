//! Overlapping line-window chunker.
//!
//! Splits file text into [`Chunk`]s of `chunk_size_lines` lines, advancing
//! the window by `chunk_size_lines - overlap_lines` lines per step. Lines
//! keep their original terminators, so every chunk's `text` is an exact
//! substring of the file and the file can be rebuilt from its chunks.
//!
//! # Algorithm
//!
//! 1. Split the text into lines with [`str::split_inclusive`] on `\n`.
//! 2. Emit lines `[start, start + size)` as a chunk (clamped to the end).
//! 3. Stop once a chunk reaches the last line; otherwise advance `start`
//!    by `size - overlap`.
//!
//! Notebooks (`.ipynb`) are first flattened into a single text, one cell
//! after another, with a separator line between cells.
//!
//! # Example
//!
//! ```rust
//! use codebase_qa_core::chunk::chunk_text;
//!
//! let text: String = (1..=100).map(|i| format!("line {i}\n")).collect();
//! let chunks = chunk_text("src/lib.rs", &text, 40, 10).unwrap();
//! let spans: Vec<_> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
//! assert_eq!(spans, vec![(1, 40), (31, 70), (61, 100)]);
//! ```

use serde::Deserialize;

use crate::error::{QaError, Result};
use crate::models::Chunk;

/// Split `text` into overlapping line windows.
///
/// # Errors
///
/// [`QaError::Configuration`] when `overlap_lines >= chunk_size_lines`.
///
/// # Guarantees
///
/// - A text with zero lines yields no chunks.
/// - `sequence_index` is contiguous from 0.
/// - Consecutive chunks share exactly `overlap_lines` lines.
/// - The last chunk ends on the last line and may be shorter than the window.
pub fn chunk_text(
    source_path: &str,
    text: &str,
    chunk_size_lines: usize,
    overlap_lines: usize,
) -> Result<Vec<Chunk>> {
    validate_window(chunk_size_lines, overlap_lines)?;

    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    if lines.is_empty() {
        return Ok(Vec::new());
    }

    let language = language_hint(source_path);
    let step = chunk_size_lines - overlap_lines;
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + chunk_size_lines).min(lines.len());
        chunks.push(Chunk {
            source_path: source_path.to_string(),
            start_line: start + 1,
            end_line: end,
            text: lines[start..end].concat(),
            sequence_index: chunks.len(),
            language_hint: language.to_string(),
        });
        if end == lines.len() {
            break;
        }
        start += step;
    }

    Ok(chunks)
}

/// Chunk a file, flattening notebooks before windowing.
///
/// Notebook JSON that fails to parse is chunked as plain text.
pub fn chunk_file(
    source_path: &str,
    text: &str,
    chunk_size_lines: usize,
    overlap_lines: usize,
) -> Result<Vec<Chunk>> {
    if is_notebook(source_path) {
        match parse_notebook(text) {
            Ok(cells) => {
                return chunk_text(
                    source_path,
                    &flatten_notebook(&cells),
                    chunk_size_lines,
                    overlap_lines,
                )
            }
            Err(e) => {
                tracing::debug!(path = source_path, "notebook parse failed, chunking as text: {e}");
            }
        }
    }
    chunk_text(source_path, text, chunk_size_lines, overlap_lines)
}

/// Reject windows that would never advance.
pub fn validate_window(chunk_size_lines: usize, overlap_lines: usize) -> Result<()> {
    if chunk_size_lines == 0 {
        return Err(QaError::Configuration(
            "chunk_size_lines must be > 0".to_string(),
        ));
    }
    if overlap_lines >= chunk_size_lines {
        return Err(QaError::Configuration(format!(
            "overlap_lines ({overlap_lines}) must be smaller than chunk_size_lines ({chunk_size_lines})"
        )));
    }
    Ok(())
}

/// Infer a language name from the file extension, or `"unknown"`.
pub fn language_hint(source_path: &str) -> &'static str {
    let ext = match source_path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => ext.to_ascii_lowercase(),
        _ => return "unknown",
    };
    match ext.as_str() {
        "rs" => "rust",
        "py" => "python",
        "ipynb" => "notebook",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "kt" => "kotlin",
        "scala" => "scala",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "r" => "r",
        "sh" | "bat" => "shell",
        "sql" => "sql",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "xml" => "xml",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "rst" => "restructuredtext",
        "txt" => "text",
        _ => "unknown",
    }
}

pub fn is_notebook(source_path: &str) -> bool {
    source_path.to_ascii_lowercase().ends_with(".ipynb")
}

/// Kind of a notebook cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl CellKind {
    fn as_str(&self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
            CellKind::Raw => "raw",
        }
    }
}

/// One notebook cell's kind and source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookCell {
    pub kind: CellKind,
    pub source: String,
}

#[derive(Deserialize)]
struct RawNotebook {
    #[serde(default)]
    cells: Vec<RawCell>,
}

#[derive(Deserialize)]
struct RawCell {
    #[serde(default)]
    cell_type: String,
    #[serde(default)]
    source: CellSource,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CellSource {
    Text(String),
    Lines(Vec<String>),
}

impl Default for CellSource {
    fn default() -> Self {
        CellSource::Text(String::new())
    }
}

/// Parse `.ipynb` JSON into its cells, in order.
pub fn parse_notebook(json: &str) -> Result<Vec<NotebookCell>> {
    let raw: RawNotebook = serde_json::from_str(json)
        .map_err(|e| QaError::Repository(format!("invalid notebook: {e}")))?;

    Ok(raw
        .cells
        .into_iter()
        .map(|cell| NotebookCell {
            kind: match cell.cell_type.as_str() {
                "code" => CellKind::Code,
                "markdown" => CellKind::Markdown,
                _ => CellKind::Raw,
            },
            source: match cell.source {
                CellSource::Text(s) => s,
                CellSource::Lines(lines) => lines.concat(),
            },
        })
        .collect())
}

/// Join cells into one text with a separator line between consecutive cells.
///
/// Each cell starts on its own line; the separator names the 1-based
/// number and kind of the cell that follows it.
pub fn flatten_notebook(cells: &[NotebookCell]) -> String {
    let mut out = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            out.push_str(&format!("# ---- cell {} ({}) ----\n", i + 1, cell.kind.as_str()));
        }
        out.push_str(&cell.source);
        if !cell.source.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_lines(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}\n")).collect()
    }

    /// Rebuild a file by dropping each later chunk's overlapping prefix.
    fn reconstruct(chunks: &[Chunk], overlap: usize) -> String {
        let mut out = String::new();
        for (i, c) in chunks.iter().enumerate() {
            let lines: Vec<&str> = c.text.split_inclusive('\n').collect();
            let skip = if i == 0 { 0 } else { overlap };
            out.push_str(&lines[skip..].concat());
        }
        out
    }

    #[test]
    fn test_hundred_lines_forty_ten() {
        let chunks = chunk_text("src/main.py", &numbered_lines(100), 40, 10).unwrap();
        let spans: Vec<(usize, usize, usize)> = chunks
            .iter()
            .map(|c| (c.start_line, c.end_line, c.sequence_index))
            .collect();
        assert_eq!(spans, vec![(1, 40, 0), (31, 70, 1), (61, 100, 2)]);
        assert!(chunks[2].text.starts_with("line 61\n"));
        assert!(chunks[2].text.ends_with("line 100\n"));
        assert!(chunks.iter().all(|c| c.language_hint == "python"));
    }

    #[test]
    fn test_last_chunk_ends_on_last_line() {
        for n in [1usize, 39, 40, 41, 69, 70, 71, 250] {
            let chunks = chunk_text("f.txt", &numbered_lines(n), 40, 10).unwrap();
            assert_eq!(chunks.last().unwrap().end_line, n, "n = {n}");
        }
    }

    #[test]
    fn test_short_final_chunk_is_kept() {
        let chunks = chunk_text("f.txt", &numbered_lines(45), 40, 10).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[1].start_line, chunks[1].end_line), (31, 45));
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        assert!(chunk_text("empty.rs", "", 40, 10).unwrap().is_empty());
    }

    #[test]
    fn test_overlap_not_smaller_than_size_is_rejected() {
        for (size, overlap) in [(10, 10), (10, 11), (0, 0)] {
            match chunk_text("a.rs", "x\n", size, overlap) {
                Err(QaError::Configuration(_)) => {}
                other => panic!("expected Configuration error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_reconstruction_is_exact() {
        let texts = [
            numbered_lines(100),
            numbered_lines(7),
            "no trailing newline\nsecond".to_string(),
            "\n\n\n".to_string(),
            "crlf\r\nlines\r\nhere".to_string(),
            "┌──┐\n│ä│\n└──┘\n".to_string(),
        ];
        for text in &texts {
            for (size, overlap) in [(40, 10), (3, 2), (1, 0), (5, 0), (2, 1)] {
                let chunks = chunk_text("f.txt", text, size, overlap).unwrap();
                assert_eq!(&reconstruct(&chunks, overlap), text, "size {size} overlap {overlap}");
            }
        }
    }

    #[test]
    fn test_consecutive_chunks_overlap_exactly() {
        let chunks = chunk_text("f.txt", &numbered_lines(123), 20, 7).unwrap();
        for pair in chunks.windows(2) {
            assert!(pair[0].start_line <= pair[1].start_line);
            assert_eq!(pair[0].end_line + 1 - pair[1].start_line, 7);
        }
    }

    #[test]
    fn test_language_hint() {
        assert_eq!(language_hint("src/lib.rs"), "rust");
        assert_eq!(language_hint("web/App.TSX"), "typescript");
        assert_eq!(language_hint("Makefile"), "unknown");
        assert_eq!(language_hint(".gitignore"), "unknown");
        assert_eq!(language_hint("dir.d/README"), "unknown");
    }

    #[test]
    fn test_notebook_flattening() {
        let json = r##"{
            "cells": [
                {"cell_type": "markdown", "source": ["# Title\n", "intro"]},
                {"cell_type": "code", "source": "import os\nprint(os.getcwd())\n"},
                {"cell_type": "code", "source": []}
            ]
        }"##;
        let cells = parse_notebook(json).unwrap();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].kind, CellKind::Markdown);
        assert_eq!(cells[0].source, "# Title\nintro");

        let flat = flatten_notebook(&cells);
        assert_eq!(
            flat,
            "# Title\nintro\n# ---- cell 2 (code) ----\nimport os\nprint(os.getcwd())\n# ---- cell 3 (code) ----\n\n"
        );
    }

    #[test]
    fn test_chunk_file_uses_notebook_cells() {
        let json = r#"{"cells": [{"cell_type": "code", "source": "a = 1\n"}, {"cell_type": "code", "source": "b = 2\n"}]}"#;
        let chunks = chunk_file("nb/analysis.ipynb", json, 40, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "a = 1\n# ---- cell 2 (code) ----\nb = 2\n");
        assert_eq!(chunks[0].language_hint, "notebook");
    }

    #[test]
    fn test_chunk_file_falls_back_on_bad_notebook() {
        let chunks = chunk_file("broken.ipynb", "not json\n", 40, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "not json\n");
    }
}
