//! Question answering: `context`, `ask`, and `history`.

use anyhow::Result;
use serde::Serialize;

use codebase_qa_core::generate::{build_prompt, AnswerGenerator};
use codebase_qa_core::models::ScoredChunk;
use codebase_qa_core::orchestrator::Orchestrator;
use codebase_qa_core::retry::{with_backoff, RetryPolicy};
use codebase_qa_core::QaError;

use crate::app::App;
use crate::config::Config;
use crate::generator::create_generator;

/// A generated answer and the chunks it was grounded on.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<ScoredChunk>,
}

/// Retrieve context, generate an answer, and record the exchange.
///
/// Generator outages are retried with `retry`. When nothing relevant is
/// retrieved the generator is not called.
pub async fn answer_question(
    orchestrator: &Orchestrator,
    generator: &dyn AnswerGenerator,
    codebase_id: &str,
    question: &str,
    max_context_chunks: usize,
    retry: RetryPolicy,
) -> std::result::Result<Answer, QaError> {
    let record = orchestrator.status(codebase_id).await?;
    let retrieved = orchestrator
        .answer_query(codebase_id, question, max_context_chunks)
        .await?;

    let answer = if retrieved.is_empty() {
        format!("No relevant code was found in '{}' for this question.", record.name)
    } else {
        let prompt = build_prompt(&record.name, &retrieved.context, question);
        with_backoff(retry, "answer generation", || generator.generate(&prompt)).await?
    };

    orchestrator
        .record_exchange(codebase_id, question, &answer)
        .await?;
    Ok(Answer {
        answer,
        sources: retrieved.ranked_chunks,
    })
}

fn print_sources(sources: &[ScoredChunk]) {
    for (i, s) in sources.iter().enumerate() {
        println!(
            "  {}. {} lines {}-{} (score {:.3})",
            i + 1,
            s.chunk.source_path,
            s.chunk.start_line,
            s.chunk.end_line,
            s.score
        );
    }
}

pub async fn run_context(
    config: &Config,
    codebase_id: &str,
    question: &str,
    limit: Option<usize>,
) -> Result<()> {
    let app = App::open(config).await?;
    let limit = limit.unwrap_or(config.retrieval.max_context_chunks);
    let result = app.orchestrator.answer_query(codebase_id, question, limit).await;
    app.close().await;

    let retrieved = result?;
    if retrieved.is_empty() {
        println!("No relevant code found.");
        return Ok(());
    }
    println!("context {}: {} chunks", codebase_id, retrieved.ranked_chunks.len());
    print_sources(&retrieved.ranked_chunks);
    println!();
    println!("{}", retrieved.context);
    Ok(())
}

pub async fn run_ask(
    config: &Config,
    codebase_id: &str,
    question: &str,
    limit: Option<usize>,
    model: Option<&str>,
) -> Result<()> {
    let generator = create_generator(&config.generator, model)?;
    let app = App::open(config).await?;
    let limit = limit.unwrap_or(config.retrieval.max_context_chunks);
    let result = answer_question(
        &app.orchestrator,
        generator.as_ref(),
        codebase_id,
        question,
        limit,
        config.retry_policy(),
    )
    .await;
    app.close().await;

    let answer = result?;
    println!("{}", answer.answer);
    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        print_sources(&answer.sources);
    }
    Ok(())
}

pub async fn run_history(config: &Config, codebase_id: &str, limit: usize) -> Result<()> {
    let app = App::open(config).await?;
    let result = app.orchestrator.chat_history(codebase_id, limit).await;
    app.close().await;

    let entries = result?;
    if entries.is_empty() {
        println!("No questions asked yet.");
        return Ok(());
    }
    for entry in entries {
        println!("[{}] Q: {}", entry.created_at.format("%Y-%m-%d %H:%M:%S"), entry.question);
        println!("A: {}", entry.answer);
        println!();
    }
    Ok(())
}
