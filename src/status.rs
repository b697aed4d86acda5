//! `status` and `list` commands.

use anyhow::Result;

use codebase_qa_core::models::CodebaseRecord;

use crate::app::App;
use crate::config::Config;

fn print_record(record: &CodebaseRecord) {
    println!("{}", record.codebase_id);
    println!("  Name:        {}", record.name);
    if !record.repo_ref.is_empty() {
        println!("  Repository:  {}", record.repo_ref);
    }
    if !record.description.is_empty() {
        println!("  Description: {}", record.description);
    }
    println!("  Status:      {}", record.status);
    println!("  Files:       {}", record.file_count);
    println!("  Chunks:      {}", record.chunk_count);
    if record.degraded_chunks > 0 {
        println!("  Excluded:    {} chunks failed to embed", record.degraded_chunks);
    }
    if let Some(commit) = &record.commit_hash {
        println!("  Commit:      {}", commit);
    }
    if let Some(at) = record.last_indexed_at {
        println!("  Indexed at:  {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(err) = &record.last_error {
        println!("  Last error:  {}", err);
    }
}

pub async fn run_status(config: &Config, codebase_id: Option<&str>) -> Result<()> {
    let app = App::open(config).await?;
    let result = match codebase_id {
        Some(id) => app.orchestrator.status(id).await.map(|r| vec![r]),
        None => Ok(app.orchestrator.list().await),
    };
    app.close().await;

    let records = result?;
    if records.is_empty() {
        println!("No codebases registered.");
    }
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print_record(record);
    }
    Ok(())
}

pub async fn run_list(config: &Config) -> Result<()> {
    let app = App::open(config).await?;
    let records = app.orchestrator.list().await;
    app.close().await;

    if records.is_empty() {
        println!("No codebases registered.");
        return Ok(());
    }
    println!("{:<24} {:<10} {:>7} {:>8}  NAME", "ID", "STATUS", "FILES", "CHUNKS");
    for r in records {
        println!(
            "{:<24} {:<10} {:>7} {:>8}  {}",
            r.codebase_id, r.status.as_str(), r.file_count, r.chunk_count, r.name
        );
    }
    Ok(())
}
