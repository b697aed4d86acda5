//! Ingestion commands: `add`, `refresh`, `delete`, `check`.
//!
//! Indexing runs can be interrupted with Ctrl-C. Files already processed
//! stay indexed and the codebase is left `Stale` (or `Failed` if it had
//! never finished an index).

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;

use codebase_qa_core::orchestrator::IngestReport;

use crate::app::App;
use crate::config::Config;

/// Cancel `token` when the user presses Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, stopping after the current file...");
            child.cancel();
        }
    });
    token
}

fn print_report(action: &str, codebase_id: &str, report: &IngestReport) {
    println!("{} {}", action, codebase_id);
    println!("  files indexed: {}", report.files_indexed);
    println!("  files unchanged: {}", report.files_unchanged);
    println!("  files removed: {}", report.files_removed);
    println!("  chunks written: {}", report.chunks_added);
    if report.chunks_failed > 0 {
        println!("  chunks excluded: {}", report.chunks_failed);
    }
}

/// Indexing needs an embedding provider; fail before touching the database.
fn require_embeddings(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("embedding provider is disabled; set [embedding] provider to \"hash\" or \"openai\" to index");
    }
    Ok(())
}

pub async fn run_add(
    config: &Config,
    codebase_id: &str,
    repo_ref: &str,
    name: Option<&str>,
    description: Option<&str>,
) -> Result<()> {
    require_embeddings(config)?;
    let app = App::open(config).await?;
    let cancel = cancel_on_ctrl_c();
    let result = app
        .orchestrator
        .add(codebase_id, repo_ref, name, description, &cancel)
        .await;
    app.close().await;

    let report = result?;
    print_report("add", codebase_id, &report);
    println!("ok");
    Ok(())
}

pub async fn run_refresh(config: &Config, codebase_id: &str, full: bool) -> Result<()> {
    require_embeddings(config)?;
    let app = App::open(config).await?;
    let cancel = cancel_on_ctrl_c();
    let result = if full {
        app.orchestrator.refresh_full(codebase_id, &cancel).await
    } else {
        app.orchestrator.refresh(codebase_id, &cancel).await
    };
    app.close().await;

    let report = result?;
    print_report(if full { "refresh --full" } else { "refresh" }, codebase_id, &report);
    println!("ok");
    Ok(())
}

pub async fn run_delete(config: &Config, codebase_id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let result = app.orchestrator.delete(codebase_id).await;
    app.close().await;

    result?;
    println!("deleted {}", codebase_id);
    Ok(())
}

/// Mark codebases with new upstream commits as stale.
pub async fn run_check(config: &Config, codebase_id: Option<&str>) -> Result<()> {
    let app = App::open(config).await?;
    let ids: Vec<String> = match codebase_id {
        Some(id) => vec![id.to_string()],
        None => app
            .orchestrator
            .list()
            .await
            .into_iter()
            .map(|r| r.codebase_id)
            .collect(),
    };

    let mut outcome = Ok(());
    for id in &ids {
        match app.orchestrator.check_for_updates(id).await {
            Ok(status) => println!("{}: {}", id, status),
            Err(e) => {
                println!("{}: check failed: {}", id, e);
                if codebase_id.is_some() {
                    outcome = Err(e.into());
                }
            }
        }
    }
    app.close().await;
    outcome
}
