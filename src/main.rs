//! # Codebase QA CLI (`cqa`)
//!
//! Index source repositories and ask questions about them.
//!
//! ## Usage
//!
//! ```bash
//! cqa --config ./config/cqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cqa init` | Create the SQLite database and run schema migrations |
//! | `cqa add <id> <repo>` | Register a repository and index it |
//! | `cqa refresh <id>` | Re-index files that changed since the last run |
//! | `cqa delete <id>` | Remove a codebase and its index |
//! | `cqa status [<id>]` | Show status and statistics |
//! | `cqa list` | One line per codebase |
//! | `cqa context <id> "<q>"` | Print the retrieved context for a question |
//! | `cqa ask <id> "<q>"` | Answer a question with the configured generator |
//! | `cqa history <id>` | Show past questions and answers |
//! | `cqa check [<id>]` | Mark codebases with new upstream commits as stale |
//! | `cqa models` | Check that the configured generator models are available |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use codebase_qa::{ask, config, generator, ingest, logging, migrate, status};

/// Codebase QA: retrieval-augmented question answering over repositories.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cqa.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cqa",
    about = "Codebase QA: ask questions about source repositories",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cqa.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Register a repository and index it.
    Add {
        /// Codebase identifier.
        id: String,
        /// Local directory or git URL.
        repo: String,
        /// Display name (defaults to the id).
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Delete the clone of a remote repository once it is indexed.
        #[arg(long)]
        temporary: bool,
    },

    /// Reload the repository and re-index what changed.
    Refresh {
        id: String,
        /// Drop the whole index first and re-embed every file.
        ///
        /// Needed after switching embedding models or dimensions.
        #[arg(long)]
        full: bool,
    },

    /// Delete a codebase, its index, and its chat history.
    Delete { id: String },

    /// Show status of one or all codebases.
    Status { id: Option<String> },

    /// List all codebases.
    List,

    /// Print the context retrieved for a question.
    Context {
        id: String,
        question: String,
        /// Maximum number of chunks (defaults to retrieval.max_context_chunks).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a question about a codebase.
    Ask {
        id: String,
        question: String,
        /// Maximum number of chunks (defaults to retrieval.max_context_chunks).
        #[arg(long)]
        limit: Option<usize>,
        /// Override the generator model.
        #[arg(long)]
        model: Option<String>,
    },

    /// Show recent questions and answers, newest first.
    History {
        id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Check for new upstream commits and mark codebases stale.
    Check { id: Option<String> },

    /// Check the configured generator models against the provider catalog.
    Models {
        /// Additional models to check.
        extra: Vec<String>,
        /// Also send each model a short test prompt.
        #[arg(long)]
        ping: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Add {
            id,
            repo,
            name,
            description,
            temporary,
        } => {
            if temporary {
                cfg.loader.temporary = true;
            }
            ingest::run_add(&cfg, &id, &repo, name.as_deref(), description.as_deref()).await?;
        }
        Commands::Refresh { id, full } => {
            ingest::run_refresh(&cfg, &id, full).await?;
        }
        Commands::Delete { id } => {
            ingest::run_delete(&cfg, &id).await?;
        }
        Commands::Status { id } => {
            status::run_status(&cfg, id.as_deref()).await?;
        }
        Commands::List => {
            status::run_list(&cfg).await?;
        }
        Commands::Context {
            id,
            question,
            limit,
        } => {
            ask::run_context(&cfg, &id, &question, limit).await?;
        }
        Commands::Ask {
            id,
            question,
            limit,
            model,
        } => {
            ask::run_ask(&cfg, &id, &question, limit, model.as_deref()).await?;
        }
        Commands::History { id, limit } => {
            ask::run_history(&cfg, &id, limit).await?;
        }
        Commands::Check { id } => {
            ingest::run_check(&cfg, id.as_deref()).await?;
        }
        Commands::Models { extra, ping } => {
            generator::run_models(&cfg, &extra, ping).await?;
        }
    }

    Ok(())
}
