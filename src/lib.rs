//! # Codebase QA
//!
//! Retrieval-augmented question answering over source repositories.
//!
//! Repositories (local directories or git remotes) are split into
//! overlapping line windows, embedded, and stored per codebase in SQLite.
//! A question is embedded, matched against that codebase's chunks by
//! cosine similarity, and the best chunks are assembled into a grounded
//! context for an answer generator.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │   Loader    │──▶│ Orchestrator │──▶│  SQLite   │
//! │  dir / git  │   │ chunk+embed  │   │ chunks+vec│
//! └─────────────┘   └──────┬───────┘   └──────────┘
//!                          │
//!                          ▼
//!                   ┌──────────────┐
//!                   │  Generator   │
//!                   │ (OpenRouter) │
//!                   └──────────────┘
//! ```
//!
//! The pipeline itself (chunking, indexes, registry, orchestrator) lives in
//! `codebase-qa-core`; this crate provides the native collaborators and
//! the `cqa` CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! cqa init
//! cqa add demo ./path/to/repo --name "Demo"
//! cqa context demo "where is the config parsed?"
//! cqa ask demo "how does retry work?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite chunk and metadata stores |
//! | [`embedding`] | Embedding providers |
//! | [`generator`] | Answer generators |
//! | [`loader`] | Directory and git repository loader |
//! | [`app`] | Wiring of the orchestrator from config |
//! | [`ingest`], [`ask`], [`status`] | CLI command implementations |
//! | [`logging`] | Tracing subscriber setup |

pub mod app;
pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generator;
pub mod ingest;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod sqlite_store;
pub mod status;
