//! Repository loader: local directories and git remotes.
//!
//! A repository reference is either a local directory or a git URL.
//! Remote repositories are cloned (shallow) into a cache directory keyed
//! by a hash of the URL, and fetched again on every load.
//!
//! Files are kept when their extension (or exact file name) is in the
//! allow-list and no exclude glob matches their repository-relative path.
//! Oversized, unreadable, and non-UTF-8 files are skipped with a warning.
//!
//! In temporary mode a remote clone is deleted as soon as its files have
//! been read; its head commit is remembered for the rest of the process.
//! Local directories are never deleted.

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use codebase_qa_core::orchestrator::RepositoryLoader;
use codebase_qa_core::{QaError, Result};

use crate::config::Config;

/// Loads repositories from disk or git.
pub struct FsGitLoader {
    cache_root: PathBuf,
    filter: FileFilter,
    temporary: bool,
    /// Head commits of clones that were already deleted.
    heads: Mutex<HashMap<String, String>>,
}

#[derive(Clone)]
struct FileFilter {
    extensions: BTreeSet<String>,
    exclude: GlobSet,
    follow_symlinks: bool,
    max_file_bytes: u64,
}

impl FsGitLoader {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(config.loader.exclude_globs.clone());

        Ok(Self {
            cache_root: config.repo_cache_dir(),
            filter: FileFilter {
                extensions: config
                    .loader
                    .extensions
                    .iter()
                    .map(|e| e.trim_start_matches('.').to_string())
                    .collect(),
                exclude: build_globset(&excludes)?,
                follow_symlinks: config.loader.follow_symlinks,
                max_file_bytes: config.loader.max_file_bytes,
            },
            temporary: config.loader.temporary,
            heads: Mutex::new(HashMap::new()),
        })
    }

    /// Local checkout directory for `repo_ref`.
    fn checkout_dir(&self, repo_ref: &str) -> PathBuf {
        if is_remote(repo_ref) {
            self.cache_root.join(short_hash(repo_ref))
        } else {
            PathBuf::from(repo_ref)
        }
    }

    /// Make sure the checkout exists and is current, then return it.
    async fn sync_checkout(&self, repo_ref: &str) -> Result<PathBuf> {
        let dir = self.checkout_dir(repo_ref);
        if !is_remote(repo_ref) {
            if !dir.is_dir() {
                return Err(QaError::Repository(format!(
                    "repository path does not exist or is not a directory: {repo_ref}"
                )));
            }
            return Ok(dir);
        }

        if dir.join(".git").exists() {
            git_update(&dir).await?;
        } else {
            git_clone(repo_ref, &dir).await?;
        }
        Ok(dir)
    }

    async fn discard_checkout(&self, repo_ref: &str, dir: &Path) {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(repo_ref, dir = %dir.display(), "removed temporary checkout"),
            Err(e) => warn!(repo_ref, dir = %dir.display(), "could not remove temporary checkout: {e}"),
        }
    }
}

#[async_trait]
impl RepositoryLoader for FsGitLoader {
    async fn get_files(&self, repo_ref: &str) -> Result<BTreeMap<String, String>> {
        let root = self.sync_checkout(repo_ref).await?;
        let discard = self.temporary && is_remote(repo_ref);
        if discard {
            match git_output(&root, &["rev-parse", "HEAD"]).await {
                Ok(head) => {
                    self.heads.lock().await.insert(repo_ref.to_string(), head);
                }
                Err(e) => warn!(repo_ref, "could not read head commit: {e}"),
            }
        }

        let filter = self.filter.clone();
        let scan_root = root.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_directory(&scan_root, &filter))
            .await
            .map_err(|e| QaError::Repository(format!("file scan task failed: {e}")))
            .and_then(|scanned| scanned);
        if discard {
            self.discard_checkout(repo_ref, &root).await;
        }
        let files = scanned?;
        info!(repo_ref, files = files.len(), "loaded repository files");
        Ok(files)
    }

    async fn head_commit(&self, repo_ref: &str) -> Result<Option<String>> {
        let dir = self.checkout_dir(repo_ref);
        if !dir.join(".git").exists() {
            return Ok(self.heads.lock().await.get(repo_ref).cloned());
        }
        git_output(&dir, &["rev-parse", "HEAD"]).await.map(Some)
    }

    async fn has_new_commits(&self, repo_ref: &str, since: Option<&str>) -> Result<bool> {
        let latest = if is_remote(repo_ref) {
            let out = git_output(Path::new("."), &["ls-remote", repo_ref, "HEAD"]).await?;
            out.split_whitespace().next().map(str::to_string)
        } else {
            self.head_commit(repo_ref).await?
        };
        debug!(repo_ref, ?latest, ?since, "checked for new commits");
        Ok(match (latest, since) {
            (Some(latest), Some(since)) => latest != since,
            (Some(_), None) => true,
            (None, _) => false,
        })
    }
}

fn scan_directory(root: &Path, filter: &FileFilter) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();

    let walker = WalkDir::new(root).follow_links(filter.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if filter.exclude.is_match(&rel_str) || !filter.accepts(relative) {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > filter.max_file_bytes {
            warn!(path = %rel_str, size, "skipping oversized file");
            continue;
        }

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %rel_str, "skipping unreadable file: {e}");
                continue;
            }
        };
        match String::from_utf8(bytes) {
            Ok(text) => {
                files.insert(rel_str, text);
            }
            Err(_) => warn!(path = %rel_str, "skipping non-UTF-8 file"),
        }
    }

    Ok(files)
}

impl FileFilter {
    fn accepts(&self, relative: &Path) -> bool {
        if let Some(name) = relative.file_name().and_then(|n| n.to_str()) {
            if self.extensions.contains(name) {
                return true;
            }
        }
        relative
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.extensions.contains(ext) || self.extensions.contains(&ext.to_lowercase())
            })
    }
}

fn is_remote(repo_ref: &str) -> bool {
    ["http://", "https://", "ssh://", "git://", "file://", "git@"]
        .iter()
        .any(|prefix| repo_ref.starts_with(prefix))
}

async fn git_clone(url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            QaError::Repository(format!(
                "failed to create cache directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    info!(url, dest = %dest.display(), "cloning repository");

    let output = Command::new("git")
        .args(["clone", "--depth", "1", "--quiet"])
        .arg(url)
        .arg(dest)
        .output()
        .await
        .map_err(|e| QaError::Repository(format!("failed to execute 'git clone'. Is git installed? {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(QaError::Repository(format!(
            "git clone failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

async fn git_update(repo_dir: &Path) -> Result<()> {
    git_output(repo_dir, &["fetch", "--depth", "1", "origin", "HEAD"]).await?;
    git_output(repo_dir, &["reset", "--hard", "FETCH_HEAD"]).await?;
    Ok(())
}

/// Run git in `dir` and return its trimmed stdout.
async fn git_output(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| QaError::Repository(format!("failed to execute 'git {}': {e}", args[0])))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(QaError::Repository(format!(
            "git {} failed: {}",
            args[0],
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
