//! Retrieval of plugin repositories and their Python sources.
//!
//! Workflow:
//! 1. Derive a checkout directory from the repository URL (same naming as
//!    the cache layer, so checkouts are stable across runs).
//! 2. Reuse an existing checkout, or `git clone --depth 1 --recurse-submodules`.
//! 3. Walk `*.py` files, skipping hidden and vendor directories.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::cache::cache_file_name;

const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/__pycache__/**",
    "**/node_modules/**",
    "**/.venv/**",
    "**/venv/**",
    "**/site-packages/**",
];

/// Only remote URLs `git clone` cannot mistake for an option or a local path.
pub fn is_cloneable_url(url: &str) -> bool {
    ["https://", "http://", "git@"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
        && !url.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Produces a local directory holding a repository's files.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<PathBuf>;
}

/// [`RepoFetcher`] that shells out to `git`.
pub struct GitRepoFetcher {
    repos_dir: PathBuf,
    timeout: Duration,
}

impl GitRepoFetcher {
    pub fn new(repos_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            timeout,
        }
    }

    pub fn checkout_dir(&self, url: &str) -> PathBuf {
        self.repos_dir.join(cache_file_name(url, &[], None))
    }
}

#[async_trait]
impl RepoFetcher for GitRepoFetcher {
    async fn fetch(&self, url: &str) -> Result<PathBuf> {
        if !is_cloneable_url(url) {
            bail!("refusing to clone {:?}: only http(s):// and git@ URLs are accepted", url);
        }
        let dest = self.checkout_dir(url);
        if dest.join(".git").exists() {
            tracing::debug!(url, dest = %dest.display(), "reusing checkout");
            return Ok(dest);
        }

        tokio::fs::create_dir_all(&self.repos_dir)
            .await
            .with_context(|| format!("Failed to create repos directory: {}", self.repos_dir.display()))?;

        tracing::info!(url, dest = %dest.display(), "cloning repository");
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", "--recurse-submodules", "--quiet", "--"])
            .arg(url)
            .arg(&dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("git clone of {} timed out after {:?}", url, self.timeout))?
            .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;

        if !output.status.success() {
            // A failed clone can leave a partial directory that would later pass for a checkout.
            let _ = tokio::fs::remove_dir_all(&dest).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git clone of {} failed: {}", url, stderr.trim());
        }

        Ok(dest)
    }
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the tree root.
    pub path: PathBuf,
    pub text: String,
}

#[derive(Debug, Default, Clone)]
pub struct SourceTree {
    pub files: Vec<SourceFile>,
    pub warnings: Vec<String>,
}

/// Read every Python source file under `root`, sorted by path.
pub fn load_source_tree(root: &Path) -> Result<SourceTree> {
    if !root.is_dir() {
        bail!("source root is not a directory: {}", root.display());
    }
    let excludes = build_globset(DEFAULT_EXCLUDES)?;
    let mut tree = SourceTree::default();

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !(entry.file_type().is_dir() && entry.file_name().to_string_lossy().starts_with('.'))
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tree.warnings.push(format!("walk error under {}: {}", root.display(), err));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        if excludes.is_match(relative) {
            continue;
        }

        match std::fs::read(path) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => tree.files.push(SourceFile {
                    path: relative.to_path_buf(),
                    text,
                }),
                Err(_) => tree
                    .warnings
                    .push(format!("{}: not valid UTF-8; skipped", relative.display())),
            },
            Err(err) => tree
                .warnings
                .push(format!("{}: unreadable ({}); skipped", relative.display(), err)),
        }
    }

    tree.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(tree)
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
