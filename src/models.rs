//! Core data models used throughout the resolver.
//!
//! These types represent the channel entries, repositories, folder mappings,
//! and download tasks that flow through the resolution pipeline.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Identifier of a plugin-provided workflow node (the workflow's `type` field).
pub type NodeType = String;

/// One provider source listed by the channel index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    pub url: String,
}

/// A source repository and the workflow node types that need it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub url: String,
    pub needed_by: BTreeSet<NodeType>,
}

impl Repository {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            needed_by: BTreeSet::new(),
        }
    }
}

/// Folder keys a node type is statically known to read models from.
pub type FolderMapping = BTreeMap<NodeType, BTreeSet<String>>;

/// Where a model's storage folder came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderSource {
    /// Found by static analysis of the providing repository.
    Inferred,
    /// Guessed from the model filename.
    Guessed,
}

/// A model file referenced by the workflow, with its planned location.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRequirement {
    pub filename: String,
    pub needed_by: BTreeSet<NodeType>,
    pub folder: Option<String>,
    pub folder_source: Option<FolderSource>,
    /// Path relative to the models root (`<folder>/<filename>`).
    pub target_path: Option<PathBuf>,
    pub url: Option<String>,
}

/// Why a download attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Another attempt may succeed.
    Retryable,
    /// Terminal; no further attempts.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "kind")]
pub enum DownloadStatus {
    Pending,
    InFlight,
    Completed,
    Failed(FailureKind),
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed(FailureKind::Fatal)
        )
    }
}

/// A single model acquisition.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub source_url: String,
    /// Absolute destination of the committed file.
    pub target_path: PathBuf,
    pub status: DownloadStatus,
    pub attempt_count: u32,
    /// Set when a challenge blocked every attempt; the caller can offer a manual path.
    pub manual_download: bool,
    pub last_error: Option<String>,
}

impl DownloadTask {
    pub fn new(source_url: impl Into<String>, target_path: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            target_path: target_path.into(),
            status: DownloadStatus::Pending,
            attempt_count: 0,
            manual_download: false,
            last_error: None,
        }
    }
}
