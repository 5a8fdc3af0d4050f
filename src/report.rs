//! The resolution report returned by a job and printed by `wfdeps resolve`.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{ClaimConflict, DependencyGraph};
use crate::models::{DownloadStatus, DownloadTask, FolderMapping, ModelRequirement, NodeType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedNode {
    pub node_type: NodeType,
    pub repo_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub url: String,
    pub target_path: String,
    pub status: DownloadStatus,
    pub attempts: u32,
    pub manual_download: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&DownloadTask> for DownloadSummary {
    fn from(task: &DownloadTask) -> Self {
        Self {
            url: task.source_url.clone(),
            target_path: task.target_path.display().to_string(),
            status: task.status,
            attempts: task.attempt_count,
            manual_download: task.manual_download,
            error: task.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionReport {
    pub resolved: Vec<ResolvedNode>,
    pub unresolved: Vec<NodeType>,
    pub model_paths: BTreeMap<NodeType, Vec<String>>,
    pub downloads: Vec<DownloadSummary>,
    pub models: Vec<ModelRequirement>,
    pub conflicts: Vec<ClaimConflict>,
    pub warnings: Vec<String>,
    pub channels_stale: bool,
}

impl ResolutionReport {
    /// Fill the resolution sections from a graph and the inferred folders.
    ///
    /// `model_paths` only lists workflow node types with at least one folder.
    pub fn from_graph(
        graph: &DependencyGraph,
        workflow_types: &BTreeSet<NodeType>,
        folders: &FolderMapping,
    ) -> Self {
        let resolved = graph
            .node_repo
            .iter()
            .map(|(node_type, repo_url)| ResolvedNode {
                node_type: node_type.clone(),
                repo_url: repo_url.clone(),
            })
            .collect();

        let model_paths = workflow_types
            .iter()
            .filter_map(|t| {
                let found = folders.get(t).filter(|f| !f.is_empty())?;
                Some((t.clone(), found.iter().cloned().collect()))
            })
            .collect();

        Self {
            resolved,
            unresolved: graph.unresolved.iter().cloned().collect(),
            model_paths,
            conflicts: graph.conflicts.clone(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;

    #[test]
    fn model_paths_skip_empty_and_foreign_types() {
        let mut graph = DependencyGraph::default();
        graph.node_repo.insert("A".into(), "https://r".into());
        graph.unresolved.insert("C".into());

        let types = BTreeSet::from(["A".to_string(), "C".to_string()]);
        let folders = FolderMapping::from([
            ("A".to_string(), BTreeSet::from(["checkpoints".to_string()])),
            ("Helper".to_string(), BTreeSet::from(["vae".to_string()])),
            ("C".to_string(), BTreeSet::new()),
        ]);
        let report = ResolutionReport::from_graph(&graph, &types, &folders);

        assert_eq!(
            report.resolved,
            vec![ResolvedNode {
                node_type: "A".into(),
                repo_url: "https://r".into()
            }]
        );
        assert_eq!(report.unresolved, vec!["C".to_string()]);
        assert_eq!(
            report.model_paths,
            BTreeMap::from([("A".to_string(), vec!["checkpoints".to_string()])])
        );
    }

    #[test]
    fn download_status_serializes_with_kind() {
        let mut task = DownloadTask::new("https://h/x", "/m/x");
        task.status = DownloadStatus::Failed(FailureKind::Fatal);
        let json = serde_json::to_value(DownloadSummary::from(&task)).unwrap();
        assert_eq!(json["status"]["state"], "failed");
        assert_eq!(json["status"]["kind"], "fatal");
        assert!(json.get("error").is_none());
    }
}
