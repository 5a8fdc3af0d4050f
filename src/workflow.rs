//! Extraction of node types and model references from a workflow document.
//!
//! A workflow is a node-graph JSON file. Only three things are read from it:
//! `nodes[].type`, string entries of `nodes[].widgets_values`, and the node
//! lists nested under `extra.groupNodes`. Everything else is ignored.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::models::NodeType;

/// File extensions that mark a widget value as a model filename.
pub const MODEL_EXTENSIONS: &[&str] = &[".safetensors", ".pt", ".pth", ".onnx", ".bin", ".ckpt"];

/// Node types and model files referenced by a workflow.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkflowNodes {
    pub node_types: BTreeSet<NodeType>,
    /// Model filename → node types whose widgets reference it.
    pub models: BTreeMap<String, BTreeSet<NodeType>>,
    pub warnings: Vec<String>,
}

/// Read and parse a workflow file.
pub fn load(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Workflow is not valid JSON: {}", path.display()))
}

pub fn extract(workflow: &Value) -> WorkflowNodes {
    let mut out = WorkflowNodes::default();

    let groups: Option<&serde_json::Map<String, Value>> = workflow
        .get("extra")
        .and_then(|extra| extra.get("groupNodes"))
        .and_then(Value::as_object);

    let mut records: Vec<(&str, &Value)> = Vec::new();
    if let Some(nodes) = workflow.get("nodes").and_then(Value::as_array) {
        records.extend(nodes.iter().map(|n| ("nodes", n)));
    } else {
        out.warnings
            .push("workflow has no top-level 'nodes' array".to_string());
    }
    if let Some(groups) = groups {
        for (name, group) in groups {
            if let Some(nodes) = group.get("nodes").and_then(Value::as_array) {
                records.extend(nodes.iter().map(|n| (name.as_str(), n)));
            }
        }
    }

    for (origin, record) in records {
        let Some(node_type) = record.get("type").and_then(Value::as_str) else {
            let id = record
                .get("id")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string());
            out.warnings
                .push(format!("node {} in '{}' has no string 'type'; skipped", id, origin));
            continue;
        };

        // Group instances are expanded above; their own type is not a plugin node.
        if groups.is_some_and(|g| g.contains_key(node_type)) {
            continue;
        }

        out.node_types.insert(node_type.to_string());

        if let Some(values) = record.get("widgets_values").and_then(Value::as_array) {
            for filename in values.iter().filter_map(Value::as_str) {
                if is_model_filename(filename) {
                    out.models
                        .entry(filename.to_string())
                        .or_default()
                        .insert(node_type.to_string());
                }
            }
        }
    }

    tracing::debug!(
        node_types = out.node_types.len(),
        models = out.models.len(),
        "extracted workflow"
    );
    out
}

pub fn is_model_filename(value: &str) -> bool {
    let lowered = value.to_ascii_lowercase();
    MODEL_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_types_and_models() {
        let wf = json!({
            "nodes": [
                {"id": 1, "type": "CheckpointLoaderSimple", "widgets_values": ["sd_xl_base.safetensors"]},
                {"id": 2, "type": "KSampler", "widgets_values": [42, "euler", 1.0]},
                {"id": 3, "type": "LoraLoader", "widgets_values": ["detail.SafeTensors", 1.0, 1.0]},
                {"id": 4, "type": "KSampler"}
            ]
        });
        let out = extract(&wf);
        assert_eq!(
            out.node_types.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["CheckpointLoaderSimple", "KSampler", "LoraLoader"]
        );
        assert_eq!(out.models.len(), 2);
        assert!(out.models["detail.SafeTensors"].contains("LoraLoader"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn expands_group_nodes_and_skips_group_types() {
        let wf = json!({
            "nodes": [{"id": 1, "type": "workflow/MyGroup"}],
            "extra": {"groupNodes": {
                "workflow/MyGroup": {"nodes": [{"type": "Inner"}, {"type": "Other"}]}
            }}
        });
        let out = extract(&wf);
        assert_eq!(
            out.node_types.into_iter().collect::<Vec<_>>(),
            vec!["Inner".to_string(), "Other".to_string()]
        );
    }

    #[test]
    fn records_without_type_warn() {
        let wf = json!({"nodes": [{"id": 7}, {"id": 8, "type": 3}, {"type": "Ok"}]});
        let out = extract(&wf);
        assert_eq!(out.node_types.len(), 1);
        assert_eq!(out.warnings.len(), 2);
        assert!(out.warnings[0].contains("node 7"));
    }

    #[test]
    fn recognizes_model_extensions() {
        assert!(is_model_filename("a.ckpt"));
        assert!(is_model_filename("b.PTH"));
        assert!(!is_model_filename("notes.txt"));
        assert!(!is_model_filename("safetensors"));
    }
}
