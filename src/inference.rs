//! Static discovery of the model folders a plugin's nodes read from.
//!
//! Plugins declare the folder a node loads models from with a call such as
//!
//! ```python
//! folder_paths.get_filename_list("loras")
//! ```
//!
//! The engine parses every source file into a [`SyntaxNode`] tree and looks
//! for calls of that shape: an attribute access on the configured module
//! alias, naming one of the configured functions, with a string literal as
//! the first argument. Plugin code is never executed.
//!
//! Attribution rules:
//! - a match inside a class body belongs to that class;
//! - a match outside every class belongs to every class in the same file;
//! - `NODE_CLASS_MAPPINGS = {"Key": Class}` makes `Key` inherit `Class`'s folders.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::InferenceConfig;
use crate::models::FolderMapping;
use crate::repo_source::{load_source_tree, SourceTree};
use crate::syntax::{walk, NodeKind, SourceParser, SyntaxNode, Visitor};

const CLASS_MAPPINGS: &str = "NODE_CLASS_MAPPINGS";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepoInference {
    pub folders: FolderMapping,
    pub warnings: Vec<String>,
}

/// What one file contributes before repository-wide attribution.
#[derive(Debug, Default)]
struct FileFindings {
    classes: Vec<String>,
    class_folders: BTreeMap<String, BTreeSet<String>>,
    module_folders: BTreeSet<String>,
    mappings: Vec<(String, String)>,
    warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InferenceEngine {
    module_alias: String,
    functions: Vec<String>,
}

impl InferenceEngine {
    pub fn new(module_alias: impl Into<String>, functions: Vec<String>) -> Self {
        Self {
            module_alias: module_alias.into(),
            functions,
        }
    }

    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new(config.module_alias.clone(), config.functions.clone())
    }

    /// Scan a repository's source tree. Files that fail to parse are skipped
    /// with a warning; the scan itself never fails.
    pub fn scan(&self, tree: &SourceTree, parser: &dyn SourceParser) -> RepoInference {
        let mut class_folders: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut mappings: Vec<(String, String)> = Vec::new();
        let mut warnings = tree.warnings.clone();

        for file in &tree.files {
            let syntax = match parser.parse(&file.path, &file.text) {
                Ok(syntax) => syntax,
                Err(err) => {
                    tracing::debug!("{}", err);
                    warnings.push(format!("skipped unparsable file: {}", err));
                    continue;
                }
            };

            let findings = self.scan_file(&file.path, &syntax);
            for (class, folders) in findings.class_folders {
                class_folders.entry(class).or_default().extend(folders);
            }
            if !findings.module_folders.is_empty() {
                for class in &findings.classes {
                    class_folders
                        .entry(class.clone())
                        .or_default()
                        .extend(findings.module_folders.iter().cloned());
                }
            }
            mappings.extend(findings.mappings);
            warnings.extend(findings.warnings);
        }

        let mut folders: FolderMapping = class_folders
            .iter()
            .filter(|(_, f)| !f.is_empty())
            .map(|(c, f)| (c.clone(), f.clone()))
            .collect();
        for (key, class) in mappings {
            if let Some(found) = class_folders.get(&class).filter(|f| !f.is_empty()) {
                folders.entry(key).or_default().extend(found.iter().cloned());
            }
        }

        RepoInference { folders, warnings }
    }

    fn scan_file(&self, path: &Path, tree: &SyntaxNode) -> FileFindings {
        let mut visitor = FileVisitor {
            engine: self,
            path,
            class_stack: Vec::new(),
            findings: FileFindings::default(),
        };
        walk(&mut visitor, tree);
        visitor.findings
    }

    fn is_folder_call(&self, call: &SyntaxNode) -> bool {
        let Some(callee) = call.children.first() else {
            return false;
        };
        match &callee.kind {
            NodeKind::Attribute { attr } => {
                self.functions.iter().any(|f| f == attr)
                    && callee
                        .children
                        .first()
                        .and_then(SyntaxNode::as_name)
                        .is_some_and(|id| id == self.module_alias)
            }
            _ => false,
        }
    }
}

struct FileVisitor<'a> {
    engine: &'a InferenceEngine,
    path: &'a Path,
    class_stack: Vec<String>,
    findings: FileFindings,
}

impl FileVisitor<'_> {
    fn record_folder_call(&mut self, call: &SyntaxNode) {
        let folder = call.positional_args().first().and_then(SyntaxNode::as_str_literal);
        let Some(folder) = folder else {
            self.findings.warnings.push(format!(
                "{}:{}: folder argument is not a string literal; ignored",
                self.path.display(),
                call.line
            ));
            return;
        };

        match self.class_stack.last() {
            Some(class) => {
                self.findings
                    .class_folders
                    .entry(class.clone())
                    .or_default()
                    .insert(folder.to_string());
            }
            None => {
                self.findings.module_folders.insert(folder.to_string());
            }
        }
    }

    fn record_mappings(&mut self, dict: &SyntaxNode) {
        for pair in dict.children.iter().filter(|c| c.kind == NodeKind::Pair) {
            let (Some(key), Some(value)) = (pair.children.first(), pair.children.get(1)) else {
                continue;
            };
            let Some(key) = key.as_str_literal() else {
                continue;
            };
            let class = match &value.kind {
                NodeKind::Name { id } => id.clone(),
                NodeKind::Attribute { attr } => attr.clone(),
                _ => continue,
            };
            self.findings.mappings.push((key.to_string(), class));
        }
    }
}

impl Visitor for FileVisitor<'_> {
    fn enter(&mut self, node: &SyntaxNode) -> bool {
        match &node.kind {
            NodeKind::ClassDef { name } => {
                self.findings.classes.push(name.clone());
                self.class_stack.push(name.clone());
            }
            NodeKind::Call if self.engine.is_folder_call(node) => self.record_folder_call(node),
            NodeKind::Call => {
                // NODE_CLASS_MAPPINGS.update({...})
                let is_update = node.children.first().is_some_and(|callee| {
                    matches!(&callee.kind, NodeKind::Attribute { attr } if attr == "update")
                        && callee.children.first().and_then(SyntaxNode::as_name) == Some(CLASS_MAPPINGS)
                });
                if is_update {
                    if let Some(dict) = node.positional_args().first().filter(|a| a.kind == NodeKind::Dict) {
                        self.record_mappings(dict);
                    }
                }
            }
            NodeKind::Assign => {
                let target = node.children.first().and_then(SyntaxNode::as_name);
                if target == Some(CLASS_MAPPINGS) {
                    if let Some(dict) = node.children.get(1).filter(|v| v.kind == NodeKind::Dict) {
                        self.record_mappings(dict);
                    }
                }
            }
            _ => {}
        }
        true
    }

    fn leave(&mut self, node: &SyntaxNode) {
        if matches!(node.kind, NodeKind::ClassDef { .. }) {
            self.class_stack.pop();
        }
    }
}

/// Load `dir` and scan it on the blocking pool.
pub async fn infer_dir(
    engine: Arc<InferenceEngine>,
    parser: Arc<dyn SourceParser>,
    dir: PathBuf,
) -> Result<RepoInference> {
    tokio::task::spawn_blocking(move || -> Result<RepoInference> {
        let tree = load_source_tree(&dir)?;
        tracing::debug!(dir = %dir.display(), files = tree.files.len(), "scanning source tree");
        Ok(engine.scan(&tree, parser.as_ref()))
    })
    .await?
}
