//! Dependency graph: workflow node types → providing repositories.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::channels::Resolution;
use crate::models::{NodeType, Repository};

/// Anything that can map a node type to its providing repository.
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, node_type: &str) -> Option<Resolution>;
}

/// A node type claimed by more than one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimConflict {
    pub node_type: NodeType,
    pub chosen: String,
    pub others: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    pub repos: BTreeMap<String, Repository>,
    pub node_repo: BTreeMap<NodeType, String>,
    pub unresolved: BTreeSet<NodeType>,
    pub conflicts: Vec<ClaimConflict>,
}

impl DependencyGraph {
    /// Drop repositories no node type needs.
    pub fn retain_demanded(&mut self) {
        self.repos.retain(|_, repo| !repo.needed_by.is_empty());
    }

    /// Repositories other than the ones listed in `core`.
    pub fn external_repos<'a>(&'a self, core: &'a [String]) -> impl Iterator<Item = &'a Repository> {
        self.repos.values().filter(move |repo| {
            !core
                .iter()
                .any(|c| c.trim_end_matches('/').eq_ignore_ascii_case(repo.url.trim_end_matches('/')))
        })
    }
}

/// Resolve every node type once and group them by repository.
///
/// Each node type lands in exactly one of `node_repo` or `unresolved`.
pub fn build_graph<'a, I>(node_types: I, resolver: &dyn NodeResolver) -> DependencyGraph
where
    I: IntoIterator<Item = &'a NodeType>,
{
    let unique: BTreeSet<&NodeType> = node_types.into_iter().collect();
    let mut graph = DependencyGraph::default();

    for node_type in unique {
        match resolver.resolve(node_type) {
            Some(resolution) => {
                if !resolution.conflicting.is_empty() {
                    tracing::warn!(
                        node_type = %node_type,
                        chosen = %resolution.repo_url,
                        others = ?resolution.conflicting,
                        "node type claimed by several repositories"
                    );
                    graph.conflicts.push(ClaimConflict {
                        node_type: node_type.clone(),
                        chosen: resolution.repo_url.clone(),
                        others: resolution.conflicting.clone(),
                    });
                }
                graph
                    .repos
                    .entry(resolution.repo_url.clone())
                    .or_insert_with(|| Repository::new(resolution.repo_url.clone()))
                    .needed_by
                    .insert(node_type.clone());
                graph.node_repo.insert(node_type.clone(), resolution.repo_url);
            }
            None => {
                graph.unresolved.insert(node_type.clone());
            }
        }
    }

    graph.retain_demanded();
    tracing::info!(
        repos = graph.repos.len(),
        resolved = graph.node_repo.len(),
        unresolved = graph.unresolved.len(),
        "built dependency graph"
    );
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapResolver(HashMap<&'static str, (&'static str, Vec<String>)>);

    impl NodeResolver for MapResolver {
        fn resolve(&self, node_type: &str) -> Option<Resolution> {
            self.0.get(node_type).map(|(url, others)| Resolution {
                repo_url: url.to_string(),
                channel: Some("test".into()),
                conflicting: others.clone(),
            })
        }
    }

    fn resolver() -> MapResolver {
        MapResolver(HashMap::from([
            ("A", ("https://r", vec![])),
            ("B", ("https://r", vec![])),
            ("D", ("https://s", vec!["https://t".to_string()])),
        ]))
    }

    #[test]
    fn partitions_node_types() {
        let types: Vec<NodeType> = ["A", "B", "C", "D", "A"].map(String::from).to_vec();
        let graph = build_graph(&types, &resolver());

        let resolved: BTreeSet<&str> = graph.node_repo.keys().map(String::as_str).collect();
        let unresolved: BTreeSet<&str> = graph.unresolved.iter().map(String::as_str).collect();
        assert!(resolved.is_disjoint(&unresolved));
        assert_eq!(resolved.len() + unresolved.len(), 4);
        assert_eq!(unresolved, BTreeSet::from(["C"]));

        let r = &graph.repos["https://r"];
        assert_eq!(r.needed_by, BTreeSet::from(["A".to_string(), "B".to_string()]));
        assert!(graph.repos.values().all(|r| !r.needed_by.is_empty()));
    }

    #[test]
    fn records_conflicts() {
        let types = vec!["D".to_string()];
        let graph = build_graph(&types, &resolver());
        assert_eq!(
            graph.conflicts,
            vec![ClaimConflict {
                node_type: "D".into(),
                chosen: "https://s".into(),
                others: vec!["https://t".into()],
            }]
        );
    }

    #[test]
    fn retain_drops_empty_repos() {
        let mut graph = DependencyGraph::default();
        graph.repos.insert("https://empty".into(), Repository::new("https://empty"));
        graph.retain_demanded();
        assert!(graph.repos.is_empty());
    }

    #[test]
    fn external_repos_skip_core() {
        let types = vec!["A".to_string(), "D".to_string()];
        let graph = build_graph(&types, &resolver());
        let core = vec!["https://r/".to_string()];
        let urls: Vec<&str> = graph.external_repos(&core).map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://s"]);
    }
}
