use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ktl_stack_graph::{GraphError, ReleaseGraph};
use ktl_stack_types::Plan;

/// What the user asked to run. An empty spec selects everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorSpec {
    /// Restrict to one cluster before any other matching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Root-relative directory prefixes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    /// Release names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    /// Changed files from a git range, mapped to their nearest release
    /// directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_files: Vec<PathBuf>,
    #[serde(default)]
    pub include_deps: bool,
    #[serde(default)]
    pub include_dependents: bool,
    /// Prune `needs` pointing outside the selection instead of failing.
    #[serde(default)]
    pub allow_missing_deps: bool,
}

impl SelectorSpec {
    /// Whether any explicit selector is present. Without one, every node is
    /// selected with reason `default:all`.
    pub fn is_explicit(&self) -> bool {
        !self.tags.is_empty()
            || !self.paths.is_empty()
            || !self.names.is_empty()
            || !self.changed_files.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error(
        "selected release {node} needs {needs} in cluster {cluster}, which is not selected; \
         pass allow-missing-deps to prune it"
    )]
    MissingDependency {
        node: String,
        needs: String,
        cluster: String,
    },
    #[error("dependency cycle detected among: {}", participants.join(", "))]
    Cycle { participants: Vec<String> },
}

impl From<GraphError> for SelectError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::UnknownDependency {
                node,
                needs,
                cluster,
            } => SelectError::MissingDependency {
                node,
                needs,
                cluster,
            },
            GraphError::Cycle { participants } => SelectError::Cycle { participants },
        }
    }
}

/// Applies a [`SelectorSpec`] to a plan, producing the narrowed plan with
/// `selected_by` reasons and recomputed execution groups.
#[derive(Debug, Clone)]
pub struct Selector {
    spec: SelectorSpec,
}

impl Selector {
    pub fn new(spec: SelectorSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &SelectorSpec {
        &self.spec
    }

    pub fn apply(&self, plan: &Plan) -> Result<Plan, SelectError> {
        // Reasons per node id, in discovery order.
        let mut reasons: BTreeMap<String, Vec<String>> = BTreeMap::new();

        let candidates: Vec<_> = plan
            .nodes
            .iter()
            .filter(|n| {
                self.spec
                    .cluster
                    .as_ref()
                    .is_none_or(|c| &n.cluster.name == c)
            })
            .collect();

        if !self.spec.is_explicit() {
            for node in &candidates {
                reasons
                    .entry(node.id.clone())
                    .or_default()
                    .push("default:all".to_string());
            }
        } else {
            for node in &candidates {
                let entry = reasons.entry(node.id.clone()).or_default();
                for tag in &self.spec.tags {
                    if node.tags.contains(tag) {
                        entry.push(format!("tag:{tag}"));
                    }
                }
                for name in &self.spec.names {
                    if &node.name == name {
                        entry.push(format!("name:{name}"));
                    }
                }
                let rel_dir = node
                    .dir
                    .strip_prefix(&plan.stack_root)
                    .unwrap_or(&node.dir)
                    .to_path_buf();
                for path in &self.spec.paths {
                    if rel_dir.starts_with(path) {
                        entry.push(format!("path:{path}"));
                    }
                }
            }
            for reason in git_reasons(plan, &candidates, &self.spec.changed_files) {
                reasons
                    .entry(reason.0)
                    .or_default()
                    .push(reason.1);
            }
            reasons.retain(|_, r| !r.is_empty());
        }

        // Expansion walks the full graph, not the filtered one, so that a
        // selected node can pull in deps outside the cluster filter only
        // when they exist; needs never cross clusters, so in practice the
        // filter is preserved.
        let graph = ReleaseGraph::build(&plan.nodes)?;
        if self.spec.include_deps {
            let start: Vec<String> = reasons.keys().cloned().collect();
            for dep in graph.closure_deps(&start) {
                for id in &start {
                    if graph.closure_deps(std::slice::from_ref(id)).contains(&dep) {
                        reasons
                            .entry(dep.clone())
                            .or_default()
                            .push(format!("expand:dep-of:{id}"));
                        break;
                    }
                }
            }
        }
        if self.spec.include_dependents {
            let start: Vec<String> = reasons
                .iter()
                .filter(|(_, r)| !r.iter().any(|s| s.starts_with("expand:")))
                .map(|(id, _)| id.clone())
                .collect();
            for dependent in graph.closure_dependents(&start) {
                for id in &start {
                    if graph
                        .closure_dependents(std::slice::from_ref(id))
                        .contains(&dependent)
                    {
                        reasons
                            .entry(dependent.clone())
                            .or_default()
                            .push(format!("expand:dependent-of:{id}"));
                        break;
                    }
                }
            }
        }

        // Selected (cluster, name) pairs for needs resolution.
        let selected_names: BTreeSet<(String, String)> = plan
            .nodes
            .iter()
            .filter(|n| reasons.contains_key(&n.id))
            .map(|n| (n.cluster.name.clone(), n.name.clone()))
            .collect();

        let mut nodes = Vec::new();
        for node in &plan.nodes {
            let Some(selected_by) = reasons.get(&node.id) else {
                continue;
            };
            let mut node = node.clone();
            node.selected_by = selected_by.clone();
            let mut kept = Vec::new();
            for needs in std::mem::take(&mut node.needs) {
                if selected_names.contains(&(node.cluster.name.clone(), needs.clone())) {
                    kept.push(needs);
                } else if !self.spec.allow_missing_deps {
                    return Err(SelectError::MissingDependency {
                        node: node.id.clone(),
                        needs,
                        cluster: node.cluster.name.clone(),
                    });
                }
            }
            node.needs = kept;
            nodes.push(node);
        }

        // Execution groups and the linearized order are properties of the
        // selected subgraph.
        let subgraph = ReleaseGraph::build(&nodes)?;
        let groups = subgraph.execution_groups()?;
        let order = subgraph.linearize()?;
        for node in &mut nodes {
            node.execution_group = groups[&node.id];
        }

        Ok(Plan::new(
            plan.stack_root.clone(),
            plan.stack_name.clone(),
            plan.profile.clone(),
            nodes,
            order,
            plan.runner.clone(),
            plan.run_once_hooks.clone(),
        ))
    }
}

/// Map changed files to the release owning the nearest (deepest) enclosing
/// directory.
fn git_reasons(
    plan: &Plan,
    candidates: &[&ktl_stack_types::ResolvedRelease],
    changed: &[PathBuf],
) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for file in changed {
        let mut best: Option<(&str, usize)> = None;
        for node in candidates {
            let rel_dir = node.dir.strip_prefix(&plan.stack_root).unwrap_or(&node.dir);
            if file.starts_with(rel_dir) || rel_dir == Path::new("") {
                let depth = rel_dir.components().count();
                if best.is_none_or(|(_, d)| depth > d) {
                    best = Some((&node.id, depth));
                }
            }
        }
        if let Some((id, _)) = best {
            out.push((id.to_string(), format!("git:{}", file.display())));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use ktl_stack_types::{ClusterTarget, ResolvedRelease, RunnerConfig};

    use super::*;

    fn node(cluster: &str, name: &str, dir: &str, tags: &[&str], needs: &[&str]) -> ResolvedRelease {
        ResolvedRelease {
            id: ResolvedRelease::make_id(cluster, "default", name),
            name: name.to_string(),
            dir: PathBuf::from("/stack").join(dir),
            cluster: ClusterTarget {
                name: cluster.to_string(),
                kubeconfig: None,
                context: None,
            },
            namespace: "default".to_string(),
            chart: format!("charts/{name}"),
            values: vec![],
            set: Default::default(),
            tags: tags.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            apply: Default::default(),
            delete: Default::default(),
            hooks: Default::default(),
            role: Default::default(),
            wave: 0,
            parallelism_group: String::new(),
            execution_group: 0,
            effective_input_hash: String::new(),
            inputs_cursor: serde_json::Value::Null,
            selected_by: vec![],
        }
    }

    fn plan_of(nodes: Vec<ResolvedRelease>) -> Plan {
        let order = nodes.iter().map(|n| n.id.clone()).collect();
        Plan::new(
            PathBuf::from("/stack"),
            "demo".to_string(),
            None,
            nodes,
            order,
            RunnerConfig::default(),
            Default::default(),
        )
    }

    #[test]
    fn empty_selector_selects_everything_with_default_reason() {
        let plan = plan_of(vec![
            node("prod", "a", "a", &[], &[]),
            node("prod", "b", "b", &[], &["a"]),
        ]);
        let selected = Selector::new(SelectorSpec::default()).apply(&plan).expect("select");
        assert_eq!(selected.nodes.len(), 2);
        for n in &selected.nodes {
            assert_eq!(n.selected_by, vec!["default:all".to_string()]);
        }
    }

    #[test]
    fn cluster_filter_applies_before_selectors() {
        let plan = plan_of(vec![
            node("prod", "a", "a", &[], &[]),
            node("staging", "a2", "a2", &[], &[]),
        ]);
        let spec = SelectorSpec {
            cluster: Some("prod".to_string()),
            ..SelectorSpec::default()
        };
        let selected = Selector::new(spec).apply(&plan).expect("select");
        assert_eq!(selected.nodes.len(), 1);
        assert_eq!(selected.nodes[0].id, "prod/default/a");
    }

    #[test]
    fn tag_name_and_path_selectors_record_reasons() {
        let plan = plan_of(vec![
            node("prod", "api", "apps/api", &["web"], &[]),
            node("prod", "db", "data/db", &["storage"], &[]),
        ]);
        let spec = SelectorSpec {
            tags: vec!["web".to_string()],
            names: vec!["db".to_string()],
            paths: vec!["apps".to_string()],
            allow_missing_deps: true,
            ..SelectorSpec::default()
        };
        let selected = Selector::new(spec).apply(&plan).expect("select");
        assert_eq!(selected.nodes.len(), 2);
        let api = selected.nodes.iter().find(|n| n.name == "api").unwrap();
        assert!(api.selected_by.contains(&"tag:web".to_string()));
        assert!(api.selected_by.contains(&"path:apps".to_string()));
        let db = selected.nodes.iter().find(|n| n.name == "db").unwrap();
        assert_eq!(db.selected_by, vec!["name:db".to_string()]);
    }

    #[test]
    fn changed_files_map_to_nearest_release_dir() {
        let plan = plan_of(vec![
            node("prod", "apps", "apps", &[], &[]),
            node("prod", "api", "apps/api", &[], &[]),
        ]);
        let spec = SelectorSpec {
            changed_files: vec![PathBuf::from("apps/api/values.yaml")],
            allow_missing_deps: true,
            ..SelectorSpec::default()
        };
        let selected = Selector::new(spec).apply(&plan).expect("select");
        assert_eq!(selected.nodes.len(), 1);
        assert_eq!(selected.nodes[0].name, "api");
        assert_eq!(
            selected.nodes[0].selected_by,
            vec!["git:apps/api/values.yaml".to_string()]
        );
    }

    #[test]
    fn include_deps_expands_with_reasons() {
        let plan = plan_of(vec![
            node("prod", "base", "base", &[], &[]),
            node("prod", "mid", "mid", &[], &["base"]),
            node("prod", "top", "top", &["pick"], &["mid"]),
        ]);
        let spec = SelectorSpec {
            tags: vec!["pick".to_string()],
            include_deps: true,
            ..SelectorSpec::default()
        };
        let selected = Selector::new(spec).apply(&plan).expect("select");
        assert_eq!(selected.nodes.len(), 3);
        let base = selected.nodes.iter().find(|n| n.name == "base").unwrap();
        assert_eq!(
            base.selected_by,
            vec!["expand:dep-of:prod/default/top".to_string()]
        );
    }

    #[test]
    fn include_dependents_expands_downstream() {
        let plan = plan_of(vec![
            node("prod", "base", "base", &["pick"], &[]),
            node("prod", "mid", "mid", &[], &["base"]),
        ]);
        let spec = SelectorSpec {
            tags: vec!["pick".to_string()],
            include_dependents: true,
            allow_missing_deps: true,
            ..SelectorSpec::default()
        };
        let selected = Selector::new(spec).apply(&plan).expect("select");
        assert_eq!(selected.nodes.len(), 2);
        let mid = selected.nodes.iter().find(|n| n.name == "mid").unwrap();
        assert_eq!(
            mid.selected_by,
            vec!["expand:dependent-of:prod/default/base".to_string()]
        );
    }

    #[test]
    fn missing_deps_error_without_allowance() {
        let plan = plan_of(vec![
            node("prod", "base", "base", &[], &[]),
            node("prod", "top", "top", &["pick"], &["base"]),
        ]);
        let spec = SelectorSpec {
            tags: vec!["pick".to_string()],
            ..SelectorSpec::default()
        };
        let err = Selector::new(spec).apply(&plan).expect_err("must fail");
        assert!(matches!(err, SelectError::MissingDependency { .. }));
    }

    #[test]
    fn missing_deps_are_pruned_when_allowed() {
        let plan = plan_of(vec![
            node("prod", "base", "base", &[], &[]),
            node("prod", "top", "top", &["pick"], &["base"]),
        ]);
        let spec = SelectorSpec {
            tags: vec!["pick".to_string()],
            allow_missing_deps: true,
            ..SelectorSpec::default()
        };
        let selected = Selector::new(spec).apply(&plan).expect("select");
        assert_eq!(selected.nodes.len(), 1);
        assert!(selected.nodes[0].needs.is_empty());
    }

    #[test]
    fn execution_groups_are_recomputed_on_the_subgraph() {
        let plan = plan_of(vec![
            node("prod", "base", "base", &[], &[]),
            node("prod", "mid", "mid", &["pick"], &["base"]),
            node("prod", "top", "top", &["pick"], &["mid"]),
        ]);
        let spec = SelectorSpec {
            tags: vec!["pick".to_string()],
            allow_missing_deps: true,
            ..SelectorSpec::default()
        };
        let selected = Selector::new(spec).apply(&plan).expect("select");
        // base was pruned away; mid becomes a root of the subgraph.
        let mid = selected.nodes.iter().find(|n| n.name == "mid").unwrap();
        let top = selected.nodes.iter().find(|n| n.name == "top").unwrap();
        assert_eq!(mid.execution_group, 0);
        assert_eq!(top.execution_group, 1);
        assert_eq!(
            selected.order,
            vec!["prod/default/mid".to_string(), "prod/default/top".to_string()]
        );
    }
}
