use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RunnerConfig;
use crate::hook::HookConfig;

/// The `(name, kubeconfig, context)` tuple identifying a Kubernetes API
/// endpoint. `kubeconfig` and `context` are optional; an empty target falls
/// back to ambient client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTarget {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Options applied when installing or upgrading a release. Unset fields are
/// omitted from serialization and from the effective-input hash; presence
/// alone alters the hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atomic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<bool>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

/// Options applied when uninstalling a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

/// Coarse role of a release, inferred from its name and chart reference.
/// Roles feed the per-kind scheduler budget and the `critical` flag on
/// node metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseRole {
    Namespace,
    Crd,
    Rbac,
    Webhook,
    #[default]
    Workload,
}

impl ReleaseRole {
    /// Infer the role from a release name and chart reference.
    pub fn infer(name: &str, chart: &str) -> Self {
        let hay = format!("{} {}", name.to_lowercase(), chart.to_lowercase());
        if hay.contains("namespace") {
            ReleaseRole::Namespace
        } else if hay.contains("crd") {
            ReleaseRole::Crd
        } else if hay.contains("rbac") || hay.contains("role") {
            ReleaseRole::Rbac
        } else if hay.contains("webhook") {
            ReleaseRole::Webhook
        } else {
            ReleaseRole::Workload
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseRole::Namespace => "namespace",
            ReleaseRole::Crd => "crd",
            ReleaseRole::Rbac => "rbac",
            ReleaseRole::Webhook => "webhook",
            ReleaseRole::Workload => "workload",
        }
    }

    /// Non-workload roles gate other releases and are surfaced as critical
    /// in node metadata.
    pub fn is_critical(&self) -> bool {
        !matches!(self, ReleaseRole::Workload)
    }
}

/// A fully resolved plan node. The node owns its hook configuration; the
/// plan owns the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRelease {
    /// Stable identifier `cluster/namespace/name`.
    pub id: String,
    pub name: String,
    /// Directory the release was declared in; relative chart and values
    /// paths resolve against it.
    pub dir: PathBuf,
    pub cluster: ClusterTarget,
    pub namespace: String,
    /// Chart reference: filesystem path or `scheme://` URL.
    pub chart: String,
    /// Values files in application order.
    #[serde(default)]
    pub values: Vec<String>,
    /// `--set` overrides. Keys are unique; serialized sorted for hashing.
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Names of releases in the same cluster that must succeed first.
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub apply: ApplyOptions,
    #[serde(default)]
    pub delete: DeleteOptions,
    #[serde(default)]
    pub hooks: HookConfig,
    #[serde(default)]
    pub role: ReleaseRole,
    #[serde(default)]
    pub wave: u32,
    #[serde(default)]
    pub parallelism_group: String,
    /// Topological layer assigned by the compiler.
    #[serde(default)]
    pub execution_group: u32,
    /// `"sha256:…"` digest of everything that would change the deploy.
    #[serde(default)]
    pub effective_input_hash: String,
    /// Opaque JSON describing what went into the hash, for drift reports.
    #[serde(default)]
    pub inputs_cursor: serde_json::Value,
    /// Reasons this node was selected, recorded by the selector.
    #[serde(default)]
    pub selected_by: Vec<String>,
}

impl ResolvedRelease {
    /// Compose the stable node id from its coordinates.
    pub fn make_id(cluster: &str, namespace: &str, name: &str) -> String {
        format!("{cluster}/{namespace}/{name}")
    }

    /// Budget key for the per-kind limit.
    pub fn primary_kind(&self) -> &'static str {
        self.role.as_str()
    }

    /// Budget key for the per-namespace limit.
    pub fn namespace_key(&self) -> String {
        format!("{}/{}", self.cluster.name, self.namespace)
    }
}

/// A compiled, validated plan: the unit of execution and sealing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub stack_root: PathBuf,
    pub stack_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub nodes: Vec<ResolvedRelease>,
    /// Deterministic linearized order for display and audit.
    pub order: Vec<String>,
    pub runner: RunnerConfig,
    /// Stack-level hooks that run at most once per run.
    #[serde(default)]
    pub run_once_hooks: HookConfig,
    /// `sha256:` digest of the plan with this field cleared; set when sealing.
    #[serde(default)]
    pub plan_hash: String,

    #[serde(skip)]
    by_id: BTreeMap<String, usize>,
    #[serde(skip)]
    by_cluster: BTreeMap<String, Vec<usize>>,
}

impl Plan {
    pub fn new(
        stack_root: PathBuf,
        stack_name: String,
        profile: Option<String>,
        nodes: Vec<ResolvedRelease>,
        order: Vec<String>,
        runner: RunnerConfig,
        run_once_hooks: HookConfig,
    ) -> Self {
        let mut plan = Self {
            stack_root,
            stack_name,
            profile,
            nodes,
            order,
            runner,
            run_once_hooks,
            plan_hash: String::new(),
            by_id: BTreeMap::new(),
            by_cluster: BTreeMap::new(),
        };
        plan.reindex();
        plan
    }

    /// Rebuild the non-owning secondary indices. Must be called after
    /// deserialization or any mutation of `nodes`.
    pub fn reindex(&mut self) {
        self.by_id.clear();
        self.by_cluster.clear();
        for (i, node) in self.nodes.iter().enumerate() {
            self.by_id.insert(node.id.clone(), i);
            self.by_cluster
                .entry(node.cluster.name.clone())
                .or_default()
                .push(i);
        }
    }

    pub fn node(&self, id: &str) -> Option<&ResolvedRelease> {
        self.by_id.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut ResolvedRelease> {
        let i = *self.by_id.get(id)?;
        self.nodes.get_mut(i)
    }

    pub fn cluster_nodes(&self, cluster: &str) -> Vec<&ResolvedRelease> {
        self.by_cluster
            .get(cluster)
            .map(|ids| ids.iter().map(|&i| &self.nodes[i]).collect())
            .unwrap_or_default()
    }

    pub fn clusters(&self) -> Vec<&str> {
        self.by_cluster.keys().map(String::as_str).collect()
    }

    /// The single namespace used by every node, if there is exactly one.
    /// Stack-level kubectl hooks default to it.
    pub fn sole_namespace(&self) -> Option<&str> {
        let mut namespaces = self.nodes.iter().map(|n| n.namespace.as_str());
        let first = namespaces.next()?;
        if namespaces.all(|ns| ns == first) {
            Some(first)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(cluster: &str, namespace: &str, name: &str) -> ResolvedRelease {
        ResolvedRelease {
            id: ResolvedRelease::make_id(cluster, namespace, name),
            name: name.to_string(),
            dir: PathBuf::from("releases").join(name),
            cluster: ClusterTarget {
                name: cluster.to_string(),
                kubeconfig: None,
                context: None,
            },
            namespace: namespace.to_string(),
            chart: format!("charts/{name}"),
            values: vec![],
            set: BTreeMap::new(),
            tags: BTreeSet::new(),
            needs: vec![],
            apply: ApplyOptions::default(),
            delete: DeleteOptions::default(),
            hooks: HookConfig::default(),
            role: ReleaseRole::Workload,
            wave: 0,
            parallelism_group: String::new(),
            execution_group: 0,
            effective_input_hash: String::new(),
            inputs_cursor: serde_json::Value::Null,
            selected_by: vec![],
        }
    }

    #[test]
    fn make_id_joins_coordinates() {
        assert_eq!(
            ResolvedRelease::make_id("prod", "kube-system", "dns"),
            "prod/kube-system/dns"
        );
    }

    #[test]
    fn role_inference_matches_common_names() {
        assert_eq!(ReleaseRole::infer("namespaces", "charts/ns"), ReleaseRole::Namespace);
        assert_eq!(ReleaseRole::infer("cert-manager-crds", "x"), ReleaseRole::Crd);
        assert_eq!(ReleaseRole::infer("cluster-rbac", "x"), ReleaseRole::Rbac);
        assert_eq!(ReleaseRole::infer("admission-webhook", "x"), ReleaseRole::Webhook);
        assert_eq!(ReleaseRole::infer("api", "charts/api"), ReleaseRole::Workload);
    }

    #[test]
    fn plan_index_finds_nodes_after_reindex() {
        let mut plan = Plan::new(
            PathBuf::from("."),
            "demo".to_string(),
            None,
            vec![node("prod", "default", "a"), node("prod", "default", "b")],
            vec!["prod/default/a".to_string(), "prod/default/b".to_string()],
            RunnerConfig::default(),
            HookConfig::default(),
        );
        assert!(plan.node("prod/default/a").is_some());
        assert_eq!(plan.cluster_nodes("prod").len(), 2);

        plan.nodes.push(node("staging", "default", "c"));
        plan.reindex();
        assert!(plan.node("staging/default/c").is_some());
        assert_eq!(plan.clusters(), vec!["prod", "staging"]);
    }

    #[test]
    fn plan_roundtrip_preserves_lookups() {
        let plan = Plan::new(
            PathBuf::from("."),
            "demo".to_string(),
            Some("prod".to_string()),
            vec![node("prod", "default", "a")],
            vec!["prod/default/a".to_string()],
            RunnerConfig::default(),
            HookConfig::default(),
        );
        let json = serde_json::to_string(&plan).expect("serialize");
        let mut rt: Plan = serde_json::from_str(&json).expect("deserialize");
        assert!(rt.node("prod/default/a").is_none(), "indices are not serialized");
        rt.reindex();
        assert!(rt.node("prod/default/a").is_some());
    }

    #[test]
    fn sole_namespace_requires_uniformity() {
        let uniform = Plan::new(
            PathBuf::from("."),
            "demo".to_string(),
            None,
            vec![node("prod", "apps", "a"), node("prod", "apps", "b")],
            vec![],
            RunnerConfig::default(),
            HookConfig::default(),
        );
        assert_eq!(uniform.sole_namespace(), Some("apps"));

        let mixed = Plan::new(
            PathBuf::from("."),
            "demo".to_string(),
            None,
            vec![node("prod", "apps", "a"), node("prod", "infra", "b")],
            vec![],
            RunnerConfig::default(),
            HookConfig::default(),
        );
        assert_eq!(mixed.sole_namespace(), None);
    }

    #[test]
    fn apply_options_omit_unset_fields() {
        let json = serde_json::to_string(&ApplyOptions::default()).expect("serialize");
        assert_eq!(json, "{}");

        let opts = ApplyOptions {
            atomic: Some(true),
            wait: None,
            timeout: Some(Duration::from_secs(300)),
        };
        let json = serde_json::to_string(&opts).expect("serialize");
        assert!(json.contains("atomic"));
        assert!(!json.contains("wait"));
        let rt: ApplyOptions = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rt, opts);
    }
}
