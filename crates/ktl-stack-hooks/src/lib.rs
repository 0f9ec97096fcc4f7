//! Lifecycle hook execution for stack releases.
//!
//! Three hook types: `kubectl` (exec the binary with merged args and
//! injected cluster flags), `script` (exec an argv with the ktl env
//! contract) and `http` (blocking request, 2xx/3xx is success). Each hook
//! runs with a per-attempt timeout and linear retry backoff; output is
//! handed to the caller for ephemeral streaming.

mod exec;
mod stage;

pub use exec::{HookError, HookOutput, HookResult, run_hook};
pub use stage::{HookStage, StagedHook, stage_hooks};

use std::path::{Path, PathBuf};

use ktl_stack_types::{Command, ResolvedRelease};

/// Ambient context a hook runs in. `node` is absent for stack-level
/// run-once hooks.
#[derive(Debug, Clone)]
pub struct HookContext<'a> {
    pub stack_root: &'a Path,
    pub profile: Option<&'a str>,
    pub run_id: &'a str,
    pub command: Command,
    pub node: Option<&'a ResolvedRelease>,
    /// The plan's sole namespace, used by stack-level kubectl hooks.
    pub sole_namespace: Option<&'a str>,
}

impl HookContext<'_> {
    /// Working directory for script hooks without an explicit one.
    pub fn default_work_dir(&self) -> PathBuf {
        self.node
            .map(|n| n.dir.clone())
            .unwrap_or_else(|| self.stack_root.to_path_buf())
    }

    /// Namespace injected into kubectl invocations.
    pub fn namespace(&self) -> Option<&str> {
        self.node
            .map(|n| n.namespace.as_str())
            .or(self.sole_namespace)
    }

    /// Environment appended to script hooks, before the hook's own sorted
    /// env. Order is part of the contract.
    pub fn env_contract(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = vec![
            (
                "KTL_STACK_ROOT".to_string(),
                self.stack_root.display().to_string(),
            ),
            (
                "KTL_STACK_PROFILE".to_string(),
                self.profile.unwrap_or("").to_string(),
            ),
            ("KTL_STACK_RUN_ID".to_string(), self.run_id.to_string()),
            (
                "KTL_STACK_COMMAND".to_string(),
                self.command.as_str().to_string(),
            ),
        ];
        if let Some(node) = self.node {
            if let Some(kubeconfig) = &node.cluster.kubeconfig {
                env.push(("KUBECONFIG".to_string(), kubeconfig.display().to_string()));
            }
            if let Some(context) = &node.cluster.context {
                env.push(("KUBE_CONTEXT".to_string(), context.clone()));
            }
            env.push(("KTL_RELEASE_ID".to_string(), node.id.clone()));
            env.push(("KTL_RELEASE_NAME".to_string(), node.name.clone()));
            env.push((
                "KTL_RELEASE_DIR".to_string(),
                node.dir.display().to_string(),
            ));
            env.push(("KTL_RELEASE_NAMESPACE".to_string(), node.namespace.clone()));
            env.push(("KTL_CLUSTER_NAME".to_string(), node.cluster.name.clone()));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ktl_stack_types::ClusterTarget;

    use super::*;

    fn node() -> ResolvedRelease {
        ResolvedRelease {
            id: "prod/apps/api".to_string(),
            name: "api".to_string(),
            dir: PathBuf::from("/stack/apps/api"),
            cluster: ClusterTarget {
                name: "prod".to_string(),
                kubeconfig: Some(PathBuf::from("/kube/prod.yaml")),
                context: Some("prod-admin".to_string()),
            },
            namespace: "apps".to_string(),
            chart: "charts/api".to_string(),
            values: vec![],
            set: BTreeMap::new(),
            tags: Default::default(),
            needs: vec![],
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

    #[test]
    fn env_contract_carries_release_identity() {
        let node = node();
        let ctx = HookContext {
            stack_root: Path::new("/stack"),
            profile: Some("prod"),
            run_id: "run-1",
            command: Command::Apply,
            node: Some(&node),
            sole_namespace: None,
        };
        let env: BTreeMap<String, String> = ctx.env_contract().into_iter().collect();
        assert_eq!(env["KTL_STACK_ROOT"], "/stack");
        assert_eq!(env["KTL_STACK_PROFILE"], "prod");
        assert_eq!(env["KTL_STACK_RUN_ID"], "run-1");
        assert_eq!(env["KTL_STACK_COMMAND"], "apply");
        assert_eq!(env["KUBECONFIG"], "/kube/prod.yaml");
        assert_eq!(env["KUBE_CONTEXT"], "prod-admin");
        assert_eq!(env["KTL_RELEASE_ID"], "prod/apps/api");
        assert_eq!(env["KTL_RELEASE_NAME"], "api");
        assert_eq!(env["KTL_RELEASE_NAMESPACE"], "apps");
        assert_eq!(env["KTL_CLUSTER_NAME"], "prod");
    }

    #[test]
    fn stack_level_context_omits_release_vars() {
        let ctx = HookContext {
            stack_root: Path::new("/stack"),
            profile: None,
            run_id: "run-1",
            command: Command::Delete,
            node: None,
            sole_namespace: Some("apps"),
        };
        let env: BTreeMap<String, String> = ctx.env_contract().into_iter().collect();
        assert_eq!(env["KTL_STACK_COMMAND"], "delete");
        assert_eq!(env["KTL_STACK_PROFILE"], "");
        assert!(!env.contains_key("KTL_RELEASE_ID"));
        assert_eq!(ctx.namespace(), Some("apps"));
        assert_eq!(ctx.default_work_dir(), PathBuf::from("/stack"));
    }
}
