use std::collections::BTreeSet;
use std::path::PathBuf;

use ktl_stack_graph::{GraphError, ReleaseGraph};
use ktl_stack_hash::{HashOptions, effective_input_hash};
use ktl_stack_types::{
    ApplyOptions, ClusterTarget, DeleteOptions, HookConfig, HookKind, HookSpec, Plan,
    ReleaseRole, ResolvedRelease, RunnerConfig,
};

use crate::universe::{DiscoveredRelease, LevelDefaults, Universe};

/// Compilation failures. All of these abort before a run starts.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("release {release} has no cluster name")]
    EmptyClusterName { release: String },
    #[error("duplicate release name {name} in cluster {cluster}")]
    DuplicateRelease { cluster: String, name: String },
    #[error("release {node} needs {needs}, which does not exist in cluster {cluster}")]
    MissingDependency {
        node: String,
        needs: String,
        cluster: String,
    },
    #[error("dependency cycle detected among: {}", participants.join(", "))]
    Cycle { participants: Vec<String> },
    #[error("hook {hook}: {reason}")]
    InvalidHook { hook: String, reason: String },
    #[error("hook {hook} in {dir} sets runOnce; runOnce is only valid at the stack root")]
    RunOnceOutsideRoot { hook: String, dir: PathBuf },
    #[error("profile {profile} is not defined anywhere in the stack")]
    UnknownProfile { profile: String },
    #[error("invalid runner config: {}", violations.join("; "))]
    InvalidRunnerConfig { violations: Vec<String> },
    #[error("failed to hash release inputs")]
    Hash(#[source] anyhow::Error),
}

impl From<GraphError> for CompileError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::UnknownDependency {
                node,
                needs,
                cluster,
            } => CompileError::MissingDependency {
                node,
                needs,
                cluster,
            },
            GraphError::Cycle { participants } => CompileError::Cycle { participants },
        }
    }
}

/// Inputs that parameterize compilation beyond the universe itself.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub profile: Option<String>,
    pub hash: HashOptions,
}

/// Resolves a discovered universe into a validated [`Plan`].
#[derive(Debug)]
pub struct Compiler {
    universe: Universe,
    options: CompileOptions,
}

impl Compiler {
    pub fn new(universe: Universe, options: CompileOptions) -> Self {
        Self { universe, options }
    }

    pub fn compile(&self) -> Result<Plan, CompileError> {
        let runner = self.resolve_runner_config()?;
        let run_once_hooks = self.collect_run_once_hooks()?;

        let mut profile_seen = self.options.profile.is_none();
        let mut nodes = Vec::with_capacity(self.universe.releases.len());
        let mut seen: BTreeSet<(String, String)> = BTreeSet::new();

        for release in &self.universe.releases {
            let (node, saw_profile) = self.resolve_release(release)?;
            profile_seen |= saw_profile;
            let key = (node.cluster.name.clone(), node.name.clone());
            if !seen.insert(key.clone()) {
                return Err(CompileError::DuplicateRelease {
                    cluster: key.0,
                    name: key.1,
                });
            }
            nodes.push(node);
        }

        if !profile_seen {
            return Err(CompileError::UnknownProfile {
                profile: self.options.profile.clone().unwrap_or_default(),
            });
        }

        let graph = ReleaseGraph::build(&nodes)?;
        let groups = graph.execution_groups()?;
        let order = graph.linearize()?;
        for node in &mut nodes {
            node.execution_group = groups[&node.id];
            // Waves default to the computed layer unless declared.
            if node.wave == 0 {
                node.wave = node.execution_group;
            }
        }

        for node in &mut nodes {
            let hashed = effective_input_hash(node, &self.options.hash)
                .map_err(CompileError::Hash)?;
            node.effective_input_hash = hashed.hash;
            node.inputs_cursor = hashed.inputs_cursor;
        }

        Ok(Plan::new(
            self.universe.root.clone(),
            self.universe.stack_name(),
            self.options.profile.clone(),
            nodes,
            order,
            runner,
            run_once_hooks,
        ))
    }

    fn resolve_runner_config(&self) -> Result<RunnerConfig, CompileError> {
        let runner = self
            .universe
            .root_stack()
            .and_then(|s| s.runner.clone())
            .unwrap_or_default();
        let violations = runner.violations();
        if !violations.is_empty() {
            return Err(CompileError::InvalidRunnerConfig { violations });
        }
        Ok(runner)
    }

    /// Root-level hooks marked `runOnce` become plan-level hooks; anywhere
    /// else they are an error.
    fn collect_run_once_hooks(&self) -> Result<HookConfig, CompileError> {
        for (dir, stack) in &self.universe.stacks {
            if dir.as_os_str().is_empty() {
                continue;
            }
            for hook in stack.hooks.pre.iter().chain(stack.hooks.post.iter()) {
                if hook.run_once {
                    return Err(CompileError::RunOnceOutsideRoot {
                        hook: hook.name.clone(),
                        dir: dir.clone(),
                    });
                }
            }
        }

        let mut run_once = HookConfig::default();
        if let Some(root) = self.universe.root_stack() {
            for hook in &root.hooks.pre {
                validate_hook(hook)?;
                if hook.run_once {
                    run_once.pre.push(hook.clone());
                }
            }
            for hook in &root.hooks.post {
                validate_hook(hook)?;
                if hook.run_once {
                    run_once.post.push(hook.clone());
                }
            }
        }
        Ok(run_once)
    }

    fn resolve_release(
        &self,
        release: &DiscoveredRelease,
    ) -> Result<(ResolvedRelease, bool), CompileError> {
        let mut merged = LevelDefaults::default();
        let mut hooks = HookConfig::default();
        let mut profile_seen = false;

        for level in self.universe.chain_for(&release.dir) {
            let Some(stack) = self.universe.stacks.get(&level) else {
                continue;
            };
            merge_defaults(&mut merged, &stack.defaults);
            if let Some(profile) = &self.options.profile {
                if let Some(overrides) = stack.profiles.get(profile) {
                    merge_defaults(&mut merged, &overrides.defaults);
                    profile_seen = true;
                }
            }
            // Stack-level run-once hooks are plan-level; everything else
            // inherits down to the releases. The walk is root-to-leaf, so
            // deeper levels append after the outer ones.
            hooks
                .pre
                .extend(stack.hooks.pre.iter().filter(|h| !h.run_once).cloned());
            hooks
                .post
                .extend(stack.hooks.post.iter().filter(|h| !h.run_once).cloned());
        }

        let spec = &release.spec;
        for hook in spec.hooks.pre.iter().chain(spec.hooks.post.iter()) {
            if hook.run_once {
                return Err(CompileError::RunOnceOutsideRoot {
                    hook: hook.name.clone(),
                    dir: release.dir.clone(),
                });
            }
        }

        // Leaf wins on conflicts.
        let level_from_spec = LevelDefaults {
            cluster: spec.cluster.clone(),
            namespace: spec.namespace.clone(),
            values: spec.values.clone(),
            set: spec.set.clone(),
            tags: spec.tags.clone(),
            apply: spec.apply.clone(),
            delete: spec.delete.clone(),
        };
        merge_defaults(&mut merged, &level_from_spec);
        let mut node_hooks = spec.hooks.clone();
        node_hooks.merge_outer(&hooks);

        for hook in node_hooks.pre.iter().chain(node_hooks.post.iter()) {
            validate_hook(hook)?;
        }

        let cluster = merged.cluster.clone().unwrap_or_default();
        if cluster.name.is_empty() {
            return Err(CompileError::EmptyClusterName {
                release: spec.name.clone(),
            });
        }
        let namespace = merged
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let id = ResolvedRelease::make_id(&cluster.name, &namespace, &spec.name);
        let role = ReleaseRole::infer(&spec.name, &spec.chart);

        let node = ResolvedRelease {
            id,
            name: spec.name.clone(),
            dir: self.universe.root.join(&release.dir),
            cluster,
            namespace,
            chart: spec.chart.clone(),
            values: merged.values,
            set: merged.set,
            tags: merged.tags,
            needs: spec.needs.clone(),
            apply: merged.apply,
            delete: merged.delete,
            hooks: node_hooks,
            role,
            wave: spec.wave.unwrap_or(0),
            parallelism_group: spec.parallelism_group.clone().unwrap_or_default(),
            execution_group: 0,
            effective_input_hash: String::new(),
            inputs_cursor: serde_json::Value::Null,
            selected_by: Vec::new(),
        };
        Ok((node, profile_seen))
    }
}

/// Field-wise merge: `level` overrides what it sets, values and tags
/// accumulate, set keys override per key.
fn merge_defaults(merged: &mut LevelDefaults, level: &LevelDefaults) {
    if let Some(cluster) = &level.cluster {
        let target = merged.cluster.get_or_insert_with(ClusterTarget::default);
        if !cluster.name.is_empty() {
            target.name = cluster.name.clone();
        }
        if cluster.kubeconfig.is_some() {
            target.kubeconfig = cluster.kubeconfig.clone();
        }
        if cluster.context.is_some() {
            target.context = cluster.context.clone();
        }
    }
    if level.namespace.is_some() {
        merged.namespace = level.namespace.clone();
    }
    merged.values.extend(level.values.iter().cloned());
    for (k, v) in &level.set {
        merged.set.insert(k.clone(), v.clone());
    }
    merged.tags.extend(level.tags.iter().cloned());
    merge_apply(&mut merged.apply, &level.apply);
    if level.delete.timeout.is_some() {
        merged.delete = DeleteOptions {
            timeout: level.delete.timeout,
        };
    }
}

fn merge_apply(merged: &mut ApplyOptions, level: &ApplyOptions) {
    if level.atomic.is_some() {
        merged.atomic = level.atomic;
    }
    if level.wait.is_some() {
        merged.wait = level.wait;
    }
    if level.timeout.is_some() {
        merged.timeout = level.timeout;
    }
}

/// Structural hook validation: a matching sub-config, sane retry/timeout,
/// and a known `when`. serde already rejects unknown types and `when`s.
fn validate_hook(hook: &HookSpec) -> Result<(), CompileError> {
    let sub_config_matches = match hook.kind {
        HookKind::Kubectl => hook.kubectl.is_some(),
        HookKind::Script => hook.script.is_some() && hook.script.as_ref().is_some_and(|s| !s.command.is_empty()),
        HookKind::Http => hook.http.is_some() && hook.http.as_ref().is_some_and(|h| !h.url.is_empty()),
    };
    if !sub_config_matches {
        return Err(CompileError::InvalidHook {
            hook: hook.name.clone(),
            reason: format!("missing or empty {} configuration", hook.kind.as_str()),
        });
    }
    if hook.retry < 1 {
        return Err(CompileError::InvalidHook {
            hook: hook.name.clone(),
            reason: "retry must be >= 1".to_string(),
        });
    }
    if hook.timeout.is_zero() {
        return Err(CompileError::InvalidHook {
            hook: hook.name.clone(),
            reason: "timeout must be > 0".to_string(),
        });
    }
    Ok(())
}
