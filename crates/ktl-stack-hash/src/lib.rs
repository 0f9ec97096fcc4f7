//! Canonical digests for the ktl stack runtime.
//!
//! Three digest families live here, all sha256 over NUL-separated canonical
//! byte sequences:
//!
//! - the **effective input hash** of a plan node: everything observable
//!   that would change a deploy outcome;
//! - the **error digest** used to cluster failures in audit views;
//! - the **run digest** fingerprinting a completed run, and the **plan
//!   hash** embedded in sealed bundles.
//!
//! Equal effective hashes guarantee semantically identical deploys up to
//! external cluster state.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};

use ktl_stack_types::{ErrorClass, Plan, ResolvedRelease, RunError, ToolVersion};

/// Version tag prefixed to run-scoped digest preimages.
pub const RUN_VERSION_TAG: &str = "ktl.stack-run.v1";

/// Version tag prefixed to error digest preimages.
pub const ERROR_VERSION_TAG: &str = "ktl.stack-error.v1";

/// Git identity of the stack working tree, when the root is a checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackGitIdentity {
    pub commit: String,
    pub dirty: bool,
}

/// Inputs that parameterize effective hashing beyond the node itself.
#[derive(Debug, Clone, Default)]
pub struct HashOptions {
    pub tool: ToolVersion,
    pub stack_git: Option<StackGitIdentity>,
    /// Fold local values-file contents into the hash, not just their paths.
    pub include_values_contents: bool,
}

/// Result of hashing one node: the `sha256:`-prefixed digest and a JSON
/// cursor listing the ingredients, consumed by drift reports.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveHash {
    pub hash: String,
    pub inputs_cursor: serde_json::Value,
}

/// Incremental NUL-separated sha256 preimage writer.
struct Preimage {
    hasher: Sha256,
}

impl Preimage {
    fn new(tag: &str) -> Self {
        let mut p = Self {
            hasher: Sha256::new(),
        };
        p.push(tag);
        p
    }

    fn push(&mut self, element: &str) {
        self.hasher.update(element.as_bytes());
        self.hasher.update([0u8]);
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hex sha256 of a byte slice, without a prefix.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whether a chart or values reference points into the filesystem rather
/// than at a remote location.
pub fn is_local_ref(reference: &str) -> bool {
    !reference.contains("://")
}

/// Compute a node's effective input hash and inputs cursor.
///
/// The preimage follows a fixed element order; every element is
/// NUL-terminated so adjacent fields cannot alias. Optional apply/delete
/// options are fed as labeled elements only when set, so their mere
/// presence alters the hash.
pub fn effective_input_hash(node: &ResolvedRelease, opts: &HashOptions) -> Result<EffectiveHash> {
    let mut preimage = Preimage::new(RUN_VERSION_TAG);
    preimage.push(&opts.tool.version);
    preimage.push(&opts.tool.git_commit);

    let mut cursor_git = serde_json::Value::Null;
    if let Some(git) = &opts.stack_git {
        preimage.push(&git.commit);
        preimage.push(if git.dirty { "dirty" } else { "clean" });
        cursor_git = json!({ "commit": git.commit, "dirty": git.dirty });
    }

    preimage.push(&node.id);
    preimage.push(&node.chart);

    let mut cursor_values = Vec::new();
    for value_path in &node.values {
        preimage.push(value_path);
        let mut entry = json!({ "path": value_path });
        if opts.include_values_contents && is_local_ref(value_path) {
            let resolved = resolve_against(&node.dir, value_path);
            let contents = fs::read(&resolved).with_context(|| {
                format!("failed to read values file {}", resolved.display())
            })?;
            let content_hash = sha256_hex(&contents);
            preimage.push(&content_hash);
            entry["sha256"] = json!(content_hash);
        }
        cursor_values.push(entry);
    }

    for (key, value) in &node.set {
        preimage.push(key);
        preimage.push(value);
    }

    preimage.push(&node.cluster.name);
    preimage.push(
        &node
            .cluster
            .kubeconfig
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    );
    preimage.push(node.cluster.context.as_deref().unwrap_or(""));
    preimage.push(&node.namespace);

    let mut cursor_options = serde_json::Map::new();
    if let Some(timeout) = node.apply.timeout {
        preimage.push(&format!("apply.timeout={}", timeout.as_secs()));
        cursor_options.insert("apply.timeout".to_string(), json!(timeout.as_secs()));
    }
    if let Some(wait) = node.apply.wait {
        preimage.push(&format!("apply.wait={wait}"));
        cursor_options.insert("apply.wait".to_string(), json!(wait));
    }
    if let Some(atomic) = node.apply.atomic {
        preimage.push(&format!("apply.atomic={atomic}"));
        cursor_options.insert("apply.atomic".to_string(), json!(atomic));
    }
    if let Some(timeout) = node.delete.timeout {
        preimage.push(&format!("delete.timeout={}", timeout.as_secs()));
        cursor_options.insert("delete.timeout".to_string(), json!(timeout.as_secs()));
    }

    let hash = format!("sha256:{}", preimage.finish());
    let inputs_cursor = json!({
        "tag": RUN_VERSION_TAG,
        "tool": { "version": opts.tool.version, "git_commit": opts.tool.git_commit },
        "stack_git": cursor_git,
        "id": node.id,
        "chart": node.chart,
        "values": cursor_values,
        "set": node.set,
        "cluster": {
            "name": node.cluster.name,
            "kubeconfig": node.cluster.kubeconfig,
            "context": node.cluster.context,
        },
        "namespace": node.namespace,
        "options": cursor_options,
    });

    Ok(EffectiveHash { hash, inputs_cursor })
}

fn resolve_against(dir: &Path, reference: &str) -> std::path::PathBuf {
    let path = Path::new(reference);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

/// Deterministic digest for a classified error, for clustering equal
/// failures across runs.
pub fn error_digest(class: ErrorClass, message: &str) -> String {
    let mut preimage = Preimage::new(ERROR_VERSION_TAG);
    preimage.push(class.as_str());
    preimage.push(message);
    format!("sha256:{}", preimage.finish())
}

/// Build a [`RunError`] with its digest filled in.
pub fn new_run_error(class: ErrorClass, message: impl Into<String>) -> RunError {
    let message = message.into();
    let digest = error_digest(class, &message);
    RunError {
        class,
        message,
        digest,
    }
}

/// Durable fingerprint of a completed run.
pub fn compute_run_digest(plan_json: &[u8], summary_json: &[u8], last_event_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(RUN_VERSION_TAG.as_bytes());
    hasher.update([0u8]);
    hasher.update(plan_json);
    hasher.update([0u8]);
    hasher.update(summary_json);
    hasher.update([0u8]);
    hasher.update(last_event_digest.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Hash of a plan with its `plan_hash` field cleared; embedded in sealed
/// bundles and re-checked on load.
pub fn compute_run_plan_hash(plan: &Plan) -> Result<String> {
    let mut cleared = plan.clone();
    cleared.plan_hash = String::new();
    let bytes = serde_json::to_vec(&cleared).context("failed to serialize plan for hashing")?;
    Ok(format!("sha256:{}", sha256_hex(&bytes)))
}
