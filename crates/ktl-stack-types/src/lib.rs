//! Shared domain types for the ktl stack runtime.
//!
//! Everything that crosses a crate boundary lives here: resolved releases and
//! plans, runner configuration, run state, events, summaries and the error
//! taxonomy. The types are plain serde data; behavior stays in the crates
//! that own it (compiler, scheduler, store).

mod cancel;
mod config;
mod error;
mod event;
mod hook;
mod release;
mod run;
mod summary;

pub use cancel::CancelToken;
pub use config::{AdaptiveConfig, AdaptiveMode, Limits, RunnerConfig};
pub use error::{ErrorClass, RunError, classify_error};
pub use event::{EventType, RunEvent};
pub use hook::{
    HookConfig, HookKind, HookPhase, HookSpec, HookWhen, HttpHookSpec, KubectlHookSpec,
    ScriptHookSpec,
};
pub use release::{
    ApplyOptions, ClusterTarget, DeleteOptions, Plan, ReleaseRole, ResolvedRelease,
};
pub use run::{Command, FailMode, NodeStatus, RunNode, RunState, ToolVersion, new_run_id, run_id_from};
pub use summary::{NodeSummary, RunStatus, RunSummary, SummaryTotals};

use std::collections::BTreeMap;

/// Key for one apply-cache row. Two runs that resolve to the same key are
/// attempting the same deploy with the same effective inputs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ApplyCacheKey {
    pub cluster_key: String,
    pub namespace: String,
    pub release_name: String,
    pub command: Command,
    pub effective_input_hash: String,
}

/// Cached outcome of a previous apply with identical effective inputs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ApplyCacheEntry {
    pub desired_digest: String,
    pub has_hooks: bool,
    pub observed_at_run_id: String,
    pub updated_at_ns: i64,
}

/// Structured fields attached to a persisted event. Persistent events always
/// carry the schema marker `"v": 1`.
pub type EventFields = BTreeMap<String, serde_json::Value>;

/// Insert the `"v": 1` schema marker into a fields map.
pub fn versioned_fields(mut fields: EventFields) -> EventFields {
    fields.insert("v".to_string(), serde_json::json!(1));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_fields_inserts_schema_marker() {
        let fields = versioned_fields(EventFields::new());
        assert_eq!(fields.get("v"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn apply_cache_key_roundtrips_json() {
        let key = ApplyCacheKey {
            cluster_key: "prod".to_string(),
            namespace: "default".to_string(),
            release_name: "ingress".to_string(),
            command: Command::Apply,
            effective_input_hash: "sha256:abc".to_string(),
        };
        let json = serde_json::to_string(&key).expect("serialize");
        let rt: ApplyCacheKey = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rt, key);
    }
}
