use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Phase a hook runs in relative to the node executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
        }
    }
}

/// Outcome condition gating a hook. Unset means phase default: `always`
/// for pre-phase hooks, `success` for post-phase hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookWhen {
    Success,
    Failure,
    Always,
}

impl HookWhen {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookWhen::Success => "success",
            HookWhen::Failure => "failure",
            HookWhen::Always => "always",
        }
    }
}

/// Discriminant of the hook sub-config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Kubectl,
    Script,
    Http,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Kubectl => "kubectl",
            HookKind::Script => "script",
            HookKind::Http => "http",
        }
    }
}

/// kubectl hook: exec the `kubectl` binary with merged args. `--kubeconfig`,
/// `--context` and `-n` are injected when not already present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubectlHookSpec {
    pub args: Vec<String>,
    /// Overrides the node namespace for this invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// script hook: exec `command[0] command[1:]…` with the ktl env contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptHookSpec {
    pub command: Vec<String>,
    /// Working directory; defaults to the node directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    /// Extra environment, appended after the ktl variables in sorted order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// http hook: method defaults to POST when a body is set, GET otherwise.
/// 2xx/3xx count as success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHookSpec {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

fn default_retry() -> u32 {
    1
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(300)
}

/// One declared hook. Exactly one of `kubectl`/`script`/`http` must be set,
/// matching `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: HookKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<HookWhen>,
    /// Total attempts, not retries-after-failure. Must be >= 1.
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default = "default_hook_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Only valid on stack-root hooks; runs at most once per run.
    #[serde(default)]
    pub run_once: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubectl: Option<KubectlHookSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptHookSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpHookSpec>,
}

impl HookSpec {
    /// Effective condition for a phase, applying the phase default when the
    /// hook does not declare one.
    pub fn effective_when(&self, phase: HookPhase) -> HookWhen {
        self.when.unwrap_or(match phase {
            HookPhase::Pre => HookWhen::Always,
            HookPhase::Post => HookWhen::Success,
        })
    }

    /// One-line description for event payloads.
    pub fn summary(&self) -> String {
        match self.kind {
            HookKind::Kubectl => {
                let args = self.kubectl.as_ref().map(|k| k.args.join(" ")).unwrap_or_default();
                format!("kubectl {args}")
            }
            HookKind::Script => self
                .script
                .as_ref()
                .map(|s| s.command.join(" "))
                .unwrap_or_default(),
            HookKind::Http => {
                let http = self.http.as_ref();
                let method = http
                    .and_then(|h| h.method.clone())
                    .unwrap_or_else(|| "GET".to_string());
                format!("{method} {}", http.map(|h| h.url.as_str()).unwrap_or(""))
            }
        }
    }
}

/// Hooks grouped by phase. A node exclusively owns its hook configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<HookSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<HookSpec>,
}

impl HookConfig {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }

    /// Merge an outer level into this one: outer hooks run first, inner
    /// (more specific) hooks keep their position after them.
    pub fn merge_outer(&mut self, outer: &HookConfig) {
        let mut pre = outer.pre.clone();
        pre.append(&mut self.pre);
        self.pre = pre;
        let mut post = outer.post.clone();
        post.append(&mut self.post);
        self.post = post;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_hook(name: &str) -> HookSpec {
        HookSpec {
            name: name.to_string(),
            kind: HookKind::Script,
            when: None,
            retry: 1,
            timeout: Duration::from_secs(300),
            run_once: false,
            kubectl: None,
            script: Some(ScriptHookSpec {
                command: vec!["./check.sh".to_string()],
                work_dir: None,
                env: BTreeMap::new(),
            }),
            http: None,
        }
    }

    #[test]
    fn effective_when_defaults_differ_by_phase() {
        let hook = script_hook("h");
        assert_eq!(hook.effective_when(HookPhase::Pre), HookWhen::Always);
        assert_eq!(hook.effective_when(HookPhase::Post), HookWhen::Success);

        let explicit = HookSpec {
            when: Some(HookWhen::Failure),
            ..script_hook("h")
        };
        assert_eq!(explicit.effective_when(HookPhase::Pre), HookWhen::Failure);
        assert_eq!(explicit.effective_when(HookPhase::Post), HookWhen::Failure);
    }

    #[test]
    fn hook_spec_deserializes_with_defaults() {
        let yaml_equivalent = r#"{
            "name": "notify",
            "type": "http",
            "http": {"url": "https://example.test/hook"}
        }"#;
        let hook: HookSpec = serde_json::from_str(yaml_equivalent).expect("deserialize");
        assert_eq!(hook.retry, 1);
        assert_eq!(hook.timeout, Duration::from_secs(300));
        assert!(!hook.run_once);
        assert_eq!(hook.kind, HookKind::Http);
    }

    #[test]
    fn merge_outer_keeps_outer_hooks_first() {
        let mut inner = HookConfig {
            pre: vec![script_hook("inner")],
            post: vec![],
        };
        let outer = HookConfig {
            pre: vec![script_hook("outer")],
            post: vec![script_hook("outer-post")],
        };
        inner.merge_outer(&outer);
        let names: Vec<&str> = inner.pre.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["outer", "inner"]);
        assert_eq!(inner.post.len(), 1);
    }

    #[test]
    fn summary_names_the_action() {
        let hook = script_hook("h");
        assert_eq!(hook.summary(), "./check.sh");

        let http = HookSpec {
            kind: HookKind::Http,
            script: None,
            http: Some(HttpHookSpec {
                url: "https://example.test".to_string(),
                method: Some("POST".to_string()),
                body: None,
                headers: BTreeMap::new(),
            }),
            ..script_hook("h")
        };
        assert_eq!(http.summary(), "POST https://example.test");
    }
}
