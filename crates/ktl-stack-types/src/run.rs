use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RunError;
use crate::release::ResolvedRelease;

/// The operation a run performs across the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Apply,
    Delete,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Apply => "apply",
            Command::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apply" => Ok(Command::Apply),
            "delete" => Ok(Command::Delete),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

/// How the run reacts to an unretriable node failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailMode {
    /// Stop handing out new work on the first unretriable failure.
    FailFast,
    /// Block dependents only; independent branches keep going.
    #[default]
    FailAtEnd,
}

impl FailMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailMode::FailFast => "fail-fast",
            FailMode::FailAtEnd => "fail-at-end",
        }
    }
}

impl std::str::FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-fast" => Ok(FailMode::FailFast),
            "fail-at-end" => Ok(FailMode::FailAtEnd),
            other => Err(format!("unknown fail mode: {other}")),
        }
    }
}

/// Node lifecycle status. Transitions are monotone on
/// `planned < queued < running < {succeeded, failed, blocked}`, with
/// `retrying` permitted between `failed` and `running`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Planned,
    Queued,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Retrying,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Planned => "planned",
            NodeStatus::Queued => "queued",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Blocked => "blocked",
            NodeStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked
        )
    }

    /// Rank on the status partial order; `retrying` sits between `failed`
    /// and a fresh `running`.
    fn rank(&self) -> u8 {
        match self {
            NodeStatus::Planned => 0,
            NodeStatus::Queued => 1,
            NodeStatus::Running => 2,
            NodeStatus::Retrying => 3,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked => 4,
        }
    }

    /// Whether moving `self -> next` respects the monotone transition order.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        match (self, next) {
            // Retry cycle: failed -> retrying -> running.
            (NodeStatus::Failed, NodeStatus::Retrying) => true,
            (NodeStatus::Retrying, NodeStatus::Running) => true,
            (NodeStatus::Retrying, NodeStatus::Queued) => true,
            _ => !self.is_terminal() && next.rank() > self.rank(),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(NodeStatus::Planned),
            "queued" => Ok(NodeStatus::Queued),
            "running" => Ok(NodeStatus::Running),
            "succeeded" => Ok(NodeStatus::Succeeded),
            "failed" => Ok(NodeStatus::Failed),
            "blocked" => Ok(NodeStatus::Blocked),
            "retrying" => Ok(NodeStatus::Retrying),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// A plan node plus its mutable run bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNode {
    #[serde(flatten)]
    pub release: ResolvedRelease,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    /// Free-form marker left by resume to explain why a node reruns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_hint: Option<String>,
}

impl RunNode {
    pub fn new(release: ResolvedRelease) -> Self {
        Self {
            release,
            status: NodeStatus::Planned,
            attempt: 0,
            last_error: None,
            resume_hint: None,
        }
    }
}

/// Version identity of the running binary; folded into effective-input
/// hashes so tool upgrades invalidate the apply cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolVersion {
    pub version: String,
    #[serde(default)]
    pub git_commit: String,
}

impl ToolVersion {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_commit: option_env!("KTL_STACK_GIT_COMMIT").unwrap_or("").to_string(),
        }
    }
}

/// In-memory state of one run, rebuilt from the store on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub command: Command,
    #[serde(default)]
    pub fail_mode: FailMode,
    /// Snapshot of the selector that produced this run's node set.
    #[serde(default)]
    pub selector: serde_json::Value,
    pub nodes: Vec<RunNode>,
    pub concurrency_target: u32,
    #[serde(default)]
    pub event_seq: u64,
    #[serde(default)]
    pub last_event_digest: String,
}

/// Allocate a directory-safe run id from a UTC instant at nanosecond
/// granularity.
pub fn run_id_from(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%.9fZ").to_string().replace('.', "-")
}

/// Allocate a run id from the current time.
pub fn new_run_id() -> String {
    run_id_from(Utc::now())
}
