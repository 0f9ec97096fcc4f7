use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EventFields;
use crate::error::RunError;

/// Closed event vocabulary. `NODE_LOG` is ephemeral: broadcast to live
/// observers, never persisted and never part of the hash chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    RunConcurrency,
    RunCompleted,
    NodeMeta,
    NodeQueued,
    NodeRunning,
    NodeSucceeded,
    NodeFailed,
    NodeBlocked,
    NodeLog,
    BudgetWait,
    PhaseStarted,
    PhaseCompleted,
    HelmLog,
    HookStarted,
    HookSkipped,
    HookSucceeded,
    HookFailed,
    RetryScheduled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "RUN_STARTED",
            EventType::RunConcurrency => "RUN_CONCURRENCY",
            EventType::RunCompleted => "RUN_COMPLETED",
            EventType::NodeMeta => "NODE_META",
            EventType::NodeQueued => "NODE_QUEUED",
            EventType::NodeRunning => "NODE_RUNNING",
            EventType::NodeSucceeded => "NODE_SUCCEEDED",
            EventType::NodeFailed => "NODE_FAILED",
            EventType::NodeBlocked => "NODE_BLOCKED",
            EventType::NodeLog => "NODE_LOG",
            EventType::BudgetWait => "BUDGET_WAIT",
            EventType::PhaseStarted => "PHASE_STARTED",
            EventType::PhaseCompleted => "PHASE_COMPLETED",
            EventType::HelmLog => "HELM_LOG",
            EventType::HookStarted => "HOOK_STARTED",
            EventType::HookSkipped => "HOOK_SKIPPED",
            EventType::HookSucceeded => "HOOK_SUCCEEDED",
            EventType::HookFailed => "HOOK_FAILED",
            EventType::RetryScheduled => "RETRY_SCHEDULED",
        }
    }

    /// Ephemeral events bypass the store and the hash chain.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, EventType::NodeLog)
    }

    /// Events that settle a node's fate for this attempt.
    pub fn is_terminal_node_event(&self) -> bool {
        matches!(
            self,
            EventType::NodeSucceeded | EventType::NodeFailed | EventType::NodeBlocked
        )
    }

    /// Step events additionally checkpoint into the node-steps table.
    pub fn is_step_event(&self) -> bool {
        matches!(self, EventType::PhaseStarted | EventType::PhaseCompleted)
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: {s}"))
    }
}

/// One record in a run's event stream.
///
/// Persisted events carry a digest computed from the previous event's
/// digest, forming an unbroken chain per run, plus a CRC over the same
/// preimage for cheap corruption checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Writer-assigned total order within the run; 0 until sealed.
    #[serde(default)]
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fields: EventFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(default)]
    pub prev_digest: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub crc32: u32,
}

impl RunEvent {
    /// A fresh, unsealed event. `seq`, `prev_digest`, `digest` and `crc32`
    /// are assigned when the chain seals it.
    pub fn new(run_id: &str, event_type: EventType) -> Self {
        Self {
            seq: 0,
            ts: Utc::now(),
            run_id: run_id.to_string(),
            node_id: None,
            event_type,
            attempt: 0,
            message: String::new(),
            fields: EventFields::new(),
            error: None,
            prev_digest: String::new(),
            digest: String::new(),
            crc32: 0,
        }
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_fields(mut self, fields: EventFields) -> Self {
        self.fields = crate::versioned_fields(fields);
        self
    }

    pub fn with_error(mut self, error: RunError) -> Self {
        self.error = Some(error);
        self
    }

    /// Timestamp in integer nanoseconds since the epoch, as stored.
    pub fn ts_ns(&self) -> i64 {
        self.ts.timestamp_nanos_opt().unwrap_or_else(|| {
            // Out-of-range timestamps clamp to micros; good until year 2262.
            self.ts.timestamp_micros().saturating_mul(1_000)
        })
    }
}
