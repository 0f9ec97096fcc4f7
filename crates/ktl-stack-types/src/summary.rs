use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RunError;
use crate::event::{EventType, RunEvent};
use crate::run::NodeStatus;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryTotals {
    pub planned: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub blocked: u32,
    pub running: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub status: NodeStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

/// Aggregated per-run view, updated atomically on each terminal node event
/// and persisted with the run row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub totals: SummaryTotals,
    pub nodes: BTreeMap<String, NodeSummary>,
    pub status: RunStatus,
    /// Node ids in plan order.
    pub order: Vec<String>,
}

impl RunSummary {
    /// Initial summary: every node `planned`.
    pub fn planned(node_ids: &[String]) -> Self {
        let mut nodes = BTreeMap::new();
        for id in node_ids {
            nodes.insert(id.clone(), NodeSummary::default());
        }
        let mut summary = Self {
            totals: SummaryTotals::default(),
            nodes,
            status: RunStatus::Running,
            order: node_ids.to_vec(),
        };
        summary.recount();
        summary
    }

    /// Fold one event into the summary. Non-node events other than
    /// `RUN_COMPLETED` leave it untouched.
    pub fn apply_event(&mut self, event: &RunEvent) {
        match event.event_type {
            EventType::RunCompleted => {
                if let Ok(status) = event.message.parse::<RunStatus>() {
                    self.status = status;
                }
            }
            EventType::NodeQueued => self.set_node(event, NodeStatus::Queued),
            EventType::NodeRunning => self.set_node(event, NodeStatus::Running),
            EventType::NodeSucceeded => self.set_node(event, NodeStatus::Succeeded),
            EventType::NodeFailed => self.set_node(event, NodeStatus::Failed),
            EventType::NodeBlocked => self.set_node(event, NodeStatus::Blocked),
            EventType::RetryScheduled => self.set_node(event, NodeStatus::Retrying),
            _ => {}
        }
    }

    fn set_node(&mut self, event: &RunEvent, status: NodeStatus) {
        let Some(node_id) = event.node_id.as_ref() else {
            return;
        };
        let entry = self.nodes.entry(node_id.clone()).or_default();
        entry.status = status;
        entry.attempt = entry.attempt.max(event.attempt);
        if status == NodeStatus::Failed {
            entry.error = event.error.clone();
        }
        self.recount();
    }

    /// Recompute the totals from per-node statuses.
    pub fn recount(&mut self) {
        let mut totals = SummaryTotals::default();
        for node in self.nodes.values() {
            match node.status {
                NodeStatus::Planned | NodeStatus::Queued | NodeStatus::Retrying => {
                    totals.planned += 1
                }
                NodeStatus::Running => totals.running += 1,
                NodeStatus::Succeeded => totals.succeeded += 1,
                NodeStatus::Failed => totals.failed += 1,
                NodeStatus::Blocked => totals.blocked += 1,
            }
        }
        self.totals = totals;
    }

    /// Final status from node outcomes alone; cancellation is decided by
    /// the runner, `run_once_hook_failed` by the hook runner.
    pub fn conclude(&mut self, canceled: bool, run_once_hook_failed: bool) -> RunStatus {
        self.recount();
        self.status = if canceled {
            RunStatus::Canceled
        } else if self.totals.failed == 0
            && self.totals.blocked == 0
            && self.totals.planned == 0
            && self.totals.running == 0
            && !run_once_hook_failed
        {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorClass;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn node_event(ty: EventType, node: &str) -> RunEvent {
        RunEvent::new("run-1", ty).with_node(node)
    }

    #[test]
    fn planned_summary_counts_everything_as_planned() {
        let summary = RunSummary::planned(&ids(&["a", "b", "c"]));
        assert_eq!(summary.totals.planned, 3);
        assert_eq!(summary.status, RunStatus::Running);
        assert_eq!(summary.order.len(), 3);
    }

    #[test]
    fn terminal_events_move_totals() {
        let mut summary = RunSummary::planned(&ids(&["a", "b", "c"]));
        summary.apply_event(&node_event(EventType::NodeRunning, "a"));
        assert_eq!(summary.totals.running, 1);
        assert_eq!(summary.totals.planned, 2);

        summary.apply_event(&node_event(EventType::NodeSucceeded, "a"));
        summary.apply_event(
            &node_event(EventType::NodeFailed, "b").with_error(RunError {
                class: ErrorClass::Other,
                message: "boom".to_string(),
                digest: String::new(),
            }),
        );
        summary.apply_event(&node_event(EventType::NodeBlocked, "c"));

        assert_eq!(summary.totals.succeeded, 1);
        assert_eq!(summary.totals.failed, 1);
        assert_eq!(summary.totals.blocked, 1);
        assert_eq!(summary.totals.planned, 0);
        assert!(summary.nodes["b"].error.is_some());
    }

    #[test]
    fn conclude_requires_full_success() {
        let mut summary = RunSummary::planned(&ids(&["a"]));
        summary.apply_event(&node_event(EventType::NodeSucceeded, "a"));
        assert_eq!(summary.conclude(false, false), RunStatus::Succeeded);

        // A node still planned at completion means the run did not finish.
        let mut unfinished = RunSummary::planned(&ids(&["a"]));
        assert_eq!(unfinished.conclude(false, false), RunStatus::Failed);
    }

    #[test]
    fn run_once_hook_failure_fails_an_otherwise_green_run() {
        let mut summary = RunSummary::planned(&ids(&["a"]));
        summary.apply_event(&node_event(EventType::NodeSucceeded, "a"));
        assert_eq!(summary.conclude(false, true), RunStatus::Failed);
    }

    #[test]
    fn cancellation_wins_over_outcomes() {
        let mut summary = RunSummary::planned(&ids(&["a"]));
        summary.apply_event(&node_event(EventType::NodeSucceeded, "a"));
        assert_eq!(summary.conclude(true, false), RunStatus::Canceled);
    }

    #[test]
    fn run_completed_event_sets_status() {
        let mut summary = RunSummary::planned(&ids(&["a"]));
        summary.apply_event(&RunEvent::new("run-1", EventType::RunCompleted).with_message("canceled"));
        assert_eq!(summary.status, RunStatus::Canceled);
    }
}
