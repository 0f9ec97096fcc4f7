use std::collections::BTreeMap;

use anyhow::{Context, Result};

use ktl_stack_events::verify_run_event_chain;
use ktl_stack_hash::{HashOptions, effective_input_hash};
use ktl_stack_store::{NodeRecord, StateStore};
use ktl_stack_types::{NodeStatus, Plan, RunSummary};

/// A replayed view of a stored run: the plan, the event-derived summary and
/// per-node statuses. Building it verifies the full event chain.
#[derive(Debug, Clone)]
pub struct ReplayedRun {
    pub run_id: String,
    pub plan: Plan,
    pub summary: RunSummary,
    pub statuses: BTreeMap<String, NodeStatus>,
}

/// Load and replay a stored run from its event log. The chain is verified
/// before any event is folded; a broken chain refuses to replay.
pub fn replay_run(store: &StateStore, run_id: &str) -> Result<ReplayedRun> {
    let plan = store
        .get_run_plan(run_id)
        .with_context(|| format!("run {run_id} cannot be loaded"))?;
    let events = store.load_events(run_id)?;
    verify_run_event_chain(&events)
        .with_context(|| format!("event chain of run {run_id} is broken"))?;

    let node_ids: Vec<String> = plan.nodes.iter().map(|n| n.id.clone()).collect();
    let mut summary = RunSummary::planned(&node_ids);
    for event in &events {
        summary.apply_event(event);
    }
    let statuses = summary
        .nodes
        .iter()
        .map(|(id, node)| (id.clone(), node.status))
        .collect();

    Ok(ReplayedRun {
        run_id: run_id.to_string(),
        plan,
        summary,
        statuses,
    })
}

/// The most recent run id, if any run was ever recorded.
pub fn load_most_recent_run(store: &StateStore) -> Result<Option<String>> {
    Ok(store.most_recent_run_id()?)
}

/// One node whose effective inputs changed since the plan was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftEntry {
    pub node_id: String,
    pub stored_hash: String,
    pub current_hash: String,
    /// Inputs cursor recomputed from the current filesystem state.
    pub current_cursor: serde_json::Value,
}

/// Re-hash every node of a stored plan against the current filesystem and
/// report the ones whose effective inputs drifted.
pub fn drift_report(plan: &Plan, hash: &HashOptions) -> Result<Vec<DriftEntry>> {
    let mut drifted = Vec::new();
    for node in &plan.nodes {
        let rehashed = effective_input_hash(node, hash)
            .with_context(|| format!("failed to re-hash {}", node.id))?;
        if rehashed.hash != node.effective_input_hash {
            drifted.push(DriftEntry {
                node_id: node.id.clone(),
                stored_hash: node.effective_input_hash.clone(),
                current_hash: rehashed.hash,
                current_cursor: rehashed.inputs_cursor,
            });
        }
    }
    Ok(drifted)
}

/// Node ids eligible for `rerun-failed`: failed and blocked nodes, plus
/// anything that never reached a terminal state.
pub fn rerun_candidates(records: &[NodeRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|r| {
            matches!(
                r.status,
                NodeStatus::Failed
                    | NodeStatus::Blocked
                    | NodeStatus::Planned
                    | NodeStatus::Queued
                    | NodeStatus::Running
                    | NodeStatus::Retrying
            )
        })
        .map(|r| r.node_id.clone())
        .collect()
}
