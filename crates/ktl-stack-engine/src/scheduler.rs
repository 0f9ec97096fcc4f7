use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ktl_stack_graph::{GraphError, ReleaseGraph};
use ktl_stack_types::{Command, Limits, NodeStatus, ResolvedRelease, RunError};

/// A node admitted for dispatch. The scheduler has already moved it to
/// `queued` and charged every budget it participates in.
#[derive(Debug, Clone)]
pub struct ReadyNode {
    pub node: Arc<ResolvedRelease>,
    pub attempt: u32,
}

/// A dependency-ready node refused by a budget. Reported once per hold
/// episode so the runner can emit a single `BUDGET_WAIT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetHold {
    pub node_id: String,
    pub budget_type: &'static str,
    pub budget_key: String,
    pub limit: u32,
    pub used: u32,
}

/// A node that became blocked since the last drain, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedNode {
    pub node_id: String,
    pub reason: String,
    pub attempt: u32,
}

struct SchedNode {
    release: Arc<ResolvedRelease>,
    status: NodeStatus,
    attempt: u32,
    /// Earliest instant a retrying node may be dispatched again.
    not_before: Option<Instant>,
}

struct State {
    nodes: BTreeMap<String, SchedNode>,
    /// Execution-direction graph: reversed edges under `delete`.
    graph: ReleaseGraph,
    limits: Limits,
    target: u32,
    in_flight: BTreeSet<String>,
    per_namespace: HashMap<String, u32>,
    per_kind: HashMap<String, u32>,
    per_group: HashMap<String, u32>,
    newly_blocked: Vec<BlockedNode>,
    held_reported: BTreeSet<String>,
    stopped: bool,
}

/// Pull-based ready-set executor state. All counters live under one mutex;
/// the runner's dispatcher and completion paths are the only callers.
pub struct Scheduler {
    state: Mutex<State>,
}

impl Scheduler {
    /// Build a scheduler over run nodes. Under `delete` the dependency
    /// edges are reversed so dependents run before their dependencies.
    pub fn new(
        nodes: Vec<(ResolvedRelease, NodeStatus, u32)>,
        command: Command,
        limits: Limits,
        initial_target: u32,
    ) -> Result<Self, GraphError> {
        let releases: Vec<ResolvedRelease> = nodes.iter().map(|(r, _, _)| r.clone()).collect();
        let graph = ReleaseGraph::build(&releases)?;
        let graph = match command {
            Command::Apply => graph,
            Command::Delete => graph.reversed(),
        };
        let nodes = nodes
            .into_iter()
            .map(|(release, status, attempt)| {
                (
                    release.id.clone(),
                    SchedNode {
                        release: Arc::new(release),
                        status,
                        attempt,
                        not_before: None,
                    },
                )
            })
            .collect();
        Ok(Self {
            state: Mutex::new(State {
                nodes,
                graph,
                limits,
                target: initial_target.max(1),
                in_flight: BTreeSet::new(),
                per_namespace: HashMap::new(),
                per_kind: HashMap::new(),
                per_group: HashMap::new(),
                newly_blocked: Vec::new(),
                held_reported: BTreeSet::new(),
                stopped: false,
            }),
        })
    }

    /// Update the global concurrency target (adaptive controller output).
    pub fn set_target(&self, target: u32) {
        self.lock().target = target.max(1);
    }

    /// Next admissible node, if any, plus budget holds that became
    /// reportable during this scan. Nodes are scanned in id order for
    /// determinism.
    pub fn next_ready(&self) -> (Option<ReadyNode>, Vec<BudgetHold>) {
        let mut state = self.lock();
        let mut holds = Vec::new();
        if state.stopped {
            return (None, holds);
        }

        let now = Instant::now();
        let candidates: Vec<String> = state
            .nodes
            .iter()
            .filter(|(id, node)| {
                matches!(node.status, NodeStatus::Planned | NodeStatus::Retrying)
                    && node.not_before.is_none_or(|t| t <= now)
                    && state
                        .graph
                        .deps(id)
                        .all(|dep| state.nodes[dep].status == NodeStatus::Succeeded)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in candidates {
            match state.admit(&id) {
                Ok(()) => {
                    state.held_reported.remove(&id);
                    let node = state.nodes.get_mut(&id).expect("candidate exists");
                    node.status = NodeStatus::Queued;
                    node.attempt = node.attempt.max(1);
                    let ready = ReadyNode {
                        node: Arc::clone(&node.release),
                        attempt: node.attempt,
                    };
                    return (Some(ready), holds);
                }
                Err(hold) => {
                    if state.held_reported.insert(id.clone()) {
                        holds.push(hold);
                    }
                }
            }
        }
        (None, holds)
    }

    /// Queued -> running, at the moment the worker picks the node up.
    pub fn mark_running(&self, id: &str) {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(id) {
            node.status = NodeStatus::Running;
        }
    }

    pub fn mark_succeeded(&self, id: &str) {
        let mut state = self.lock();
        state.release_slot(id);
        if let Some(node) = state.nodes.get_mut(id) {
            node.status = NodeStatus::Succeeded;
        }
    }

    /// Terminal failure: releases the node's slot and blocks every
    /// transitive dependent that has not already reached a terminal state.
    pub fn mark_failed(&self, id: &str, _err: &RunError) {
        let mut state = self.lock();
        state.release_slot(id);
        if let Some(node) = state.nodes.get_mut(id) {
            node.status = NodeStatus::Failed;
        }
        state.block_dependents(id);
    }

    pub fn mark_blocked(&self, id: &str, reason: &str) {
        let mut state = self.lock();
        state.release_slot(id);
        state.block(id, reason);
        state.block_dependents(id);
    }

    /// Failed attempt that will be retried: releases the slot, bumps the
    /// attempt and holds the node out of the ready set until `ready_at`.
    pub fn mark_retrying(&self, id: &str, ready_at: Instant) -> u32 {
        let mut state = self.lock();
        state.release_slot(id);
        match state.nodes.get_mut(id) {
            Some(node) => {
                node.status = NodeStatus::Retrying;
                node.attempt += 1;
                node.not_before = Some(ready_at);
                node.attempt
            }
            None => 0,
        }
    }

    /// Drain nodes that became blocked since the last call.
    pub fn take_newly_blocked(&self) -> Vec<BlockedNode> {
        std::mem::take(&mut self.lock().newly_blocked)
    }

    /// Refuse to hand out new work; in-flight nodes finish normally.
    pub fn stop(&self) {
        self.lock().stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Block every node that has not started (and is not in flight), e.g.
    /// on cancellation or after a fail-fast stop.
    pub fn finalize_blocked(&self, reason: &str) {
        let mut state = self.lock();
        let pending: Vec<String> = state
            .nodes
            .iter()
            .filter(|(id, node)| {
                !node.status.is_terminal() && !state.in_flight.contains(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in pending {
            state.block(&id, reason);
        }
    }

    /// Read-only view of statuses and attempts.
    pub fn snapshot(&self) -> BTreeMap<String, (NodeStatus, u32)> {
        self.lock()
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), (node.status, node.attempt)))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// True when every node reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.lock().nodes.values().all(|n| n.status.is_terminal())
    }

    /// True when nothing is running and nothing can become ready anymore.
    pub fn is_quiescent(&self) -> bool {
        let state = self.lock();
        if !state.in_flight.is_empty() {
            return false;
        }
        if state.stopped {
            return true;
        }
        // Retrying nodes with a future not_before still count as runnable.
        !state.nodes.iter().any(|(id, node)| {
            matches!(node.status, NodeStatus::Planned | NodeStatus::Retrying)
                && state
                    .graph
                    .deps(id)
                    .all(|dep| state.nodes[dep].status == NodeStatus::Succeeded)
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("scheduler state poisoned")
    }
}

impl State {
    /// Check every active budget; on success charge them all and register
    /// the node as in flight.
    fn admit(&mut self, id: &str) -> Result<(), BudgetHold> {
        let node = &self.nodes[id].release;

        let used = self.in_flight.len() as u32;
        if used >= self.target {
            return Err(BudgetHold {
                node_id: id.to_string(),
                budget_type: "concurrency",
                budget_key: "global".to_string(),
                limit: self.target,
                used,
            });
        }

        if self.limits.max_parallel_per_namespace > 0 {
            let key = node.namespace_key();
            let used = *self.per_namespace.get(&key).unwrap_or(&0);
            if used >= self.limits.max_parallel_per_namespace {
                return Err(BudgetHold {
                    node_id: id.to_string(),
                    budget_type: "namespace",
                    budget_key: key,
                    limit: self.limits.max_parallel_per_namespace,
                    used,
                });
            }
        }

        let kind = node.primary_kind();
        if let Some(&cap) = self.limits.max_parallel_kind.get(kind) {
            let used = *self.per_kind.get(kind).unwrap_or(&0);
            if used >= cap {
                return Err(BudgetHold {
                    node_id: id.to_string(),
                    budget_type: "kind",
                    budget_key: kind.to_string(),
                    limit: cap,
                    used,
                });
            }
        }

        if !node.parallelism_group.is_empty() {
            let used = *self.per_group.get(&node.parallelism_group).unwrap_or(&0);
            if used >= self.limits.parallelism_group_limit {
                return Err(BudgetHold {
                    node_id: id.to_string(),
                    budget_type: "parallelism-group",
                    budget_key: node.parallelism_group.clone(),
                    limit: self.limits.parallelism_group_limit,
                    used,
                });
            }
        }

        let namespace_key = node.namespace_key();
        let kind = kind.to_string();
        let group = node.parallelism_group.clone();
        self.in_flight.insert(id.to_string());
        if self.limits.max_parallel_per_namespace > 0 {
            *self.per_namespace.entry(namespace_key).or_insert(0) += 1;
        }
        if self.limits.max_parallel_kind.contains_key(&kind) {
            *self.per_kind.entry(kind).or_insert(0) += 1;
        }
        if !group.is_empty() {
            *self.per_group.entry(group).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Release every counter the node was charged against.
    fn release_slot(&mut self, id: &str) {
        if !self.in_flight.remove(id) {
            return;
        }
        let node = Arc::clone(&self.nodes[id].release);
        if self.limits.max_parallel_per_namespace > 0 {
            if let Some(used) = self.per_namespace.get_mut(&node.namespace_key()) {
                *used = used.saturating_sub(1);
            }
        }
        if let Some(used) = self.per_kind.get_mut(node.primary_kind()) {
            *used = used.saturating_sub(1);
        }
        if !node.parallelism_group.is_empty() {
            if let Some(used) = self.per_group.get_mut(&node.parallelism_group) {
                *used = used.saturating_sub(1);
            }
        }
    }

    fn block(&mut self, id: &str, reason: &str) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.status.is_terminal() {
            return;
        }
        node.status = NodeStatus::Blocked;
        self.newly_blocked.push(BlockedNode {
            node_id: id.to_string(),
            reason: reason.to_string(),
            attempt: node.attempt,
        });
    }

    /// Block the transitive dependents of a failed or blocked node, naming
    /// the failing ancestor in the reason.
    fn block_dependents(&mut self, ancestor: &str) {
        let dependents = self.graph.closure_dependents(&[ancestor.to_string()]);
        let reason = format!("blocked by dependency failure: {ancestor}");
        for id in dependents {
            self.block(&id, &reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use ktl_stack_types::ClusterTarget;

    use super::*;

    fn release(name: &str, needs: &[&str]) -> ResolvedRelease {
        release_in(name, "default", needs, "")
    }

    fn release_in(name: &str, namespace: &str, needs: &[&str], group: &str) -> ResolvedRelease {
        ResolvedRelease {
            id: ResolvedRelease::make_id("prod", namespace, name),
            name: name.to_string(),
            dir: PathBuf::from(name),
            cluster: ClusterTarget {
                name: "prod".to_string(),
                kubeconfig: None,
                context: None,
            },
            namespace: namespace.to_string(),
            chart: format!("charts/{name}"),
            values: vec![],
            set: BTreeMap::new(),
            tags: Default::default(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            apply: Default::default(),
            delete: Default::default(),
            hooks: Default::default(),
            role: Default::default(),
            wave: 0,
            parallelism_group: group.to_string(),
            execution_group: 0,
            effective_input_hash: String::new(),
            inputs_cursor: serde_json::Value::Null,
            selected_by: vec![],
        }
    }

    fn scheduler(releases: Vec<ResolvedRelease>, command: Command, target: u32) -> Scheduler {
        scheduler_with_limits(releases, command, target, Limits::default())
    }

    fn scheduler_with_limits(
        releases: Vec<ResolvedRelease>,
        command: Command,
        target: u32,
        limits: Limits,
    ) -> Scheduler {
        let nodes = releases
            .into_iter()
            .map(|r| (r, NodeStatus::Planned, 0))
            .collect();
        Scheduler::new(nodes, command, limits, target).expect("scheduler")
    }

    fn err() -> RunError {
        RunError {
            class: ktl_stack_types::ErrorClass::Other,
            message: "boom".to_string(),
            digest: String::new(),
        }
    }

    #[test]
    fn next_ready_respects_dependencies_and_id_order() {
        let sched = scheduler(
            vec![release("b", &["a"]), release("a", &[]), release("z", &[])],
            Command::Apply,
            4,
        );
        let (first, _) = sched.next_ready();
        assert_eq!(first.unwrap().node.name, "a");
        let (second, _) = sched.next_ready();
        assert_eq!(second.unwrap().node.name, "z");
        // b still waits on a.
        let (third, _) = sched.next_ready();
        assert!(third.is_none());

        sched.mark_succeeded("prod/default/a");
        let (now_b, _) = sched.next_ready();
        assert_eq!(now_b.unwrap().node.name, "b");
    }

    #[test]
    fn delete_reverses_the_edges() {
        let sched = scheduler(
            vec![release("a", &[]), release("b", &["a"])],
            Command::Delete,
            4,
        );
        let (first, _) = sched.next_ready();
        assert_eq!(first.unwrap().node.name, "b");
        let (held, _) = sched.next_ready();
        assert!(held.is_none());
        sched.mark_succeeded("prod/default/b");
        let (second, _) = sched.next_ready();
        assert_eq!(second.unwrap().node.name, "a");
    }

    #[test]
    fn global_budget_caps_in_flight_and_reports_once() {
        let sched = scheduler(
            vec![release("a", &[]), release("b", &[]), release("c", &[])],
            Command::Apply,
            2,
        );
        assert!(sched.next_ready().0.is_some());
        assert!(sched.next_ready().0.is_some());

        let (none, holds) = sched.next_ready();
        assert!(none.is_none());
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].budget_type, "concurrency");
        assert_eq!(holds[0].limit, 2);
        assert_eq!(holds[0].used, 2);

        // Same hold episode is not re-reported.
        let (_, repeat) = sched.next_ready();
        assert!(repeat.is_empty());

        sched.mark_succeeded("prod/default/a");
        let (admitted, _) = sched.next_ready();
        assert_eq!(admitted.unwrap().node.name, "c");
        assert_eq!(sched.in_flight(), 2);
    }

    #[test]
    fn namespace_budget_limits_per_namespace() {
        let limits = Limits {
            max_parallel_per_namespace: 1,
            ..Limits::default()
        };
        let sched = scheduler_with_limits(
            vec![
                release_in("a", "apps", &[], ""),
                release_in("b", "apps", &[], ""),
                release_in("c", "infra", &[], ""),
            ],
            Command::Apply,
            8,
            limits,
        );
        let (first, _) = sched.next_ready();
        assert_eq!(first.unwrap().node.namespace, "apps");
        let (second, holds) = sched.next_ready();
        // b is held by the namespace budget, c (infra) is admissible.
        let second = second.unwrap();
        assert_eq!(second.node.namespace, "infra");
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].budget_type, "namespace");
        assert_eq!(holds[0].budget_key, "prod/apps");
    }

    #[test]
    fn parallelism_group_budget_applies_to_group_members_only() {
        let limits = Limits {
            parallelism_group_limit: 1,
            ..Limits::default()
        };
        let sched = scheduler_with_limits(
            vec![
                release_in("a", "default", &[], "dbs"),
                release_in("b", "default", &[], "dbs"),
                release_in("c", "default", &[], ""),
            ],
            Command::Apply,
            8,
            limits,
        );
        let (first, _) = sched.next_ready();
        assert_eq!(first.unwrap().node.name, "a");
        let (second, holds) = sched.next_ready();
        assert_eq!(second.unwrap().node.name, "c");
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].budget_type, "parallelism-group");
        assert_eq!(holds[0].budget_key, "dbs");
    }

    #[test]
    fn kind_budget_uses_primary_kind() {
        let limits = Limits {
            max_parallel_kind: BTreeMap::from([("workload".to_string(), 1)]),
            ..Limits::default()
        };
        let sched = scheduler_with_limits(
            vec![release("a", &[]), release("b", &[])],
            Command::Apply,
            8,
            limits,
        );
        assert!(sched.next_ready().0.is_some());
        let (none, holds) = sched.next_ready();
        assert!(none.is_none());
        assert_eq!(holds[0].budget_type, "kind");
        assert_eq!(holds[0].budget_key, "workload");
    }

    #[test]
    fn failure_blocks_transitive_dependents_with_ancestor_in_reason() {
        let sched = scheduler(
            vec![
                release("a", &[]),
                release("b", &["a"]),
                release("c", &["b"]),
                release("free", &[]),
            ],
            Command::Apply,
            4,
        );
        let (a, _) = sched.next_ready();
        assert_eq!(a.unwrap().node.name, "a");
        sched.mark_failed("prod/default/a", &err());

        let blocked = sched.take_newly_blocked();
        let ids: Vec<&str> = blocked.iter().map(|b| b.node_id.as_str()).collect();
        assert_eq!(ids, vec!["prod/default/b", "prod/default/c"]);
        for b in &blocked {
            assert!(b.reason.contains("blocked by dependency failure: prod/default/a"));
        }
        // Drain is one-shot.
        assert!(sched.take_newly_blocked().is_empty());

        // The free node still runs.
        let (free, _) = sched.next_ready();
        assert_eq!(free.unwrap().node.name, "free");
    }

    #[test]
    fn retrying_node_waits_for_its_backoff() {
        let sched = scheduler(vec![release("a", &[])], Command::Apply, 4);
        let (a, _) = sched.next_ready();
        assert_eq!(a.unwrap().attempt, 1);
        sched.mark_running("prod/default/a");

        let attempt = sched.mark_retrying(
            "prod/default/a",
            Instant::now() + Duration::from_millis(50),
        );
        assert_eq!(attempt, 2);
        assert!(sched.next_ready().0.is_none(), "backoff holds the node");
        assert!(!sched.is_quiescent(), "retrying node still counts as runnable");

        std::thread::sleep(Duration::from_millis(60));
        let (again, _) = sched.next_ready();
        assert_eq!(again.unwrap().attempt, 2);
    }

    #[test]
    fn stop_refuses_new_work_and_finalize_blocks_the_rest() {
        let sched = scheduler(
            vec![release("a", &[]), release("b", &[])],
            Command::Apply,
            1,
        );
        let (a, _) = sched.next_ready();
        assert!(a.is_some());
        sched.stop();
        assert!(sched.next_ready().0.is_none());

        sched.finalize_blocked("canceled");
        let blocked = sched.take_newly_blocked();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].node_id, "prod/default/b");
        assert_eq!(blocked[0].reason, "canceled");
        // The in-flight node is untouched.
        let snapshot = sched.snapshot();
        assert_eq!(snapshot["prod/default/a"].0, NodeStatus::Queued);
    }

    #[test]
    fn counters_never_exceed_caps_under_churn() {
        let limits = Limits {
            max_parallel_per_namespace: 2,
            ..Limits::default()
        };
        let releases: Vec<_> = (0..12)
            .map(|i| release_in(&format!("n{i:02}"), "apps", &[], ""))
            .collect();
        let sched = scheduler_with_limits(releases, Command::Apply, 3, limits);

        let mut running: Vec<String> = Vec::new();
        let mut completed = 0;
        while completed < 12 {
            while let (Some(ready), _) = sched.next_ready() {
                running.push(ready.node.id.clone());
                assert!(sched.in_flight() <= 2, "namespace cap respected");
            }
            let id = running.pop().expect("something must be running");
            sched.mark_succeeded(&id);
            completed += 1;
        }
        assert!(sched.is_done());
    }

    #[test]
    fn is_done_and_quiescent_track_terminal_states() {
        let sched = scheduler(vec![release("a", &[]), release("b", &["a"])], Command::Apply, 2);
        assert!(!sched.is_done());

        let (a, _) = sched.next_ready();
        let id = a.unwrap().node.id.clone();
        sched.mark_failed(&id, &err());
        // b became blocked transitively; everything is terminal.
        assert!(sched.is_done());
        assert!(sched.is_quiescent());
    }
}
