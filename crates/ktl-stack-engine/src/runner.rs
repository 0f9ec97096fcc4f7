use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use ktl_stack_hash::new_run_error;
use ktl_stack_hooks::{HookContext, HookError, HookStage, StagedHook, run_hook, stage_hooks};
use ktl_stack_store::{ChainPosition, CreateRun, RunMeta, StateStore, StoreError};
use ktl_stack_types::{
    AdaptiveConfig, ApplyCacheEntry, ApplyCacheKey, CancelToken, Command, ErrorClass, EventFields,
    EventType, FailMode, NodeStatus, Plan, ResolvedRelease, RunError, RunEvent, RunStatus,
    RunSummary, RunnerConfig, classify_error, new_run_id,
};

use crate::adaptive::AdaptiveController;
use crate::executor::{DigestProvider, NodeExecutor, RunContext};
use crate::lock::{RunLock, default_owner};
use crate::observer::ObserverHub;
use crate::scheduler::{ReadyNode, Scheduler};

/// How long the dispatcher waits for a completion when nothing is
/// admissible and work is in flight.
const READY_WAIT: Duration = Duration::from_millis(50);

/// Everything that parameterizes one run beyond the plan itself.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub command: Command,
    pub fail_mode: FailMode,
    /// Attempts per node, including the first.
    pub max_attempts: u32,
    /// Overrides `plan.runner.concurrency` when set.
    pub concurrency: Option<u32>,
    /// Overrides `plan.runner.progressive_concurrency` when set.
    pub progressive_concurrency: Option<bool>,
    /// Overrides `plan.runner.adaptive` when set.
    pub adaptive: Option<AdaptiveConfig>,
    pub lock: bool,
    pub lock_owner: Option<String>,
    pub lock_ttl: Duration,
    pub takeover_lock: bool,
    /// Explicit run id; freshly allocated when unset.
    pub run_id: Option<String>,
    /// Selector snapshot recorded with the run.
    pub selector: serde_json::Value,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Completed-run retention cap applied after each run; 0 disables.
    pub max_runs: usize,
    pub git_commit: String,
    pub git_dirty: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            command: Command::Apply,
            fail_mode: FailMode::FailAtEnd,
            max_attempts: 1,
            concurrency: None,
            progressive_concurrency: None,
            adaptive: None,
            lock: true,
            lock_owner: None,
            lock_ttl: Duration::from_secs(15 * 60),
            takeover_lock: false,
            run_id: None,
            selector: serde_json::json!({}),
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(30),
            max_runs: 50,
            git_commit: String::new(),
            git_dirty: false,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub summary: RunSummary,
    pub run_digest: String,
    pub last_event: ChainPosition,
}

struct WorkerDone {
    node_id: String,
    attempt: u32,
    started: Instant,
    outcome: Result<Option<String>, RunError>,
}

/// Orchestrates one run: scheduler, adaptive controller, hook runner,
/// executor and state store, emitting the event stream as it goes.
pub struct Runner<'s> {
    store: &'s StateStore,
    executor: Arc<dyn NodeExecutor>,
    hub: ObserverHub,
    digests: Option<Arc<dyn DigestProvider>>,
}

impl<'s> Runner<'s> {
    /// Wire a runner to a store and executor. The hub is registered as the
    /// store's persistent event sink.
    pub fn new(
        store: &'s StateStore,
        executor: Arc<dyn NodeExecutor>,
        hub: ObserverHub,
    ) -> Result<Self> {
        store
            .add_sink(Box::new(hub.clone()))
            .context("failed to register observer sink")?;
        Ok(Self {
            store,
            executor,
            hub,
            digests: None,
        })
    }

    /// Enable the apply cache with the given digest callbacks.
    pub fn with_digest_provider(mut self, digests: Arc<dyn DigestProvider>) -> Self {
        self.digests = Some(digests);
        self
    }

    /// Execute a plan as a fresh run.
    pub fn run(
        &self,
        plan: &Plan,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let run_id = options.run_id.clone().unwrap_or_else(new_run_id);
        let initial: Vec<(ResolvedRelease, NodeStatus, u32)> = plan
            .nodes
            .iter()
            .map(|n| (n.clone(), NodeStatus::Planned, 0))
            .collect();
        self.execute(plan, options, cancel, run_id, initial, true)
    }

    /// Re-enter an existing run: completed nodes stay completed, everything
    /// else goes back to the ready set. The event chain continues where it
    /// left off.
    pub fn resume(
        &self,
        run_id: &str,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let plan = self
            .store
            .get_run_plan(run_id)
            .with_context(|| format!("run {run_id} cannot be loaded"))?;
        let listing = self.store.get_run(run_id)?;
        let mut options = options.clone();
        options.command = listing.command;

        let records = self.store.list_node_status(run_id)?;
        let initial: Vec<(ResolvedRelease, NodeStatus, u32)> = plan
            .nodes
            .iter()
            .map(|n| {
                let record = records.iter().find(|r| r.node_id == n.id);
                match record {
                    Some(r) if r.status == NodeStatus::Succeeded => {
                        (n.clone(), NodeStatus::Succeeded, r.attempt)
                    }
                    Some(r) => (n.clone(), NodeStatus::Planned, r.attempt),
                    None => (n.clone(), NodeStatus::Planned, 0),
                }
            })
            .collect();
        self.execute(&plan, &options, cancel, run_id.to_string(), initial, false)
    }

    fn execute(
        &self,
        plan: &Plan,
        options: &RunOptions,
        cancel: &CancelToken,
        run_id: String,
        initial: Vec<(ResolvedRelease, NodeStatus, u32)>,
        fresh: bool,
    ) -> Result<RunReport> {
        let config = effective_config(plan, options)?;

        let _lock = if options.lock {
            let owner = options.lock_owner.clone().unwrap_or_else(default_owner);
            let lock = RunLock::acquire(
                &plan.stack_root,
                &owner,
                options.lock_ttl,
                options.takeover_lock,
            )?;
            lock.set_run_id(&run_id)?;
            Some(lock)
        } else {
            None
        };

        let controller = config
            .progressive_concurrency
            .then(|| AdaptiveController::new(config.adaptive.clone(), config.concurrency));
        let initial_target = controller
            .as_ref()
            .map(|c| c.target())
            .unwrap_or(config.concurrency);

        let scheduler = Scheduler::new(
            initial,
            options.command,
            config.limits.clone(),
            initial_target,
        )
        .map_err(|e| anyhow::anyhow!(e))?;

        if fresh {
            self.create_run(plan, options, &config, &run_id, initial_target)?;
        }

        let run_ctx = RunContext {
            run_id: run_id.clone(),
            cancel: cancel.clone(),
            qps: config.qps,
            burst: config.burst,
        };

        // Stack-level run-once pre hooks gate the whole run.
        let mut run_once_failed = false;
        if fresh {
            for staged in stage_hooks(&plan.run_once_hooks, HookStage::Pre) {
                if self
                    .run_one_hook(&run_id, None, &staged, plan, options, cancel)
                    .is_err()
                {
                    run_once_failed = true;
                    break;
                }
            }
            if run_once_failed {
                scheduler.stop();
                scheduler.finalize_blocked("run-once hook failed");
                self.drain_blocked(&scheduler, &run_id)?;
                return self.finish(&run_id, &scheduler, cancel, true, options);
            }
        }

        let (done_tx, done_rx) = channel::<WorkerDone>();
        let mut in_flight: usize = 0;

        std::thread::scope(|scope| -> Result<()> {
            loop {
                if cancel.is_canceled() && !scheduler.is_stopped() {
                    scheduler.stop();
                    scheduler.finalize_blocked("canceled");
                    self.drain_blocked(&scheduler, &run_id)?;
                }

                while let Ok(done) = done_rx.try_recv() {
                    in_flight -= 1;
                    self.on_done(done, &scheduler, controller.as_ref(), &run_id, options, cancel)?;
                }

                if !scheduler.is_stopped() {
                    if let Some(c) = &controller {
                        scheduler.set_target(c.target());
                    }
                    let (ready, holds) = scheduler.next_ready();
                    for hold in holds {
                        self.emit(
                            RunEvent::new(&run_id, EventType::BudgetWait)
                                .with_node(&hold.node_id)
                                .with_message(format!(
                                    "held by {} budget {}",
                                    hold.budget_type, hold.budget_key
                                ))
                                .with_fields(fields_of(serde_json::json!({
                                    "budgetType": hold.budget_type,
                                    "budgetKey": hold.budget_key,
                                    "limit": hold.limit,
                                    "used": hold.used,
                                }))),
                        )?;
                    }
                    if let Some(ready) = ready {
                        if let Some(c) = &controller {
                            c.on_admission();
                        }
                        self.emit(
                            RunEvent::new(&run_id, EventType::NodeQueued)
                                .with_node(&ready.node.id)
                                .with_attempt(ready.attempt)
                                .with_fields(EventFields::new()),
                        )?;
                        in_flight += 1;
                        let tx: Sender<WorkerDone> = done_tx.clone();
                        let run_ctx = run_ctx.clone();
                        let run_id = run_id.clone();
                        let scheduler = &scheduler;
                        scope.spawn(move || {
                            let started = Instant::now();
                            let outcome = self.run_node_worker(
                                &ready, &run_id, plan, options, scheduler, &run_ctx,
                            );
                            let _ = tx.send(WorkerDone {
                                node_id: ready.node.id.clone(),
                                attempt: ready.attempt,
                                started,
                                outcome,
                            });
                        });
                        continue;
                    }
                }

                if in_flight == 0 {
                    if scheduler.is_done() {
                        break;
                    }
                    if scheduler.is_quiescent() {
                        // Stopped or starved: whatever has not run is blocked.
                        scheduler.finalize_blocked("run stopped before execution");
                        self.drain_blocked(&scheduler, &run_id)?;
                        break;
                    }
                }

                match done_rx.recv_timeout(READY_WAIT) {
                    Ok(done) => {
                        in_flight -= 1;
                        self.on_done(
                            done,
                            &scheduler,
                            controller.as_ref(),
                            &run_id,
                            options,
                            cancel,
                        )?;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            Ok(())
        })?;

        // Stack-level run-once post hooks observe the node outcomes.
        let snapshot_failed = scheduler
            .snapshot()
            .values()
            .any(|(status, _)| matches!(status, NodeStatus::Failed | NodeStatus::Blocked));
        let post_stage = if snapshot_failed || cancel.is_canceled() {
            HookStage::PostFailure
        } else {
            HookStage::PostSuccess
        };
        for staged in stage_hooks(&plan.run_once_hooks, post_stage) {
            if self
                .run_one_hook(&run_id, None, &staged, plan, options, cancel)
                .is_err()
            {
                run_once_failed = true;
            }
        }

        self.finish(&run_id, &scheduler, cancel, run_once_failed, options)
    }

    fn finish(
        &self,
        run_id: &str,
        scheduler: &Scheduler,
        cancel: &CancelToken,
        run_once_failed: bool,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let snapshot = scheduler.snapshot();
        let all_succeeded = snapshot
            .values()
            .all(|(status, _)| *status == NodeStatus::Succeeded);
        let status = if cancel.is_canceled() {
            RunStatus::Canceled
        } else if all_succeeded && !run_once_failed {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        self.emit(
            RunEvent::new(run_id, EventType::RunCompleted)
                .with_message(status.as_str())
                .with_fields(fields_of(serde_json::json!({ "status": status.as_str() }))),
        )?;
        let run_digest = self.store.complete_run(run_id, status)?;
        let last_event = self.store.flush(run_id)?;
        if options.max_runs > 0 {
            self.store.prune_completed_runs(options.max_runs)?;
        }
        let summary = self.store.get_run_summary(run_id)?;
        Ok(RunReport {
            run_id: run_id.to_string(),
            status,
            summary,
            run_digest,
            last_event,
        })
    }

    fn create_run(
        &self,
        plan: &Plan,
        options: &RunOptions,
        config: &RunnerConfig,
        run_id: &str,
        initial_target: u32,
    ) -> Result<()> {
        let node_ids: Vec<String> = plan.nodes.iter().map(|n| n.id.clone()).collect();
        self.store.create_run(CreateRun {
            meta: RunMeta {
                run_id: run_id.to_string(),
                stack_root: plan.stack_root.clone(),
                stack_name: plan.stack_name.clone(),
                profile: plan.profile.clone(),
                command: options.command,
                concurrency: config.concurrency,
                fail_mode: options.fail_mode,
                selector: options.selector.clone(),
                creator: std::env::var("USER")
                    .or_else(|_| std::env::var("USERNAME"))
                    .unwrap_or_default(),
                host: gethostname::gethostname().to_string_lossy().to_string(),
                pid: std::process::id(),
                ci: std::env::var_os("CI").is_some(),
                git_commit: options.git_commit.clone(),
                git_dirty: options.git_dirty,
            },
            plan: plan.clone(),
            summary: RunSummary::planned(&node_ids),
        })?;

        // Debugging mirror of the plan next to the state db; the store row
        // stays authoritative.
        let mirror_dir = plan.stack_root.join(".ktl/stack/runs").join(run_id);
        if std::fs::create_dir_all(&mirror_dir).is_ok() {
            if let Ok(json) = serde_json::to_vec_pretty(plan) {
                let _ = std::fs::write(mirror_dir.join("plan.json"), json);
            }
        }

        self.emit(
            RunEvent::new(run_id, EventType::RunStarted)
                .with_message(options.command.as_str())
                .with_fields(fields_of(serde_json::json!({
                    "command": options.command.as_str(),
                    "concurrency": initial_target,
                }))),
        )?;
        for node in &plan.nodes {
            self.emit(
                RunEvent::new(run_id, EventType::NodeMeta)
                    .with_node(&node.id)
                    .with_fields(fields_of(serde_json::json!({
                        "cluster": node.cluster.name,
                        "namespace": node.namespace,
                        "name": node.name,
                        "executionGroup": node.execution_group,
                        "parallelismGroup": node.parallelism_group,
                        "primaryKind": node.primary_kind(),
                        "critical": node.role.is_critical(),
                    }))),
            )?;
        }
        Ok(())
    }

    /// Handle one worker completion: scheduler marks, adaptive feedback,
    /// retry scheduling and event emission.
    fn on_done(
        &self,
        done: WorkerDone,
        scheduler: &Scheduler,
        controller: Option<&AdaptiveController>,
        run_id: &str,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        let duration_ms = done.started.elapsed().as_millis() as u64;
        match done.outcome {
            Ok(skip_reason) => {
                scheduler.mark_succeeded(&done.node_id);
                let mut payload = serde_json::json!({ "durationMs": duration_ms });
                if let Some(reason) = &skip_reason {
                    payload["skipped"] = serde_json::json!(true);
                    payload["reason"] = serde_json::json!(reason);
                }
                self.emit(
                    RunEvent::new(run_id, EventType::NodeSucceeded)
                        .with_node(&done.node_id)
                        .with_attempt(done.attempt)
                        .with_fields(fields_of(payload)),
                )?;
                if let Some(c) = controller {
                    if let Some(change) = c.on_success() {
                        scheduler.set_target(change.to);
                        self.emit_concurrency(run_id, &change)?;
                    }
                }
            }
            Err(error) => {
                // A cancellation observed here blocks the pending set with
                // the cancel reason before dependency-failure blocking can
                // claim it.
                if cancel.is_canceled() && !scheduler.is_stopped() {
                    scheduler.stop();
                    scheduler.finalize_blocked("canceled");
                }
                if let Some(c) = controller {
                    if let Some(change) = c.on_failure(error.class) {
                        scheduler.set_target(change.to);
                        self.emit_concurrency(run_id, &change)?;
                    }
                }

                let retriable = error.class.is_retriable()
                    && !cancel.is_canceled()
                    && done.attempt < options.max_attempts;

                self.emit(
                    RunEvent::new(run_id, EventType::NodeFailed)
                        .with_node(&done.node_id)
                        .with_attempt(done.attempt)
                        .with_message(&error.message)
                        .with_error(error.clone())
                        .with_fields(fields_of(serde_json::json!({
                            "durationMs": duration_ms,
                            "willRetry": retriable,
                        }))),
                )?;

                if retriable {
                    let backoff =
                        retry_backoff(done.attempt, options.retry_base, options.retry_cap);
                    let next_attempt =
                        scheduler.mark_retrying(&done.node_id, Instant::now() + backoff);
                    self.emit(
                        RunEvent::new(run_id, EventType::RetryScheduled)
                            .with_node(&done.node_id)
                            .with_attempt(next_attempt)
                            .with_message(format!("retrying after {}ms", backoff.as_millis()))
                            .with_fields(fields_of(serde_json::json!({
                                "backoffMs": backoff.as_millis() as u64,
                                "class": error.class.as_str(),
                            }))),
                    )?;
                } else {
                    scheduler.mark_failed(&done.node_id, &error);
                    if options.fail_mode == FailMode::FailFast {
                        scheduler.stop();
                    }
                }
            }
        }
        self.drain_blocked(scheduler, run_id)
    }

    /// Emit `NODE_BLOCKED` for everything that became blocked since the
    /// last terminal event.
    fn drain_blocked(&self, scheduler: &Scheduler, run_id: &str) -> Result<()> {
        for blocked in scheduler.take_newly_blocked() {
            self.emit(
                RunEvent::new(run_id, EventType::NodeBlocked)
                    .with_node(&blocked.node_id)
                    .with_attempt(blocked.attempt)
                    .with_message(&blocked.reason)
                    .with_fields(fields_of(serde_json::json!({ "reason": blocked.reason }))),
            )?;
        }
        Ok(())
    }

    /// Full node lifecycle inside a worker thread: pre hooks, apply-cache
    /// consultation, executor, post hooks.
    fn run_node_worker(
        &self,
        ready: &ReadyNode,
        run_id: &str,
        plan: &Plan,
        options: &RunOptions,
        scheduler: &Scheduler,
        run_ctx: &RunContext,
    ) -> Result<Option<String>, RunError> {
        let node = ready.node.as_ref();
        scheduler.mark_running(&node.id);
        self.emit(
            RunEvent::new(run_id, EventType::NodeRunning)
                .with_node(&node.id)
                .with_attempt(ready.attempt)
                .with_fields(EventFields::new()),
        )
        .map_err(store_run_error)?;

        for staged in stage_hooks(&node.hooks, HookStage::Pre) {
            self.run_one_hook(run_id, Some(node), &staged, plan, options, &run_ctx.cancel)?;
        }

        if options.command == Command::Apply {
            match self.cache_decision(node, run_id, options) {
                Ok(Some(reason)) => return Ok(Some(reason)),
                Ok(None) => {}
                Err(err) => {
                    return Err(new_run_error(
                        ErrorClass::Other,
                        format!("apply cache probe failed: {err:#}"),
                    ));
                }
            }
        }

        self.emit(
            RunEvent::new(run_id, EventType::PhaseStarted)
                .with_node(&node.id)
                .with_attempt(ready.attempt)
                .with_message("execute")
                .with_fields(fields_of(serde_json::json!({ "step": "execute" }))),
        )
        .map_err(store_run_error)?;

        let result = self
            .executor
            .run_node(run_ctx, node, options.command)
            .map_err(|e| {
                let message = format!("{e:#}");
                new_run_error(
                    classify_error(&message, run_ctx.cancel.is_canceled()),
                    message,
                )
            });

        let mut completed = RunEvent::new(run_id, EventType::PhaseCompleted)
            .with_node(&node.id)
            .with_attempt(ready.attempt)
            .with_message("execute")
            .with_fields(fields_of(serde_json::json!({ "step": "execute" })));
        if let Err(err) = &result {
            completed = completed.with_error(err.clone());
        }
        self.emit(completed).map_err(store_run_error)?;

        match result {
            Ok(()) => {
                for staged in stage_hooks(&node.hooks, HookStage::PostSuccess) {
                    // A post hook failure fails the node even though the
                    // executor succeeded.
                    self.run_one_hook(run_id, Some(node), &staged, plan, options, &run_ctx.cancel)?;
                }
                Ok(None)
            }
            Err(error) => {
                for staged in stage_hooks(&node.hooks, HookStage::PreAfterFailure)
                    .into_iter()
                    .chain(stage_hooks(&node.hooks, HookStage::PostFailure))
                {
                    // Failure-path hooks are best effort; the node already
                    // failed with the executor's error.
                    let _ = self.run_one_hook(
                        run_id,
                        Some(node),
                        &staged,
                        plan,
                        options,
                        &run_ctx.cancel,
                    );
                }
                Err(error)
            }
        }
    }

    /// Execute one staged hook, emitting the hook event sequence. Skipped
    /// hooks produce `HOOK_SKIPPED`; synchronous successes collapse into a
    /// single `HOOK_SUCCEEDED`.
    fn run_one_hook(
        &self,
        run_id: &str,
        node: Option<&ResolvedRelease>,
        staged: &StagedHook<'_>,
        plan: &Plan,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<(), RunError> {
        let hook = staged.hook;
        let hook_fields = fields_of(serde_json::json!({
            "hook": hook.name,
            "phase": staged.phase.as_str(),
            "when": hook.effective_when(staged.phase).as_str(),
            "runOnce": hook.run_once,
            "type": hook.kind.as_str(),
            "summary": hook.summary(),
        }));

        let base_event = |ty: EventType| {
            let mut event = RunEvent::new(run_id, ty).with_fields(hook_fields.clone());
            if let Some(node) = node {
                event = event.with_node(&node.id);
            }
            event
        };

        if let Some(reason) = &staged.skip_reason {
            return self
                .emit(base_event(EventType::HookSkipped).with_message(reason))
                .map_err(store_run_error);
        }

        let ctx = HookContext {
            stack_root: &plan.stack_root,
            profile: plan.profile.as_deref(),
            run_id,
            command: options.command,
            node,
            sole_namespace: plan.sole_namespace(),
        };

        let hub = &self.hub;
        let node_id = node.map(|n| n.id.clone());
        let mut on_output = |output: ktl_stack_hooks::HookOutput| {
            let mut event = RunEvent::new(run_id, EventType::NodeLog)
                .with_attempt(output.attempt)
                .with_message(output.text)
                .with_fields(fields_of(serde_json::json!({
                    "kind": "hook-output",
                    "hook": hook.name,
                })));
            if let Some(id) = &node_id {
                event = event.with_node(id);
            }
            hub.emit_ephemeral(&event);
        };

        match run_hook(hook, &ctx, cancel, &mut on_output) {
            Ok(result) => {
                // Started + succeeded collapse into one event for a
                // synchronous success.
                self.emit(
                    base_event(EventType::HookSucceeded)
                        .with_attempt(result.attempts)
                        .with_message(format!("hook {} succeeded", hook.name)),
                )
                .map_err(store_run_error)?;
                Ok(())
            }
            Err(err) => {
                self.emit(base_event(EventType::HookStarted))
                    .map_err(store_run_error)?;
                let class = match &err {
                    HookError::Canceled { .. } => ErrorClass::Canceled,
                    _ => ErrorClass::HookFailed,
                };
                let run_error = new_run_error(class, format!("{err}"));
                self.emit(
                    base_event(EventType::HookFailed)
                        .with_message(&run_error.message)
                        .with_error(run_error.clone()),
                )
                .map_err(store_run_error)?;
                Err(run_error)
            }
        }
    }

    /// Apply-cache decision matrix. Returns the skip reason when the
    /// executor can be bypassed.
    fn cache_decision(
        &self,
        node: &ResolvedRelease,
        run_id: &str,
        options: &RunOptions,
    ) -> Result<Option<String>> {
        let Some(provider) = &self.digests else {
            return Ok(None);
        };
        let key = ApplyCacheKey {
            cluster_key: node.cluster.name.clone(),
            namespace: node.namespace.clone(),
            release_name: node.name.clone(),
            command: options.command,
            effective_input_hash: node.effective_input_hash.clone(),
        };
        let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let (desired, has_hooks) = match self.store.get_apply_cache(&key)? {
            Some(entry) if entry.has_hooks => {
                // Hooks may have side effects; never skip.
                return Ok(None);
            }
            Some(entry) => (entry.desired_digest, entry.has_hooks),
            None => {
                let desired = provider.compute_desired(node)?;
                let has_hooks = !node.hooks.is_empty();
                self.store.upsert_apply_cache(
                    key.clone(),
                    ApplyCacheEntry {
                        desired_digest: desired.clone(),
                        has_hooks,
                        observed_at_run_id: run_id.to_string(),
                        updated_at_ns: now_ns,
                    },
                )?;
                if has_hooks {
                    return Ok(None);
                }
                (desired, has_hooks)
            }
        };

        match provider.compute_observed(node)? {
            Some(observed) if observed == desired => {
                self.store.upsert_apply_cache(
                    key,
                    ApplyCacheEntry {
                        desired_digest: desired,
                        has_hooks,
                        observed_at_run_id: run_id.to_string(),
                        updated_at_ns: now_ns,
                    },
                )?;
                Ok(Some("digest-match".to_string()))
            }
            _ => Ok(None),
        }
    }

    fn emit_concurrency(
        &self,
        run_id: &str,
        change: &crate::adaptive::TargetChange,
    ) -> Result<(), StoreError> {
        let mut payload = serde_json::json!({
            "reason": change.reason,
            "from": change.from,
            "to": change.to,
            "window": change.window,
            "failRate": change.fail_rate,
        });
        if let Some(class) = change.class {
            payload["class"] = serde_json::json!(class.as_str());
        }
        self.emit(
            RunEvent::new(run_id, EventType::RunConcurrency)
                .with_message(format!(
                    "concurrency {} -> {} ({})",
                    change.from, change.to, change.reason
                ))
                .with_fields(fields_of(payload)),
        )
    }

    /// Append with bounded backpressure: a full queue is retried briefly,
    /// every other error propagates (and latches store-side).
    fn emit(&self, event: RunEvent) -> Result<(), StoreError> {
        let mut attempts = 0;
        loop {
            match self.store.append_event(event.clone()) {
                Ok(()) => return Ok(()),
                Err(StoreError::QueueFull) if attempts < 200 => {
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(other) => return Err(other),
            }
        }
    }
}

fn store_run_error(err: StoreError) -> RunError {
    new_run_error(ErrorClass::Other, format!("state store write failed: {err}"))
}

/// Plan config with per-run overrides applied and invariants re-checked.
fn effective_config(plan: &Plan, options: &RunOptions) -> Result<RunnerConfig> {
    let mut config = plan.runner.clone();
    if let Some(concurrency) = options.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(progressive) = options.progressive_concurrency {
        config.progressive_concurrency = progressive;
    }
    if let Some(adaptive) = &options.adaptive {
        config.adaptive = adaptive.clone();
    }
    // Clamp instead of failing when an override lowered the ceiling.
    config.adaptive.min = config.adaptive.min.min(config.concurrency);
    let violations = config.violations();
    if !violations.is_empty() {
        bail!("invalid runner config: {}", violations.join("; "));
    }
    Ok(config)
}

/// Exponential backoff with a cap and ±20% jitter.
fn retry_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    use rand::RngExt;
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)));
    let capped = exp.min(cap);
    let mut rng = rand::rng();
    let factor: f64 = 0.8 + rng.random::<f64>() * 0.4;
    Duration::from_millis((capped.as_millis() as f64 * factor).round() as u64)
}

fn fields_of(value: serde_json::Value) -> EventFields {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => EventFields::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_with_jitter_bounds() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        for attempt in 1..=10u32 {
            let expected =
                (base * 2u32.saturating_pow(attempt - 1)).min(cap).as_millis() as f64;
            for _ in 0..20 {
                let got = retry_backoff(attempt, base, cap).as_millis() as f64;
                assert!(got >= expected * 0.8 - 1.0, "attempt {attempt}: {got}");
                assert!(got <= expected * 1.2 + 1.0, "attempt {attempt}: {got}");
            }
        }
    }

    #[test]
    fn effective_config_applies_overrides_and_clamps_min() {
        let plan = Plan::default();
        let options = RunOptions {
            concurrency: Some(2),
            progressive_concurrency: Some(true),
            adaptive: Some(AdaptiveConfig {
                min: 6,
                ..AdaptiveConfig::default()
            }),
            ..RunOptions::default()
        };
        let config = effective_config(&plan, &options).expect("config");
        assert_eq!(config.concurrency, 2);
        assert!(config.progressive_concurrency);
        assert_eq!(config.adaptive.min, 2, "min is clamped to concurrency");
    }

    #[test]
    fn fields_of_flattens_objects_only() {
        let fields = fields_of(serde_json::json!({ "a": 1 }));
        assert_eq!(fields.get("a"), Some(&serde_json::json!(1)));
        assert!(fields_of(serde_json::json!([1, 2])).is_empty());
    }
}
