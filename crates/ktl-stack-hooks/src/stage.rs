use ktl_stack_types::{HookConfig, HookPhase, HookSpec, HookWhen};

/// Which moment of the node lifecycle hooks are being staged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    /// Before the executor runs.
    Pre,
    /// Pre-phase hooks gated on `when: failure`, replayed after an executor
    /// failure.
    PreAfterFailure,
    /// After a successful executor invocation.
    PostSuccess,
    /// After a failed executor invocation.
    PostFailure,
}

/// One hook with its run/skip decision for a stage.
#[derive(Debug, Clone)]
pub struct StagedHook<'a> {
    pub hook: &'a HookSpec,
    pub phase: HookPhase,
    /// When set, the hook is not executed and a `HOOK_SKIPPED` event with
    /// this reason is emitted instead.
    pub skip_reason: Option<String>,
}

/// Stage a node's hooks for one lifecycle moment.
///
/// Pre-phase hooks default to `when: always`; post-phase hooks default to
/// `when: success`. Failure-gated pre hooks are deferred to
/// [`HookStage::PreAfterFailure`] and do not appear (even as skips) before
/// execution.
pub fn stage_hooks<'a>(config: &'a HookConfig, stage: HookStage) -> Vec<StagedHook<'a>> {
    match stage {
        HookStage::Pre => config
            .pre
            .iter()
            .filter_map(|hook| {
                let when = hook.effective_when(HookPhase::Pre);
                match when {
                    HookWhen::Failure => None,
                    HookWhen::Always | HookWhen::Success => Some(StagedHook {
                        hook,
                        phase: HookPhase::Pre,
                        skip_reason: None,
                    }),
                }
            })
            .collect(),
        HookStage::PreAfterFailure => config
            .pre
            .iter()
            .filter(|hook| hook.effective_when(HookPhase::Pre) == HookWhen::Failure)
            .map(|hook| StagedHook {
                hook,
                phase: HookPhase::Pre,
                skip_reason: None,
            })
            .collect(),
        HookStage::PostSuccess => config
            .post
            .iter()
            .map(|hook| {
                let when = hook.effective_when(HookPhase::Post);
                StagedHook {
                    hook,
                    phase: HookPhase::Post,
                    skip_reason: match when {
                        HookWhen::Success | HookWhen::Always => None,
                        HookWhen::Failure => {
                            Some("when=failure and node succeeded".to_string())
                        }
                    },
                }
            })
            .collect(),
        HookStage::PostFailure => config
            .post
            .iter()
            .map(|hook| {
                let when = hook.effective_when(HookPhase::Post);
                StagedHook {
                    hook,
                    phase: HookPhase::Post,
                    skip_reason: match when {
                        HookWhen::Failure | HookWhen::Always => None,
                        HookWhen::Success => Some("when=success and node failed".to_string()),
                    },
                }
            })
            .collect(),
    }
}
