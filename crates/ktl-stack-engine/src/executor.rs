use ktl_stack_types::{CancelToken, Command, ResolvedRelease};

/// Ambient run state handed to executors and hooks.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub cancel: CancelToken,
    /// Kubernetes client rate limiting, resolved from the runner config.
    pub qps: f64,
    pub burst: u32,
}

/// The thing that actually installs, upgrades or uninstalls a release.
///
/// The runtime treats returned errors opaquely except for classifying the
/// message (rate limit, conflict, cancellation, timeout). Implementations
/// must respect `ctx.cancel`.
pub trait NodeExecutor: Send + Sync {
    fn run_node(
        &self,
        ctx: &RunContext,
        node: &ResolvedRelease,
        command: Command,
    ) -> anyhow::Result<()>;
}

/// Digest callbacks backing the apply cache. `compute_desired` renders the
/// desired state; `compute_observed` inspects the cluster and returns
/// `None` when the release is absent.
pub trait DigestProvider: Send + Sync {
    fn compute_desired(&self, node: &ResolvedRelease) -> anyhow::Result<String>;
    fn compute_observed(&self, node: &ResolvedRelease) -> anyhow::Result<Option<String>>;
}
