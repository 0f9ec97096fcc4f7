mod executor;
mod progress;

use std::path::PathBuf;
use std::process::Command as Process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use executor::HelmExecutor;
use progress::ProgressObserver;

use ktl_stack_engine::{
    ObserverHub, RunOptions, Runner, drift_report, load_most_recent_run, replay_run,
    rerun_candidates,
};
use ktl_stack_hash::{HashOptions, StackGitIdentity};
use ktl_stack_plan::{CompileOptions, Compiler, Selector, SelectorSpec, discover_universe};
use ktl_stack_seal::{
    load_sealed_plan, parse_signing_key, parse_verifying_key, seal, sign, verify_signature,
};
use ktl_stack_store::{StateStore, export_run};
use ktl_stack_types::{
    CancelToken, Command, FailMode, Plan, RunStatus, ToolVersion,
};

#[derive(Parser, Debug)]
#[command(name = "ktl-stack", version)]
#[command(about = "Run interdependent Helm releases as one stack: plan, apply, resume, seal")]
struct Cli {
    /// Stack root directory (holds ktl-stack.yaml and .ktl state).
    #[arg(long, default_value = ".")]
    stack_root: PathBuf,

    /// Profile whose defaults overlay the stack defaults.
    #[arg(long)]
    profile: Option<String>,

    /// Restrict to one cluster.
    #[arg(long)]
    cluster: Option<String>,

    /// Select releases by tag (repeatable).
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Select releases by root-relative path prefix (repeatable).
    #[arg(long = "path")]
    paths: Vec<String>,

    /// Select releases by name (repeatable).
    #[arg(long = "release")]
    releases: Vec<String>,

    /// Select releases touched by a git range (e.g. origin/main..HEAD).
    #[arg(long)]
    since: Option<String>,

    /// Also run the dependencies of selected releases.
    #[arg(long)]
    include_deps: bool,

    /// Also run the dependents of selected releases.
    #[arg(long)]
    include_dependents: bool,

    /// Prune selected releases' needs pointing outside the selection
    /// instead of failing.
    #[arg(long)]
    allow_missing_deps: bool,

    /// Hash values-file paths only, not their contents.
    #[arg(long)]
    no_hash_values: bool,

    /// Echo every event, including queue/phase chatter and hook output.
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resolved plan: order, waves and effective hashes.
    Plan,
    /// Install or upgrade the selected releases.
    Apply(RunArgs),
    /// Uninstall the selected releases, dependents first.
    Delete(RunArgs),
    /// Re-enter the most recent (or a named) run where it left off.
    Resume {
        run_id: Option<String>,
        #[command(flatten)]
        args: RunArgs,
    },
    /// Re-run the failed and blocked nodes of a previous run.
    RerunFailed {
        run_id: Option<String>,
        /// Proceed even when release inputs drifted since the run.
        #[arg(long)]
        allow_drift: bool,
        #[command(flatten)]
        args: RunArgs,
    },
    /// List recorded runs, newest first.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the trailing events of a run.
    Tail {
        run_id: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Export a run as a portable tarball under .ktl/stack/exports.
    Export { run_id: Option<String> },
    /// Seal the current plan with its inputs into .ktl/stack/sealed.
    Seal {
        /// Hex-encoded Ed25519 signing key file; signs the bundle.
        #[arg(long)]
        sign_key: Option<PathBuf>,
    },
    /// Verify a sealed plan bundle end to end.
    VerifySeal {
        /// Sealed bundle directory (defaults to .ktl/stack/sealed).
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Hex-encoded Ed25519 public key the signature must match.
        #[arg(long)]
        require_key: Option<String>,
    },
    /// Summarize the most recent run.
    Status,
}

#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    /// Worker budget; overrides the stack's runner config.
    #[arg(long)]
    concurrency: Option<u32>,

    /// Start small and ramp concurrency on observed success.
    #[arg(long)]
    progressive: bool,

    /// Stop handing out work after the first unretriable failure.
    #[arg(long)]
    fail_fast: bool,

    /// Attempts per node, including the first.
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Base retry backoff (e.g. 500ms, 2s).
    #[arg(long, default_value = "500ms")]
    retry_base: String,

    /// Retry backoff cap.
    #[arg(long, default_value = "30s")]
    retry_cap: String,

    /// Skip the run lock.
    #[arg(long)]
    no_lock: bool,

    /// Steal a fresh lock held by someone else.
    #[arg(long)]
    takeover_lock: bool,

    /// Lock TTL after which a crashed holder's lock is reclaimable.
    #[arg(long, default_value = "15m")]
    lock_ttl: String,

    /// Completed runs kept before pruning; 0 keeps everything.
    #[arg(long, default_value_t = 50, env = "KTL_STACK_MAX_RUNS")]
    max_runs: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.cmd {
        Commands::Plan => cmd_plan(&cli),
        Commands::Apply(args) => cmd_run(&cli, args.clone(), Command::Apply),
        Commands::Delete(args) => cmd_run(&cli, args.clone(), Command::Delete),
        Commands::Resume { run_id, args } => cmd_resume(&cli, run_id.clone(), args.clone()),
        Commands::RerunFailed {
            run_id,
            allow_drift,
            args,
        } => cmd_rerun_failed(&cli, run_id.clone(), *allow_drift, args.clone()),
        Commands::Runs { limit } => cmd_runs(&cli, *limit),
        Commands::Tail { run_id, limit } => cmd_tail(&cli, run_id.clone(), *limit),
        Commands::Export { run_id } => cmd_export(&cli, run_id.clone()),
        Commands::Seal { sign_key } => cmd_seal(&cli, sign_key.clone()),
        Commands::VerifySeal { dir, require_key } => {
            cmd_verify_seal(&cli, dir.clone(), require_key.clone())
        }
        Commands::Status => cmd_status(&cli),
    }
}

fn hash_options(cli: &Cli) -> HashOptions {
    HashOptions {
        tool: ToolVersion::current(),
        stack_git: collect_git_identity(&cli.stack_root),
        include_values_contents: !cli.no_hash_values,
    }
}

fn selector_spec(cli: &Cli) -> Result<SelectorSpec> {
    let changed_files = match &cli.since {
        Some(range) => git_changed_files(&cli.stack_root, range)?,
        None => Vec::new(),
    };
    Ok(SelectorSpec {
        cluster: cli.cluster.clone(),
        tags: cli.tags.clone(),
        paths: cli.paths.clone(),
        names: cli.releases.clone(),
        changed_files,
        include_deps: cli.include_deps,
        include_dependents: cli.include_dependents,
        allow_missing_deps: cli.allow_missing_deps,
    })
}

fn compile_plan(cli: &Cli) -> Result<Plan> {
    let universe = discover_universe(&cli.stack_root)?;
    let compiler = Compiler::new(
        universe,
        CompileOptions {
            profile: cli.profile.clone(),
            hash: hash_options(cli),
        },
    );
    let plan = compiler.compile()?;
    let selector = Selector::new(selector_spec(cli)?);
    Ok(selector.apply(&plan)?)
}

fn run_options(cli: &Cli, args: &RunArgs, command: Command) -> Result<RunOptions> {
    let git = collect_git_identity(&cli.stack_root);
    Ok(RunOptions {
        command,
        fail_mode: if args.fail_fast {
            FailMode::FailFast
        } else {
            FailMode::FailAtEnd
        },
        max_attempts: args.max_attempts.max(1),
        concurrency: args.concurrency,
        progressive_concurrency: args.progressive.then_some(true),
        adaptive: None,
        lock: !args.no_lock,
        lock_owner: None,
        lock_ttl: parse_duration(&args.lock_ttl).context("invalid --lock-ttl")?,
        takeover_lock: args.takeover_lock,
        run_id: None,
        selector: serde_json::to_value(selector_spec(cli)?)?,
        retry_base: parse_duration(&args.retry_base).context("invalid --retry-base")?,
        retry_cap: parse_duration(&args.retry_cap).context("invalid --retry-cap")?,
        max_runs: args.max_runs,
        git_commit: git.as_ref().map(|g| g.commit.clone()).unwrap_or_default(),
        git_dirty: git.map(|g| g.dirty).unwrap_or(false),
    })
}

fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid duration: {raw}"))
}

fn cmd_plan(cli: &Cli) -> Result<()> {
    let plan = compile_plan(cli)?;
    println!("stack: {} ({} releases)", plan.stack_name, plan.nodes.len());
    if let Some(profile) = &plan.profile {
        println!("profile: {profile}");
    }
    for id in &plan.order {
        let node = plan.node(id).expect("ordered node exists");
        println!(
            "  wave {:>2}  {id}  [{}]  {}",
            node.execution_group,
            node.primary_kind(),
            node.effective_input_hash
        );
        if cli.verbose {
            for reason in &node.selected_by {
                println!("            selected by {reason}");
            }
        }
    }
    Ok(())
}

fn run_report(cli: &Cli, plan: &Plan, options: &RunOptions, resume_id: Option<&str>) -> Result<()> {
    let store = StateStore::open(&cli.stack_root)?;
    let hub = ObserverHub::new();
    let progress = Arc::new(ProgressObserver::new(plan.nodes.len() as u64, cli.verbose));
    hub.register(progress.clone());

    let executor = Arc::new(HelmExecutor::discover()?);
    let runner = Runner::new(&store, executor, hub)?;
    let cancel = CancelToken::new();
    let report = match resume_id {
        Some(run_id) => runner.resume(run_id, options, &cancel)?,
        None => runner.run(plan, options, &cancel)?,
    };
    progress.finish();

    println!(
        "run {}: {} (succeeded {}, failed {}, blocked {})",
        report.run_id,
        report.status.as_str(),
        report.summary.totals.succeeded,
        report.summary.totals.failed,
        report.summary.totals.blocked
    );
    println!("run digest: {}", report.run_digest);
    store.close()?;
    if report.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_run(cli: &Cli, args: RunArgs, command: Command) -> Result<()> {
    let plan = compile_plan(cli)?;
    if plan.nodes.is_empty() {
        bail!("selection matched no releases");
    }
    let options = run_options(cli, &args, command)?;
    run_report(cli, &plan, &options, None)
}

fn cmd_resume(cli: &Cli, run_id: Option<String>, args: RunArgs) -> Result<()> {
    let store = StateStore::open(&cli.stack_root)?;
    let run_id = match run_id {
        Some(id) => id,
        None => load_most_recent_run(&store)?.context("no runs recorded yet")?,
    };
    let plan = store.get_run_plan(&run_id)?;
    store.close()?;

    // Command and fail mode travel with the stored run; flags still tune
    // retries and locking.
    let options = run_options(cli, &args, Command::Apply)?;
    run_report(cli, &plan, &options, Some(&run_id))
}

fn cmd_rerun_failed(
    cli: &Cli,
    run_id: Option<String>,
    allow_drift: bool,
    args: RunArgs,
) -> Result<()> {
    let store = StateStore::open(&cli.stack_root)?;
    let run_id = match run_id {
        Some(id) => id,
        None => load_most_recent_run(&store)?.context("no runs recorded yet")?,
    };
    let replayed = replay_run(&store, &run_id)?;
    let listing = store.get_run(&run_id)?;
    let records = store.list_node_status(&run_id)?;
    store.close()?;

    let drifted = drift_report(&replayed.plan, &hash_options(cli))?;
    if !drifted.is_empty() && !allow_drift {
        for entry in &drifted {
            eprintln!(
                "drift: {} {} -> {}",
                entry.node_id, entry.stored_hash, entry.current_hash
            );
        }
        bail!(
            "{} release(s) drifted since run {run_id}; pass --allow-drift to proceed",
            drifted.len()
        );
    }

    let candidates = rerun_candidates(&records);
    if candidates.is_empty() {
        println!("nothing to re-run: every node succeeded");
        return Ok(());
    }
    let names: Vec<String> = replayed
        .plan
        .nodes
        .iter()
        .filter(|n| candidates.contains(&n.id))
        .map(|n| n.name.clone())
        .collect();
    let selector = Selector::new(SelectorSpec {
        names,
        allow_missing_deps: true,
        ..SelectorSpec::default()
    });
    let filtered = selector.apply(&replayed.plan)?;

    let options = run_options(cli, &args, listing.command)?;
    run_report(cli, &filtered, &options, None)
}

fn cmd_runs(cli: &Cli, limit: usize) -> Result<()> {
    let store = StateStore::open(&cli.stack_root)?;
    let runs = store.list_runs(limit)?;
    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:7}  {:9}  {}",
            run.run_id,
            run.command.as_str(),
            run.status.as_str(),
            run.stack_name
        );
    }
    Ok(())
}

fn cmd_tail(cli: &Cli, run_id: Option<String>, limit: usize) -> Result<()> {
    let store = StateStore::open(&cli.stack_root)?;
    let run_id = match run_id {
        Some(id) => id,
        None => load_most_recent_run(&store)?.context("no runs recorded yet")?,
    };
    let (events, _) = store.tail_events(&run_id, limit)?;
    for event in events {
        let node = event.node_id.as_deref().unwrap_or("-");
        println!(
            "{:>6}  {:18}  {node}  {}",
            event.seq,
            event.event_type.as_str(),
            event.message
        );
    }
    Ok(())
}

fn cmd_export(cli: &Cli, run_id: Option<String>) -> Result<()> {
    let store = StateStore::open(&cli.stack_root)?;
    let run_id = match run_id {
        Some(id) => id,
        None => load_most_recent_run(&store)?.context("no runs recorded yet")?,
    };
    let out = cli
        .stack_root
        .join(".ktl/stack/exports")
        .join(format!("{run_id}.tgz"));
    export_run(&store, &run_id, &out)?;
    println!("exported {}", out.display());
    Ok(())
}

fn cmd_seal(cli: &Cli, sign_key: Option<PathBuf>) -> Result<()> {
    let plan = compile_plan(cli)?;
    let out_dir = cli.stack_root.join(".ktl/stack/sealed");
    let paths = seal(&plan, &out_dir)?;
    println!("sealed {} releases into {}", plan.nodes.len(), paths.dir.display());

    if let Some(key_path) = sign_key {
        let raw = std::fs::read_to_string(&key_path)
            .with_context(|| format!("failed to read signing key {}", key_path.display()))?;
        let key = parse_signing_key(&raw)?;
        let envelope = sign(&paths.dir, &key)?;
        println!("signed with key {}", envelope.public_key);
    }
    Ok(())
}

fn cmd_verify_seal(cli: &Cli, dir: Option<PathBuf>, require_key: Option<String>) -> Result<()> {
    let dir = dir.unwrap_or_else(|| cli.stack_root.join(".ktl/stack/sealed"));
    let loaded = load_sealed_plan(&dir, &hash_options(cli))?;
    println!(
        "sealed plan verified: {} ({} releases)",
        loaded.manifest.plan_hash,
        loaded.plan.nodes.len()
    );

    if let Some(pinned_hex) = require_key {
        let pinned = parse_verifying_key(&pinned_hex)?;
        verify_signature(&dir, Some(&pinned))?;
        println!("signature verified against pinned key");
    } else if dir.join("signature.json").exists() {
        verify_signature(&dir, None)?;
        println!("signature verified");
    }
    Ok(())
}

fn cmd_status(cli: &Cli) -> Result<()> {
    let store = StateStore::open(&cli.stack_root)?;
    let Some(run_id) = load_most_recent_run(&store)? else {
        println!("no runs recorded");
        return Ok(());
    };
    let listing = store.get_run(&run_id)?;
    let summary = store.get_run_summary(&run_id)?;
    println!(
        "run {}  {}  {}",
        listing.run_id,
        listing.command.as_str(),
        listing.status.as_str()
    );
    println!(
        "  planned {}  running {}  succeeded {}  failed {}  blocked {}",
        summary.totals.planned,
        summary.totals.running,
        summary.totals.succeeded,
        summary.totals.failed,
        summary.totals.blocked
    );
    for id in &summary.order {
        let node = &summary.nodes[id];
        println!("  {:9}  {id}  (attempt {})", node.status.as_str(), node.attempt);
    }
    Ok(())
}

/// Git identity of the stack root, best effort.
fn collect_git_identity(root: &std::path::Path) -> Option<StackGitIdentity> {
    let commit = git_output(root, &["rev-parse", "HEAD"])?;
    let dirty = git_output(root, &["status", "--porcelain"])
        .map(|out| !out.is_empty())
        .unwrap_or(false);
    Some(StackGitIdentity { commit, dirty })
}

/// Files changed in a git range, as paths relative to the stack root.
fn git_changed_files(root: &std::path::Path, range: &str) -> Result<Vec<PathBuf>> {
    let out = git_output(root, &["diff", "--name-only", range])
        .with_context(|| format!("git diff failed for range {range}"))?;
    Ok(out.lines().map(PathBuf::from).collect())
}

fn git_output(root: &std::path::Path, args: &[&str]) -> Option<String> {
    let output = Process::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
