use std::io::Read;
use std::process::{Command as Process, Stdio};
use std::time::{Duration, Instant};

use ktl_stack_types::{CancelToken, HookKind, HookSpec, HttpHookSpec, KubectlHookSpec};

use crate::HookContext;

/// Output tail cap for hook logs and http response bodies.
const OUTPUT_CAP: usize = 64 * 1024;

/// Base of the linear retry backoff (`base * attempt`).
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Captured output of one hook attempt, streamed to the caller.
#[derive(Debug, Clone)]
pub struct HookOutput {
    pub attempt: u32,
    pub text: String,
}

/// Successful hook execution.
#[derive(Debug, Clone)]
pub struct HookResult {
    pub attempts: u32,
    pub output_tail: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook {hook} failed after {attempts} attempts: {message}")]
    Exhausted {
        hook: String,
        attempts: u32,
        message: String,
        output_tail: String,
    },
    #[error("hook {hook} canceled")]
    Canceled { hook: String },
    #[error("hook {hook} is not runnable: {reason}")]
    NotRunnable { hook: String, reason: String },
}

/// Run one hook to completion: per-attempt timeout, linear backoff between
/// attempts, cooperative cancellation. `on_output` receives each attempt's
/// captured output for ephemeral streaming.
pub fn run_hook(
    hook: &HookSpec,
    ctx: &HookContext<'_>,
    cancel: &CancelToken,
    on_output: &mut dyn FnMut(HookOutput),
) -> Result<HookResult, HookError> {
    let mut last_failure = String::new();
    let mut last_output = String::new();

    for attempt in 1..=hook.retry.max(1) {
        if cancel.is_canceled() {
            return Err(HookError::Canceled {
                hook: hook.name.clone(),
            });
        }
        if attempt > 1 {
            let backoff = RETRY_BACKOFF_BASE * (attempt - 1);
            interruptible_sleep(backoff, cancel);
            if cancel.is_canceled() {
                return Err(HookError::Canceled {
                    hook: hook.name.clone(),
                });
            }
        }

        let outcome = match hook.kind {
            HookKind::Kubectl => run_kubectl(hook, ctx, cancel),
            HookKind::Script => run_script(hook, ctx, cancel),
            HookKind::Http => run_http(hook),
        };
        match outcome {
            Ok(output) => {
                if !output.is_empty() {
                    on_output(HookOutput {
                        attempt,
                        text: output.clone(),
                    });
                }
                return Ok(HookResult {
                    attempts: attempt,
                    output_tail: tail(&output),
                });
            }
            Err(AttemptError::Fatal(reason)) => {
                return Err(HookError::NotRunnable {
                    hook: hook.name.clone(),
                    reason,
                });
            }
            Err(AttemptError::Canceled) => {
                return Err(HookError::Canceled {
                    hook: hook.name.clone(),
                });
            }
            Err(AttemptError::Failed { message, output }) => {
                if !output.is_empty() {
                    on_output(HookOutput {
                        attempt,
                        text: output.clone(),
                    });
                }
                last_failure = message;
                last_output = output;
            }
        }
    }

    Err(HookError::Exhausted {
        hook: hook.name.clone(),
        attempts: hook.retry.max(1),
        message: last_failure,
        output_tail: tail(&last_output),
    })
}

enum AttemptError {
    /// Misconfiguration that no retry will fix.
    Fatal(String),
    Canceled,
    Failed { message: String, output: String },
}

fn run_kubectl(
    hook: &HookSpec,
    ctx: &HookContext<'_>,
    cancel: &CancelToken,
) -> Result<String, AttemptError> {
    let spec = hook
        .kubectl
        .as_ref()
        .ok_or_else(|| AttemptError::Fatal("kubectl configuration missing".to_string()))?;
    let binary = which::which("kubectl")
        .map_err(|e| AttemptError::Fatal(format!("kubectl not found: {e}")))?;
    let args = kubectl_args(spec, ctx);
    let work_dir = ctx.default_work_dir();
    run_process(&binary.display().to_string(), &args, &work_dir, &[], hook.timeout, cancel)
}

fn run_script(
    hook: &HookSpec,
    ctx: &HookContext<'_>,
    cancel: &CancelToken,
) -> Result<String, AttemptError> {
    let spec = hook
        .script
        .as_ref()
        .ok_or_else(|| AttemptError::Fatal("script configuration missing".to_string()))?;
    let Some((program, rest)) = spec.command.split_first() else {
        return Err(AttemptError::Fatal("script command is empty".to_string()));
    };
    let work_dir = spec
        .work_dir
        .clone()
        .unwrap_or_else(|| ctx.default_work_dir());

    // Contract order: inherited env, then ktl variables, then the hook's
    // own env sorted by key (BTreeMap iteration is sorted).
    let mut env = ctx.env_contract();
    env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    run_process(program, rest, &work_dir, &env, hook.timeout, cancel)
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter()
        .any(|a| a == flag || a.starts_with(&format!("{flag}=")))
}

/// Merge the declared args with injected cluster flags. Flags already
/// present in the declaration are not overridden.
pub fn kubectl_args(spec: &KubectlHookSpec, ctx: &HookContext<'_>) -> Vec<String> {
    let mut args = spec.args.clone();

    if let Some(node) = ctx.node {
        if !has_flag(&args, "--kubeconfig") {
            if let Some(kubeconfig) = &node.cluster.kubeconfig {
                args.push("--kubeconfig".to_string());
                args.push(kubeconfig.display().to_string());
            }
        }
        if !has_flag(&args, "--context") {
            if let Some(context) = &node.cluster.context {
                args.push("--context".to_string());
                args.push(context.clone());
            }
        }
    }
    let namespace = spec
        .namespace
        .clone()
        .or_else(|| ctx.namespace().map(String::from));
    if !has_flag(&args, "-n") && !has_flag(&args, "--namespace") {
        if let Some(namespace) = namespace {
            args.push("-n".to_string());
            args.push(namespace);
        }
    }
    args
}

fn run_process(
    program: &str,
    args: &[String],
    work_dir: &std::path::Path,
    env: &[(String, String)],
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<String, AttemptError> {
    let mut command = Process::new(program);
    command
        .args(args)
        .current_dir(work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| AttemptError::Failed {
        message: format!("failed to spawn {program}: {e}"),
        output: String::new(),
    })?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = read_pipe(child.stdout.take());
                let stderr = read_pipe(child.stderr.take());
                let output = join_output(&stdout, &stderr);
                if status.success() {
                    return Ok(output);
                }
                return Err(AttemptError::Failed {
                    message: format!(
                        "{program} exited with code {}",
                        status.code().unwrap_or(-1)
                    ),
                    output,
                });
            }
            Ok(None) => {
                if cancel.is_canceled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AttemptError::Canceled);
                }
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let stdout = read_pipe(child.stdout.take());
                    let stderr = read_pipe(child.stderr.take());
                    return Err(AttemptError::Failed {
                        message: format!(
                            "{program} timed out after {}",
                            humantime::format_duration(timeout)
                        ),
                        output: join_output(&stdout, &stderr),
                    });
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                return Err(AttemptError::Failed {
                    message: format!("failed to poll {program}: {e}"),
                    output: String::new(),
                });
            }
        }
    }
}

fn run_http(hook: &HookSpec) -> Result<String, AttemptError> {
    let spec = hook
        .http
        .as_ref()
        .ok_or_else(|| AttemptError::Fatal("http configuration missing".to_string()))?;
    let client = reqwest::blocking::Client::builder()
        .timeout(hook.timeout)
        .build()
        .map_err(|e| AttemptError::Fatal(format!("failed to build http client: {e}")))?;

    let method = effective_method(spec);
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| AttemptError::Fatal(format!("invalid http method {method}")))?;

    let mut request = client.request(method, &spec.url);
    for (key, value) in &spec.headers {
        request = request.header(key, value);
    }
    if let Some(body) = &spec.body {
        request = request.body(body.clone());
    }

    let response = request.send().map_err(|e| AttemptError::Failed {
        message: format!("http request failed: {e}"),
        output: String::new(),
    })?;
    let status = response.status();
    let body = read_capped_body(response);

    // 2xx and 3xx are success; 4xx/5xx fail with whatever the server said.
    if status.is_success() || status.is_redirection() {
        Ok(body)
    } else {
        let message = if body.is_empty() {
            format!("http status {status}")
        } else {
            format!("http status {status}: {}", tail(&body))
        };
        Err(AttemptError::Failed {
            message,
            output: body,
        })
    }
}

/// POST when a body is declared, GET otherwise; explicit method wins.
pub fn effective_method(spec: &HttpHookSpec) -> String {
    match &spec.method {
        Some(method) => method.to_uppercase(),
        None => {
            if spec.body.as_ref().is_some_and(|b| !b.is_empty()) {
                "POST".to_string()
            } else {
                "GET".to_string()
            }
        }
    }
}

fn read_capped_body(response: reqwest::blocking::Response) -> String {
    let mut buf = Vec::with_capacity(1024);
    let mut limited = response.take(OUTPUT_CAP as u64);
    let _ = limited.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut out = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.take(OUTPUT_CAP as u64).read_to_string(&mut out);
    }
    out
}

fn join_output(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

fn tail(output: &str) -> String {
    if output.len() <= OUTPUT_CAP {
        return output.to_string();
    }
    let mut start = output.len() - OUTPUT_CAP;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}

fn interruptible_sleep(total: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + total;
    while !cancel.is_canceled() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25).min(remaining));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use ktl_stack_types::{
        ClusterTarget, Command, HookKind, HookSpec, ResolvedRelease, ScriptHookSpec,
    };

    use super::*;
    use crate::HookContext;

    fn node() -> ResolvedRelease {
        ResolvedRelease {
            id: "prod/apps/api".to_string(),
            name: "api".to_string(),
            dir: PathBuf::from("."),
            cluster: ClusterTarget {
                name: "prod".to_string(),
                kubeconfig: Some(PathBuf::from("/kube/prod.yaml")),
                context: Some("prod-admin".to_string()),
            },
            namespace: "apps".to_string(),
            chart: "charts/api".to_string(),
            values: vec![],
            set: BTreeMap::new(),
            tags: Default::default(),
            needs: vec![],
            apply: Default::default(),
            delete: Default::default(),
            hooks: Default::default(),
            role: Default::default(),
            wave: 0,
            parallelism_group: String::new(),
            execution_group: 0,
            effective_input_hash: String::new(),
            inputs_cursor: serde_json::Value::Null,
            selected_by: vec![],
        }
    }

    fn script_hook(command: Vec<&str>, retry: u32, timeout: Duration) -> HookSpec {
        HookSpec {
            name: "test-hook".to_string(),
            kind: HookKind::Script,
            when: None,
            retry,
            timeout,
            run_once: false,
            kubectl: None,
            script: Some(ScriptHookSpec {
                command: command.into_iter().map(String::from).collect(),
                work_dir: None,
                env: BTreeMap::new(),
            }),
            http: None,
        }
    }

    fn ctx<'a>(node: &'a ResolvedRelease, root: &'a Path) -> HookContext<'a> {
        HookContext {
            stack_root: root,
            profile: None,
            run_id: "run-1",
            command: Command::Apply,
            node: Some(node),
            sole_namespace: None,
        }
    }

    #[test]
    fn kubectl_args_inject_missing_cluster_flags() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(&node, td.path());
        let spec = KubectlHookSpec {
            args: vec!["apply".to_string(), "-f".to_string(), "manifest.yaml".to_string()],
            namespace: None,
        };
        let args = kubectl_args(&spec, &ctx);
        assert!(args.windows(2).any(|w| w == ["--kubeconfig", "/kube/prod.yaml"]));
        assert!(args.windows(2).any(|w| w == ["--context", "prod-admin"]));
        assert!(args.windows(2).any(|w| w == ["-n", "apps"]));
    }

    #[test]
    fn kubectl_args_respect_declared_flags() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(&node, td.path());
        let spec = KubectlHookSpec {
            args: vec![
                "get".to_string(),
                "pods".to_string(),
                "-n".to_string(),
                "other".to_string(),
                "--context=staging".to_string(),
            ],
            namespace: None,
        };
        let args = kubectl_args(&spec, &ctx);
        assert_eq!(args.iter().filter(|a| *a == "-n").count(), 1);
        assert!(!args.contains(&"prod-admin".to_string()));
        assert!(args.windows(2).any(|w| w == ["-n", "other"]));
    }

    #[test]
    fn kubectl_hook_namespace_overrides_node_namespace() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(&node, td.path());
        let spec = KubectlHookSpec {
            args: vec!["get".to_string(), "pods".to_string()],
            namespace: Some("override".to_string()),
        };
        let args = kubectl_args(&spec, &ctx);
        assert!(args.windows(2).any(|w| w == ["-n", "override"]));
    }

    #[test]
    fn effective_method_defaults_by_body() {
        let mut spec = HttpHookSpec {
            url: "https://example.test".to_string(),
            method: None,
            body: None,
            headers: BTreeMap::new(),
        };
        assert_eq!(effective_method(&spec), "GET");
        spec.body = Some("{}".to_string());
        assert_eq!(effective_method(&spec), "POST");
        spec.method = Some("put".to_string());
        assert_eq!(effective_method(&spec), "PUT");
    }

    #[test]
    fn script_hook_runs_and_captures_output() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(&node, td.path());
        let hook = script_hook(vec!["sh", "-c", "echo ran-fine"], 1, Duration::from_secs(10));

        let mut outputs = Vec::new();
        let result = run_hook(&hook, &ctx, &CancelToken::new(), &mut |o| outputs.push(o))
            .expect("hook runs");
        assert_eq!(result.attempts, 1);
        assert!(result.output_tail.contains("ran-fine"));
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn script_hook_sees_the_env_contract() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(&node, td.path());
        let hook = script_hook(
            vec!["sh", "-c", "echo id=$KTL_RELEASE_ID cmd=$KTL_STACK_COMMAND"],
            1,
            Duration::from_secs(10),
        );
        let result = run_hook(&hook, &ctx, &CancelToken::new(), &mut |_| {}).expect("hook runs");
        assert!(result.output_tail.contains("id=prod/apps/api"));
        assert!(result.output_tail.contains("cmd=apply"));
    }

    #[test]
    fn failing_hook_retries_then_exhausts() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(&node, td.path());
        // Fails every time; 2 attempts with the minimal backoff.
        let hook = script_hook(vec!["sh", "-c", "echo nope >&2; exit 3"], 2, Duration::from_secs(10));

        let err = run_hook(&hook, &ctx, &CancelToken::new(), &mut |_| {}).expect_err("exhausts");
        match err {
            HookError::Exhausted {
                attempts,
                message,
                output_tail,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("exited with code 3"));
                assert!(output_tail.contains("nope"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn retrying_hook_eventually_succeeds() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(&node, td.path());
        let marker = td.path().join("marker");
        // First attempt creates the marker and fails; second sees it and
        // succeeds.
        let script = format!(
            "if [ -f {m} ]; then echo done; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let hook = script_hook(vec!["sh", "-c", &script], 3, Duration::from_secs(10));
        let result = run_hook(&hook, &ctx, &CancelToken::new(), &mut |_| {}).expect("succeeds");
        assert_eq!(result.attempts, 2);
    }

    #[test]
    fn hook_timeout_kills_the_subprocess() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(&node, td.path());
        let hook = script_hook(vec!["sleep", "30"], 1, Duration::from_millis(200));

        let start = std::time::Instant::now();
        let err = run_hook(&hook, &ctx, &CancelToken::new(), &mut |_| {}).expect_err("times out");
        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            HookError::Exhausted { message, .. } => assert!(message.contains("timed out")),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[test]
    fn canceled_token_interrupts_a_running_hook() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let ctx = ctx(&node, td.path());
        let hook = script_hook(vec!["sleep", "30"], 1, Duration::from_secs(60));
        let start = std::time::Instant::now();
        let err = run_hook(&hook, &ctx, &cancel, &mut |_| {}).expect_err("canceled");
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, HookError::Canceled { .. }));
    }

    #[test]
    fn empty_script_command_is_not_runnable() {
        let node = node();
        let td = tempfile::tempdir().expect("tempdir");
        let ctx = ctx(&node, td.path());
        let hook = script_hook(vec![], 3, Duration::from_secs(10));
        let err = run_hook(&hook, &ctx, &CancelToken::new(), &mut |_| {}).expect_err("fatal");
        assert!(matches!(err, HookError::NotRunnable { .. }));
    }
}
