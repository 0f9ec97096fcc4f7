use std::process::Command as Process;

use anyhow::{Context, Result, bail};

use ktl_stack_engine::{NodeExecutor, RunContext};
use ktl_stack_types::{Command, ResolvedRelease};

/// Node executor that shells out to the `helm` binary: `upgrade --install`
/// for apply, `uninstall` for delete. Release options map onto helm flags.
pub struct HelmExecutor {
    binary: std::path::PathBuf,
}

impl HelmExecutor {
    pub fn discover() -> Result<Self> {
        let binary = which::which("helm").context("helm binary not found on PATH")?;
        Ok(Self { binary })
    }

    fn args_for(&self, node: &ResolvedRelease, command: Command) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match command {
            Command::Apply => {
                args.extend([
                    "upgrade".to_string(),
                    "--install".to_string(),
                    node.name.clone(),
                    node.chart.clone(),
                ]);
                for values in &node.values {
                    args.push("-f".to_string());
                    args.push(values.clone());
                }
                for (key, value) in &node.set {
                    args.push("--set".to_string());
                    args.push(format!("{key}={value}"));
                }
                if node.apply.atomic == Some(true) {
                    args.push("--atomic".to_string());
                }
                if node.apply.wait == Some(true) {
                    args.push("--wait".to_string());
                }
                if let Some(timeout) = node.apply.timeout {
                    args.push("--timeout".to_string());
                    args.push(format!("{}s", timeout.as_secs()));
                }
            }
            Command::Delete => {
                args.extend(["uninstall".to_string(), node.name.clone()]);
                if let Some(timeout) = node.delete.timeout {
                    args.push("--timeout".to_string());
                    args.push(format!("{}s", timeout.as_secs()));
                }
            }
        }
        args.push("-n".to_string());
        args.push(node.namespace.clone());
        if let Some(kubeconfig) = &node.cluster.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.display().to_string());
        }
        if let Some(context) = &node.cluster.context {
            args.push("--kube-context".to_string());
            args.push(context.clone());
        }
        args
    }
}

impl NodeExecutor for HelmExecutor {
    fn run_node(
        &self,
        ctx: &RunContext,
        node: &ResolvedRelease,
        command: Command,
    ) -> Result<()> {
        if ctx.cancel.is_canceled() {
            bail!("context canceled");
        }
        let args = self.args_for(node, command);
        let output = Process::new(&self.binary)
            .args(&args)
            .current_dir(&node.dir)
            .output()
            .with_context(|| format!("failed to exec helm for {}", node.id))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "helm {} failed for {} (exit {}): {}",
                args.first().map(String::as_str).unwrap_or(""),
                node.id,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        Ok(())
    }
}
