use anyhow::{Context, Result};
use clap::Args;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use crate::config::Config;
use crate::sandbox::{EnforcementMode, SandboxManager, SecurityServices, SyscallProfile};
use crate::security::{FileSystemAccessControl, NetworkAccessControl};

#[derive(Args)]
pub struct RunArgs {
    /// Wall-clock timeout in seconds (overrides config)
    #[arg(short, long)]
    pub timeout: Option<f64>,

    /// Enforcement mode: enforce or warn (overrides config)
    #[arg(short, long)]
    pub mode: Option<EnforcementMode>,

    /// Syscall profile: strict, moderate or permissive (overrides config)
    #[arg(short, long)]
    pub profile: Option<SyscallProfile>,

    /// Working directory for the command (overrides config)
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Run without any sandboxing (still audited)
    #[arg(long)]
    pub no_sandbox: bool,

    /// Print the result as JSON instead of relaying output
    #[arg(long)]
    pub json: bool,

    /// Command and arguments (no shell is involved)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

pub async fn run(args: RunArgs, mut config: Config) -> Result<ExitCode> {
    if let Some(timeout) = args.timeout {
        config.sandbox.timeout_secs = timeout;
    }
    if let Some(mode) = args.mode {
        config.sandbox.mode = mode;
    }
    if let Some(profile) = args.profile {
        config.sandbox.profile = profile;
    }
    if let Some(ref ws) = args.workspace {
        config.filesystem.workspace = Some(ws.to_string_lossy().into_owned());
    }
    if args.no_sandbox {
        config.sandbox.enabled = false;
    }

    let sandbox = config.sandbox_config()?;
    let workspace = config.workspace()?;
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace: {}", workspace.display()))?;

    let services = SecurityServices::new(
        Arc::new(config.security_monitor()),
        Arc::new(config.open_audit_logger()?),
    );
    let manager = SandboxManager::new(sandbox, &workspace, services)
        .with_filesystem_policy(FileSystemAccessControl::new(config.filesystem_policy()?))
        .with_network_policy(NetworkAccessControl::new(config.network_policy()?));

    let result = manager.execute_async(&args.command).await;

    if args.json {
        let value = serde_json::json!({
            "execution_id": result.execution_id,
            "exit_code": result.exit_code,
            "outcome": result.outcome,
            "killed": result.killed,
            "timed_out": result.timed_out,
            "signal": result.signal,
            "execution_time_ms": result.execution_time.as_millis() as u64,
            "resource_usage": result.resource_usage,
            "output_truncated": result.output_truncated,
            "sandboxed": result.sandboxed,
            "stdout": result.stdout,
            "stderr": result.stderr,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        std::io::stdout().write_all(result.stdout.as_bytes())?;
        std::io::stderr().write_all(result.stderr.as_bytes())?;
        if result.timed_out {
            eprintln!(
                "warden: timed out after {:.1}s",
                result.execution_time.as_secs_f64()
            );
        } else if result.killed {
            eprintln!("warden: killed by resource limit (signal {:?})", result.signal);
        }
        if result.output_truncated {
            eprintln!("warden: output truncated");
        }
    }

    Ok(super::exit_code(result.exit_code))
}
