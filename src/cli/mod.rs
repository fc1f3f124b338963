pub mod audit;
pub mod check;
pub mod paths;
pub mod run;
pub mod status;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use crate::config::Config;
use crate::paths::Paths;

#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about = "Run untrusted commands under a sandbox policy")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command inside the sandbox
    Run(run::RunArgs),

    /// Show platform capabilities and effective configuration
    Status,

    /// Evaluate a path or host against the configured policy (no audit entry)
    Check(check::CheckArgs),

    /// Inspect the audit log
    Audit(audit::AuditArgs),

    /// Show resolved XDG directory paths
    Paths,
}

/// Load the config named by `--config`, or the default one.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    match explicit {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).into_owned());
            Config::load_from(&path, Paths::resolve()?)
        }
        None => Config::load(),
    }
}

/// Map a child exit code onto the CLI's own.
pub(crate) fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
