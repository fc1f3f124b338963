use anyhow::Result;
use clap::{Args, Subcommand};
use std::process::ExitCode;

use crate::config::Config;
use crate::security::{AccessMode, FileSystemAccessControl, NetworkAccessControl};

#[derive(Args)]
pub struct CheckArgs {
    #[command(subcommand)]
    pub command: CheckCommands,

    /// Print the decision as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum CheckCommands {
    /// Would the sandbox let a command access this path?
    Path {
        path: String,

        /// Check write access instead of read
        #[arg(short, long)]
        write: bool,
    },

    /// Would the sandbox let a command connect to this host?
    Host { host: String },
}

/// Exit status 0 when allowed, 1 when denied.
pub fn run(args: CheckArgs, config: &Config) -> Result<ExitCode> {
    let allowed = match args.command {
        CheckCommands::Path { path, write } => {
            let mode = if write { AccessMode::Write } else { AccessMode::Read };
            let access = FileSystemAccessControl::new(config.filesystem_policy()?);
            let expanded = shellexpand::tilde(&path);
            let decision = access.evaluate(&*expanded, mode);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                let resolved = decision
                    .resolved
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(unresolvable)".to_string());
                match decision.reason {
                    None => println!("allow  {} {}", mode, resolved),
                    Some(reason) => println!("deny   {} {} ({})", mode, resolved, reason),
                }
            }
            decision.allowed
        }
        CheckCommands::Host { host } => {
            let access = NetworkAccessControl::new(config.network_policy()?);
            let decision = access.evaluate(&host);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                match decision.reason {
                    None => println!("allow  {}", decision.host),
                    Some(reason) => println!("deny   {} ({})", decision.host, reason),
                }
            }
            decision.allowed
        }
    };

    Ok(if allowed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
