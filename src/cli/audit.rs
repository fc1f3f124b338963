use anyhow::Result;
use clap::{Args, Subcommand};
use std::process::ExitCode;

use crate::config::Config;
use crate::security::{AuditEntry, AuditRecord};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Show the most recent entries, oldest first
    Recent {
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Aggregate counts over the whole log
    Stats,

    /// Check the hash chain; exits non-zero if any link is broken
    Verify,
}

pub fn run(args: AuditArgs, config: &Config) -> Result<ExitCode> {
    let logger = config.open_audit_logger()?;

    match args.command {
        AuditCommands::Recent { limit, json } => {
            for entry in logger.read_recent_entries(limit)? {
                if json {
                    println!("{}", serde_json::to_string(&entry)?);
                } else {
                    println!("{}", format_entry(&entry));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        AuditCommands::Stats => {
            let stats = logger.get_statistics()?;
            println!("Audit log: {}", logger.path().display());
            println!("  Entries:            {}", stats.total_entries);
            println!("  Executions:         {}", stats.executions);
            println!("    unsandboxed:      {}", stats.unsandboxed_executions);
            println!("    non-zero exit:    {}", stats.failed_executions);
            println!("    killed:           {}", stats.killed_executions);
            println!("    timed out:        {}", stats.timed_out_executions);
            println!(
                "  File access:        {} allowed, {} denied",
                stats.file_access_allowed, stats.file_access_denied
            );
            println!(
                "  Network access:     {} allowed, {} denied",
                stats.network_access_allowed, stats.network_access_denied
            );
            if stats.chain_recoveries > 0 {
                println!("  Chain recoveries:   {}", stats.chain_recoveries);
            }
            if stats.corrupted_lines > 0 {
                println!("  Unreadable lines:   {}", stats.corrupted_lines);
            }
            Ok(ExitCode::SUCCESS)
        }
        AuditCommands::Verify => {
            let broken = logger.verify_chain()?;
            if broken.is_empty() {
                println!("Audit chain intact: {}", logger.path().display());
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Audit chain broken at line(s): {:?}", broken);
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn format_entry(entry: &AuditEntry) -> String {
    let ts = entry.ts.format("%Y-%m-%d %H:%M:%S");
    match &entry.record {
        AuditRecord::Execution(exec) => {
            let mut flags = Vec::new();
            if !exec.sandboxed {
                flags.push("UNSANDBOXED");
            }
            if exec.timed_out {
                flags.push("TIMEOUT");
            } else if exec.killed {
                flags.push("KILLED");
            }
            format!(
                "{} exec  exit={:<4} {:>6}ms {} {}",
                ts,
                exec.exit_code,
                exec.duration_ms,
                exec.command.join(" "),
                flags.join(",")
            )
        }
        AuditRecord::FileAccess(access) => format!(
            "{} file  {} {} {}",
            ts,
            if access.allowed { "allow" } else { "deny " },
            access.operation,
            access.path.display()
        ),
        AuditRecord::NetworkAccess(access) => format!(
            "{} net   {} {}{} ({})",
            ts,
            if access.allowed { "allow" } else { "deny " },
            access.host,
            access.port.map(|p| format!(":{}", p)).unwrap_or_default(),
            access.protocol
        ),
        AuditRecord::ChainRecovery { detail } => format!("{} chain recovery: {}", ts, detail),
    }
}
