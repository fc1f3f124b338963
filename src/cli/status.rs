use anyhow::Result;

use crate::config::Config;
use crate::sandbox::{SyscallFilter, detect_capabilities};

pub fn run(config: &Config) -> Result<()> {
    let caps = detect_capabilities();

    println!("Sandbox Capabilities:");
    for line in caps.status_lines() {
        println!("{}", line);
    }
    println!();

    let sandbox = config.sandbox_config()?;
    let filter = SyscallFilter::from_config(&sandbox);
    println!("Configuration:");
    println!("  Enabled:     {}", sandbox.enabled());
    println!("  Mode:        {}", sandbox.mode());
    println!(
        "  Profile:     {} ({} syscalls allowed)",
        sandbox.syscall_profile(),
        filter.policy().len()
    );
    println!("  Timeout:     {}s", sandbox.timeout().as_secs_f64());
    match sandbox.cpu_time_limit() {
        Some(cpu) => println!("  CPU limit:   {}s", cpu.as_secs_f64()),
        None => println!("  CPU limit:   none"),
    }
    match sandbox.memory_limit_mb() {
        Some(mb) => println!("  Memory:      {} MB", mb),
        None => println!("  Memory:      unlimited"),
    }
    println!("  Max output:  {} bytes", sandbox.max_output_bytes());
    println!("  Workspace:   {}", config.workspace()?.display());
    println!(
        "  Network:     default {}",
        if config.network.default_allow { "allow" } else { "deny" }
    );
    if !config.network.allowed_hosts.is_empty() {
        println!("  Allow hosts: {:?}", config.network.allowed_hosts);
    }
    if !config.filesystem.allow_paths.is_empty() {
        println!("  Extra paths: {:?}", config.filesystem.allow_paths);
    }
    println!();

    let audit_path = config.audit_path()?;
    println!("Audit log:     {}", audit_path.display());
    if audit_path.exists() {
        let stats = config.open_audit_logger()?.get_statistics()?;
        println!(
            "  {} entries, {} executions ({} unsandboxed, {} killed)",
            stats.total_entries,
            stats.executions,
            stats.unsandboxed_executions,
            stats.killed_executions
        );
        if stats.corrupted_lines > 0 {
            println!("  WARNING: {} unreadable lines", stats.corrupted_lines);
        }
    }

    Ok(())
}
