//! Sandboxed command execution.
//!
//! A command runs as the leader of its own process group, with setrlimit
//! ceilings and (on Linux) a seccomp-bpf allow-list installed between fork
//! and exec, under a wall-clock watchdog that kills the whole group.
//!
//! Platform enforcement:
//! - Linux x86_64/aarch64: seccomp-bpf + rlimits + process groups
//! - Other unix: rlimits + process groups; syscall filtering is a no-op

mod child;
pub mod config;
pub mod detect;
pub mod executor;
pub mod filter;
pub mod limits;
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod linux;
pub mod process_group;
pub mod profile;

pub use config::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT, EnforcementMode, SandboxConfig, SandboxConfigBuilder};
pub use detect::{FilterCapability, SandboxCapabilities, detect_capabilities, probe_syscall_filtering};
pub use executor::{
    EXIT_CANNOT_EXECUTE, EXIT_NOT_FOUND, EXIT_POLICY_DENIED, ExecutionOutcome, ExecutionResult,
    ResourceUsage, SandboxManager, SecurityServices,
};
pub use filter::{FilterError, Filtered, PreparedFilter, ProcessCapabilities, RestrictError, SyscallFilter, Unfiltered};
pub use limits::ResourceLimits;
pub use process_group::{KillSignal, kill_process_group, process_group_alive};
pub use profile::{ALWAYS_DENIED, PolicySet, SyscallProfile, is_always_denied, is_known_syscall};
