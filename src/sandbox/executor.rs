//! SandboxManager: runs one external command under a [`SandboxConfig`].
//!
//! Every call to [`SandboxManager::execute`] returns an [`ExecutionResult`]
//! (spawn problems become synthetic exit codes, never errors), appends one
//! audit entry, and raises at most one monitor event.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::child::{self, ChildExit, ChildSetup, ChildSpec};
use super::config::{EnforcementMode, SandboxConfig};
use super::filter::{FilterError, PreparedFilter, SyscallFilter};
use super::limits::ResourceLimits;
use crate::security::audit::{AuditError, AuditLogger, ExecutionRecord};
use crate::security::filesystem::{
    AccessMode, FileSystemAccessControl, FileSystemPolicy, FsAccessDecision, FsDenyReason,
};
use crate::security::monitor::{SecurityEventType, SecurityMonitor, Severity};
use crate::security::network::{NetworkAccessControl, NetworkPolicy};

/// Exit code for a command rejected before spawn by the argument check.
pub const EXIT_POLICY_DENIED: i32 = 77;
/// The program exists but could not be started.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;
pub const EXIT_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub user_time_ms: u64,
    pub system_time_ms: u64,
    /// Peak resident set size in KiB.
    pub max_rss_kb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Exited on its own (any exit code, or a signal it raised itself).
    Completed,
    TimedOut,
    /// Killed by the kernel for exceeding a resource limit.
    ResourceLimit,
    SpawnFailed,
    PolicyDenied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    /// Process exit code, `128 + signal` when killed by a signal, or one of
    /// the synthetic codes above.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Forcibly terminated by the watchdog or an OS resource limit.
    pub killed: bool,
    pub timed_out: bool,
    pub signal: Option<i32>,
    pub execution_time: Duration,
    pub outcome: ExecutionOutcome,
    pub resource_usage: Option<ResourceUsage>,
    pub output_truncated: bool,
    /// `false` when the sandbox was switched off for this run.
    pub sandboxed: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.outcome == ExecutionOutcome::Completed && self.exit_code == 0
    }

    fn synthetic(
        execution_id: Uuid,
        exit_code: i32,
        stderr: String,
        outcome: ExecutionOutcome,
        started: Instant,
        sandboxed: bool,
    ) -> Self {
        Self {
            execution_id,
            exit_code,
            stdout: String::new(),
            stderr,
            killed: false,
            timed_out: false,
            signal: None,
            execution_time: started.elapsed(),
            outcome,
            resource_usage: None,
            output_truncated: false,
            sandboxed,
        }
    }
}

/// The process-wide sinks every manager reports to.
#[derive(Debug, Clone)]
pub struct SecurityServices {
    pub monitor: Arc<SecurityMonitor>,
    pub audit: Arc<AuditLogger>,
}

impl SecurityServices {
    pub fn new(monitor: Arc<SecurityMonitor>, audit: Arc<AuditLogger>) -> Self {
        Self { monitor, audit }
    }
}

/// Orchestrates sandboxed execution and mediated access checks.
///
/// Cheap to clone; clones share the config, the compiled filter and the
/// security sinks. Holds no per-execution state, so concurrent calls do
/// not contend on anything but the sinks.
#[derive(Debug, Clone)]
pub struct SandboxManager {
    config: Arc<SandboxConfig>,
    workspace: PathBuf,
    services: SecurityServices,
    filter: Option<Arc<PreparedFilter>>,
    filesystem: Option<Arc<FileSystemAccessControl>>,
    network: Option<Arc<NetworkAccessControl>>,
}

impl SandboxManager {
    /// The syscall filter is compiled once here. If filtering is requested
    /// but unavailable at runtime a single FILTER_UNAVAILABLE event is
    /// raised and commands run under resource limits only.
    pub fn new(config: SandboxConfig, workspace: impl Into<PathBuf>, services: SecurityServices) -> Self {
        let workspace = workspace.into();
        let filter = if config.enabled() {
            prepare_filter(&config, &services.monitor)
        } else {
            None
        };
        Self {
            config: Arc::new(config),
            workspace,
            services,
            filter,
            filesystem: None,
            network: None,
        }
    }

    /// Also enables the argument pre-flight check in [`execute`](Self::execute).
    pub fn with_filesystem_policy(mut self, access: FileSystemAccessControl) -> Self {
        self.filesystem = Some(Arc::new(access));
        self
    }

    pub fn with_network_policy(mut self, access: NetworkAccessControl) -> Self {
        self.network = Some(Arc::new(access));
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn services(&self) -> &SecurityServices {
        &self.services
    }

    /// True when the compiled syscall filter will be installed in children.
    pub fn filter_active(&self) -> bool {
        self.filter.as_ref().is_some_and(|f| !f.is_empty())
    }

    /// Run `command` (an argv list, never a shell string) to completion or
    /// timeout. Blocks the calling thread.
    pub fn execute<S: AsRef<str>>(&self, command: &[S]) -> ExecutionResult {
        let argv: Vec<String> = command.iter().map(|s| s.as_ref().to_string()).collect();
        let execution_id = Uuid::new_v4();
        let started = Instant::now();
        let sandboxed = self.config.enabled();

        let violations = self.preflight(&argv);
        let denied = !violations.is_empty() && self.config.mode() == EnforcementMode::Enforce;
        let result = if denied {
            let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
            ExecutionResult::synthetic(
                execution_id,
                EXIT_POLICY_DENIED,
                format!("warden: access to {} denied\n", paths.join(", ")),
                ExecutionOutcome::PolicyDenied,
                started,
                sandboxed,
            )
        } else {
            self.spawn(&argv, execution_id, started)
        };

        self.record_outcome(&argv, &result, &violations);
        self.audit_execution(&argv, &result, violations.iter().map(ToString::to_string).collect());
        result
    }

    /// [`execute`](Self::execute) on tokio's blocking pool.
    pub async fn execute_async<S: AsRef<str>>(&self, command: &[S]) -> ExecutionResult {
        let argv: Vec<String> = command.iter().map(|s| s.as_ref().to_string()).collect();
        let manager = self.clone();
        let task_argv = argv.clone();
        match tokio::task::spawn_blocking(move || manager.execute(&task_argv)).await {
            Ok(result) => result,
            Err(e) => {
                error!("execution task failed: {}", e);
                let result = ExecutionResult::synthetic(
                    Uuid::new_v4(),
                    EXIT_CANNOT_EXECUTE,
                    format!("warden: execution task failed: {e}"),
                    ExecutionOutcome::SpawnFailed,
                    Instant::now(),
                    self.config.enabled(),
                );
                self.audit_execution(&argv, &result, Vec::new());
                result
            }
        }
    }

    /// Mediated file access: evaluate, audit, and raise an event on denial.
    /// Returns whether the caller may go ahead (always `true` in warn mode).
    pub fn authorize_file_access(&self, path: impl AsRef<Path>, mode: AccessMode) -> bool {
        let path = path.as_ref();
        let decision = match &self.filesystem {
            Some(access) => access.evaluate(path, mode),
            None => match FileSystemPolicy::new(&self.workspace) {
                Ok(policy) => FileSystemAccessControl::new(policy).evaluate(path, mode),
                Err(e) => {
                    warn!("workspace {} unusable for access checks: {}", self.workspace.display(), e);
                    FsAccessDecision {
                        allowed: false,
                        resolved: None,
                        reason: Some(FsDenyReason::Unresolvable),
                    }
                }
            },
        };

        let reason = decision.reason.map(|r| r.as_str());
        let permitted = decision.allowed || self.config.mode() == EnforcementMode::Warn;
        if !decision.allowed {
            self.policy_event([
                ("kind", "file_access".to_string()),
                ("path", path.display().to_string()),
                ("operation", mode.to_string()),
                ("reason", reason.unwrap_or_default().to_string()),
            ]);
        }
        if let Err(e) = self.services.audit.log_file_access(path, mode, permitted, reason) {
            self.audit_failure(&e);
        }
        permitted
    }

    /// Mediated network access, like [`authorize_file_access`](Self::authorize_file_access).
    ///
    /// Without an attached policy the default [`NetworkPolicy`] (deny) applies.
    pub fn authorize_network_access(&self, host: &str, port: Option<u16>, protocol: &str) -> bool {
        let decision = match &self.network {
            Some(access) => access.evaluate(host),
            None => NetworkAccessControl::new(NetworkPolicy::default()).evaluate(host),
        };

        let reason = decision.reason.map(|r| r.as_str());
        let permitted = decision.allowed || self.config.mode() == EnforcementMode::Warn;
        if !decision.allowed {
            self.policy_event([
                ("kind", "network_access".to_string()),
                ("host", decision.host.clone()),
                ("port", port.map(|p| p.to_string()).unwrap_or_default()),
                ("protocol", protocol.to_string()),
                ("reason", reason.unwrap_or_default().to_string()),
            ]);
        }
        if let Err(e) = self
            .services
            .audit
            .log_network_access(&decision.host, port, protocol, permitted, reason)
        {
            self.audit_failure(&e);
        }
        permitted
    }

    /// Path-like arguments the filesystem policy would not let the command
    /// read. Empty when the sandbox is off or no policy is attached.
    fn preflight(&self, argv: &[String]) -> Vec<ArgumentViolation> {
        let Some(access) = self.filesystem.as_ref().filter(|_| self.config.enabled()) else {
            return Vec::new();
        };

        // argv[0] is the program itself and is resolved through PATH.
        argv.iter()
            .skip(1)
            .filter_map(|arg| path_argument(arg))
            .filter_map(|candidate| {
                let expanded = shellexpand::tilde(candidate);
                let decision = access.evaluate(Path::new(&*expanded), AccessMode::Read);
                (!decision.allowed).then(|| ArgumentViolation {
                    path: candidate.to_string(),
                    reason: decision.reason.map(|r| r.as_str()).unwrap_or("denied"),
                })
            })
            .collect()
    }

    fn spawn(&self, argv: &[String], execution_id: Uuid, started: Instant) -> ExecutionResult {
        let sandboxed = self.config.enabled();

        if !self.workspace.is_dir() {
            let msg = format!("warden: workspace {} is not a usable directory\n", self.workspace.display());
            return self.spawn_failed(argv, execution_id, EXIT_CANNOT_EXECUTE, msg, started);
        }

        let setup = sandboxed.then(|| ChildSetup {
            limits: ResourceLimits::from_config(&self.config),
            filter: self.filter.clone(),
        });
        if !sandboxed {
            warn!(command = ?argv, "sandbox disabled, running command without restrictions");
        }

        let spec = ChildSpec {
            argv,
            cwd: &self.workspace,
            timeout: self.config.timeout(),
            max_output_bytes: self.config.max_output_bytes(),
            setup,
        };

        match child::run(spec) {
            Ok(exit) => self.finish(exit, execution_id, started, sandboxed),
            Err(e) => {
                let program = argv.first().map(String::as_str).unwrap_or("");
                let (code, msg) = match e.kind() {
                    io::ErrorKind::NotFound => {
                        (EXIT_NOT_FOUND, format!("warden: {program}: command not found\n"))
                    }
                    io::ErrorKind::InvalidInput if argv.is_empty() => {
                        (EXIT_CANNOT_EXECUTE, "warden: empty command\n".to_string())
                    }
                    _ => (EXIT_CANNOT_EXECUTE, format!("warden: {program}: {e}\n")),
                };
                self.spawn_failed(argv, execution_id, code, msg, started)
            }
        }
    }

    fn spawn_failed(
        &self,
        argv: &[String],
        execution_id: Uuid,
        exit_code: i32,
        stderr: String,
        started: Instant,
    ) -> ExecutionResult {
        debug!(command = ?argv, error = stderr.trim_end(), "spawn failed");
        ExecutionResult::synthetic(
            execution_id,
            exit_code,
            stderr,
            ExecutionOutcome::SpawnFailed,
            started,
            self.config.enabled(),
        )
    }

    fn finish(&self, exit: ChildExit, execution_id: Uuid, started: Instant, sandboxed: bool) -> ExecutionResult {
        let limit_kill = exit.signal.is_some_and(is_resource_limit_signal);
        let outcome = if exit.timed_out {
            ExecutionOutcome::TimedOut
        } else if limit_kill {
            ExecutionOutcome::ResourceLimit
        } else {
            ExecutionOutcome::Completed
        };
        let exit_code = match (exit.code, exit.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        };

        debug!(
            pid = exit.pid,
            exit_code,
            signal = ?exit.signal,
            timed_out = exit.timed_out,
            "child finished"
        );

        ExecutionResult {
            execution_id,
            exit_code,
            stdout: String::from_utf8_lossy(&exit.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&exit.stderr).into_owned(),
            killed: exit.timed_out || limit_kill,
            timed_out: exit.timed_out,
            signal: exit.signal,
            execution_time: started.elapsed(),
            outcome,
            resource_usage: exit.usage.map(|u| ResourceUsage {
                user_time_ms: u.user_time_ms,
                system_time_ms: u.system_time_ms,
                max_rss_kb: u.max_rss_kb,
            }),
            output_truncated: exit.output_truncated,
            sandboxed,
        }
    }

    /// Raise the one monitor event an execution warrants, if any. Argument
    /// violations go into the details of whichever event that is; on their
    /// own they raise a POLICY_WARNING.
    fn record_outcome(&self, argv: &[String], result: &ExecutionResult, violations: &[ArgumentViolation]) {
        let (event_type, severity) = match result.outcome {
            ExecutionOutcome::TimedOut => (SecurityEventType::Timeout, Severity::Warning),
            ExecutionOutcome::ResourceLimit => (SecurityEventType::ProcessKilled, Severity::Error),
            ExecutionOutcome::SpawnFailed => (SecurityEventType::SpawnFailed, Severity::Warning),
            ExecutionOutcome::PolicyDenied => (SecurityEventType::PolicyDenied, Severity::Warning),
            ExecutionOutcome::Completed if !violations.is_empty() => {
                (SecurityEventType::PolicyWarning, Severity::Info)
            }
            ExecutionOutcome::Completed => return,
        };
        let mut details = vec![
            ("execution_id", result.execution_id.to_string()),
            ("command", argv.join(" ")),
            ("elapsed_ms", result.execution_time.as_millis().to_string()),
        ];
        if result.timed_out {
            details.push(("timeout_secs", self.config.timeout().as_secs_f64().to_string()));
        }
        if let Some(sig) = result.signal {
            details.push(("signal", sig.to_string()));
        }
        if result.outcome == ExecutionOutcome::SpawnFailed {
            details.push(("error", result.stderr.trim_end().to_string()));
        }
        if !violations.is_empty() {
            let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
            let listed: Vec<String> = violations.iter().map(ToString::to_string).collect();
            details.push(("paths", paths.join(", ")));
            details.push(("policy_violations", listed.join("; ")));
        }
        self.services.monitor.record_event(event_type, severity, details);
    }

    fn audit_execution(&self, argv: &[String], result: &ExecutionResult, policy_violations: Vec<String>) {
        let record = ExecutionRecord {
            execution_id: result.execution_id,
            command: argv.to_vec(),
            workspace: self.workspace.clone(),
            sandboxed: result.sandboxed,
            mode: self.config.mode(),
            profile: result.sandboxed.then(|| self.config.syscall_profile()),
            outcome: result.outcome,
            exit_code: result.exit_code,
            killed: result.killed,
            timed_out: result.timed_out,
            signal: result.signal,
            duration_ms: u64::try_from(result.execution_time.as_millis()).unwrap_or(u64::MAX),
            resource_usage: result.resource_usage,
            policy_violations,
        };
        match self.services.audit.log_sandbox_execution(record) {
            Ok(_) => info!(
                execution_id = %result.execution_id,
                exit_code = result.exit_code,
                outcome = ?result.outcome,
                "execution audited"
            ),
            Err(e) => self.audit_failure(&e),
        }
    }

    fn policy_event<const N: usize>(&self, details: [(&str, String); N]) {
        let (event_type, severity) = match self.config.mode() {
            EnforcementMode::Enforce => (SecurityEventType::PolicyDenied, Severity::Warning),
            EnforcementMode::Warn => (SecurityEventType::PolicyWarning, Severity::Info),
        };
        self.services.monitor.record_event(event_type, severity, details);
    }

    fn audit_failure(&self, e: &AuditError) {
        error!("failed to write audit entry: {}", e);
        self.services.monitor.record_event(
            SecurityEventType::AuditFailure,
            Severity::Critical,
            [("error", e.to_string())],
        );
    }
}

/// An argument the filesystem policy would not let the command read.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArgumentViolation {
    path: String,
    reason: &'static str,
}

impl fmt::Display for ArgumentViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

fn prepare_filter(config: &SandboxConfig, monitor: &SecurityMonitor) -> Option<Arc<PreparedFilter>> {
    let filter = SyscallFilter::from_config(config);
    match filter.prepare() {
        Ok(prepared) => {
            debug!(
                profile = %filter.policy().profile(),
                mode = %filter.mode(),
                allowed = filter.policy().len(),
                "syscall filter compiled"
            );
            Some(Arc::new(prepared))
        }
        Err(FilterError::UnsupportedPlatform) => {
            debug!("syscall filtering not supported on this platform; relying on resource limits");
            None
        }
        Err(e) => {
            warn!("syscall filtering unavailable: {}", e);
            monitor.record_event(
                SecurityEventType::FilterUnavailable,
                Severity::Info,
                [("error", e.to_string())],
            );
            None
        }
    }
}

/// Signals the kernel sends for RLIMIT_CPU / RLIMIT_FSIZE breaches, plus
/// the SIGKILL that follows the CPU soft limit or an OOM kill.
fn is_resource_limit_signal(sig: i32) -> bool {
    #[cfg(unix)]
    {
        sig == libc::SIGKILL || sig == libc::SIGXCPU || sig == libc::SIGXFSZ
    }
    #[cfg(not(unix))]
    {
        let _ = sig;
        false
    }
}

/// The path part of `arg` if it looks like one, including `--opt=/path`.
fn path_argument(arg: &str) -> Option<&str> {
    let candidate = match arg.split_once('=') {
        Some((flag, value)) if flag.starts_with('-') => value,
        _ => arg,
    };
    let looks_like_path = candidate.starts_with('/')
        || candidate.starts_with("./")
        || candidate.starts_with("../")
        || candidate.starts_with("~/")
        || candidate == ".."
        || candidate == "~"
        || candidate.contains("/../");
    looks_like_path.then_some(candidate)
}
