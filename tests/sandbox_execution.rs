#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use warden::sandbox::{
    EXIT_CANNOT_EXECUTE, EXIT_NOT_FOUND, EXIT_POLICY_DENIED, EnforcementMode, ExecutionOutcome,
    SandboxConfig, SandboxManager, SecurityServices, SyscallProfile,
};
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
use warden::sandbox::{FilterCapability, probe_syscall_filtering};
use warden::security::{
    AuditLogger, AuditRecord, FileSystemAccessControl, FileSystemPolicy, SecurityEventType,
    SecurityMonitor,
};

struct Harness {
    _state: TempDir,
    workspace: TempDir,
    monitor: Arc<SecurityMonitor>,
    audit: Arc<AuditLogger>,
}

impl Harness {
    fn new() -> Self {
        let state = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLogger::in_state_dir(state.path()).unwrap());
        Self {
            _state: state,
            workspace: tempfile::tempdir().unwrap(),
            monitor: Arc::new(SecurityMonitor::new()),
            audit,
        }
    }

    fn services(&self) -> SecurityServices {
        SecurityServices::new(Arc::clone(&self.monitor), Arc::clone(&self.audit))
    }

    fn manager(&self, config: SandboxConfig) -> SandboxManager {
        SandboxManager::new(config, self.workspace.path(), self.services())
    }

    fn events(&self, event_type: SecurityEventType) -> usize {
        self.monitor.events_of_type(event_type).len()
    }

    fn executions(&self) -> Vec<warden::security::ExecutionRecord> {
        self.audit
            .read_all_entries()
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.record {
                AuditRecord::Execution(exec) => Some(exec),
                _ => None,
            })
            .collect()
    }
}

fn permissive() -> SandboxConfig {
    SandboxConfig::builder()
        .syscall_profile(SyscallProfile::Permissive)
        .timeout_secs(20.0)
        .build()
        .unwrap()
}

#[test]
fn echo_under_default_profile() {
    let h = Harness::new();
    let manager = h.manager(SandboxConfig::default());

    let result = manager.execute(&["sh", "-c", "echo hello"]);
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "hello\n");
    assert!(!result.killed);
    assert!(result.sandboxed);
    assert_eq!(result.outcome, ExecutionOutcome::Completed);
    assert!(result.success());
}

#[test]
fn exit_code_and_stderr_are_reported() {
    let h = Harness::new();
    let manager = h.manager(permissive());

    let result = manager.execute(&["sh", "-c", "echo oops >&2; exit 3"]);
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stderr, "oops\n");
    assert!(!result.killed);
    assert!(h.monitor.is_empty());

    let execs = h.executions();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].exit_code, 3);
    assert_eq!(execs[0].execution_id, result.execution_id);
    assert_eq!(execs[0].command, vec!["sh", "-c", "echo oops >&2; exit 3"]);
}

#[test]
fn command_runs_in_workspace() {
    let h = Harness::new();
    std::fs::write(h.workspace.path().join("notes.txt"), "inside").unwrap();
    let manager = h.manager(permissive());

    let result = manager.execute(&["cat", "notes.txt"]);
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "inside");
}

#[test]
fn timeout_kills_within_bounds() {
    let h = Harness::new();
    let config = SandboxConfig::builder()
        .syscall_profile(SyscallProfile::Permissive)
        .timeout_secs(2.0)
        .build()
        .unwrap();
    let manager = h.manager(config);

    let start = Instant::now();
    let result = manager.execute(&["sleep", "10"]);
    let elapsed = start.elapsed();

    assert!(result.killed);
    assert!(result.timed_out);
    assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
    assert_ne!(result.exit_code, 0);
    assert!(elapsed >= Duration::from_millis(1900), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "elapsed {:?}", elapsed);

    assert_eq!(h.events(SecurityEventType::Timeout), 1);
    assert_eq!(h.events(SecurityEventType::ProcessKilled), 0);
    let event = &h.monitor.events_of_type(SecurityEventType::Timeout)[0];
    assert_eq!(event.details["execution_id"], result.execution_id.to_string());

    let execs = h.executions();
    assert_eq!(execs.len(), 1);
    assert!(execs[0].timed_out);
    assert!(execs[0].killed);
}

#[test]
fn timeout_takes_down_grandchildren() {
    let h = Harness::new();
    let config = SandboxConfig::builder()
        .syscall_profile(SyscallProfile::Permissive)
        .timeout_secs(1.0)
        .build()
        .unwrap();
    let manager = h.manager(config);

    let result = manager.execute(&["sh", "-c", "(sleep 3; touch orphan-survived) & sleep 30"]);
    assert!(result.timed_out);

    std::thread::sleep(Duration::from_secs(4));
    assert!(!h.workspace.path().join("orphan-survived").exists());
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
fn seccomp_available() -> bool {
    match probe_syscall_filtering() {
        FilterCapability::Supported => true,
        other => {
            eprintln!("skipping: syscall filtering {}", other);
            false
        }
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
#[test]
fn new_session_cannot_outlive_timeout() {
    if !seccomp_available() {
        return;
    }
    let h = Harness::new();
    let config = SandboxConfig::builder().timeout_secs(1.0).build().unwrap();
    let manager = h.manager(config);
    assert!(manager.filter_active());

    let result = manager.execute(&[
        "sh",
        "-c",
        "setsid sh -c 'sleep 2; echo x > escaped' </dev/null >/dev/null 2>&1 & sleep 30",
    ]);
    assert!(result.timed_out);

    std::thread::sleep(Duration::from_secs(3));
    assert!(!h.workspace.path().join("escaped").exists());
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
#[test]
fn new_session_cannot_outlive_leader_exit() {
    if !seccomp_available() {
        return;
    }
    let h = Harness::new();
    let manager = h.manager(SandboxConfig::default());

    let result = manager.execute(&[
        "sh",
        "-c",
        "setsid sh -c 'sleep 2; echo x > escaped' </dev/null >/dev/null 2>&1 &",
    ]);
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);

    std::thread::sleep(Duration::from_secs(3));
    assert!(!h.workspace.path().join("escaped").exists());
}

#[test]
fn cpu_limit_surfaces_as_kill() {
    let h = Harness::new();
    let config = SandboxConfig::builder()
        .syscall_profile(SyscallProfile::Permissive)
        .timeout_secs(30.0)
        .cpu_time_limit_secs(Some(1.0))
        .build()
        .unwrap();
    let manager = h.manager(config);

    let result = manager.execute(&["sh", "-c", "while :; do :; done"]);
    assert!(result.killed, "result: {:?}", result);
    assert!(!result.timed_out);
    assert_eq!(result.outcome, ExecutionOutcome::ResourceLimit);
    assert!(result.signal.is_some());
    assert_eq!(h.events(SecurityEventType::ProcessKilled), 1);
    assert_eq!(h.events(SecurityEventType::Timeout), 0);
}

#[test]
fn disabled_sandbox_passes_through_and_is_marked() {
    let h = Harness::new();
    let manager = h.manager(SandboxConfig::disabled());

    let result = manager.execute(&["echo", "hi"]);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hi\n");
    assert!(!result.sandboxed);

    let execs = h.executions();
    assert_eq!(execs.len(), 1);
    assert!(!execs[0].sandboxed);
    assert!(execs[0].profile.is_none());
    assert_eq!(h.audit.get_statistics().unwrap().unsandboxed_executions, 1);
}

#[test]
fn missing_program_is_a_result_not_a_crash() {
    let h = Harness::new();
    let manager = h.manager(permissive());

    let result = manager.execute(&["warden-no-such-program-xyz", "--flag"]);
    assert_eq!(result.exit_code, EXIT_NOT_FOUND);
    assert!(!result.stderr.is_empty());
    assert_eq!(result.outcome, ExecutionOutcome::SpawnFailed);
    assert_eq!(h.events(SecurityEventType::SpawnFailed), 1);
    assert_eq!(h.executions().len(), 1);
}

#[test]
fn unusable_workspace_is_a_result() {
    let h = Harness::new();
    let manager = SandboxManager::new(permissive(), "/definitely/not/a/workspace", h.services());

    let result = manager.execute(&["true"]);
    assert_eq!(result.exit_code, EXIT_CANNOT_EXECUTE);
    assert!(result.stderr.contains("workspace"));
    assert_eq!(h.executions().len(), 1);
}

#[test]
fn empty_command_is_a_result() {
    let h = Harness::new();
    let manager = h.manager(permissive());

    let result = manager.execute::<&str>(&[]);
    assert_ne!(result.exit_code, 0);
    assert_eq!(result.outcome, ExecutionOutcome::SpawnFailed);
    assert_eq!(h.executions().len(), 1);
}

#[test]
fn output_is_capped() {
    let h = Harness::new();
    let config = SandboxConfig::builder()
        .syscall_profile(SyscallProfile::Permissive)
        .max_output_bytes(100)
        .build()
        .unwrap();
    let manager = h.manager(config);

    let result = manager.execute(&["sh", "-c", "yes | head -n 1000"]);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.len(), 100);
    assert!(result.output_truncated);
}

#[test]
fn resource_usage_is_recorded() {
    let h = Harness::new();
    let manager = h.manager(permissive());

    let result = manager.execute(&["true"]);
    assert!(result.resource_usage.is_some());
    assert_eq!(h.executions()[0].resource_usage, result.resource_usage);
}

fn with_fs_policy(h: &Harness, mode: EnforcementMode) -> SandboxManager {
    let config = SandboxConfig::builder()
        .syscall_profile(SyscallProfile::Permissive)
        .mode(mode)
        .build()
        .unwrap();
    let policy = FileSystemPolicy::new(h.workspace.path()).unwrap();
    h.manager(config)
        .with_filesystem_policy(FileSystemAccessControl::new(policy))
}

#[test]
fn preflight_rejects_outside_path_in_enforce_mode() {
    let h = Harness::new();
    let manager = with_fs_policy(&h, EnforcementMode::Enforce);

    let result = manager.execute(&["cat", "/etc/passwd"]);
    assert_eq!(result.exit_code, EXIT_POLICY_DENIED);
    assert_eq!(result.outcome, ExecutionOutcome::PolicyDenied);
    assert!(result.stdout.is_empty());
    assert_eq!(h.events(SecurityEventType::PolicyDenied), 1);

    let execs = h.executions();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].exit_code, EXIT_POLICY_DENIED);
    assert_eq!(execs[0].policy_violations.len(), 1);
}

#[test]
fn preflight_catches_traversal() {
    let h = Harness::new();
    let manager = with_fs_policy(&h, EnforcementMode::Enforce);

    let result = manager.execute(&["cat", "sub/../../escape.txt"]);
    assert_eq!(result.exit_code, EXIT_POLICY_DENIED);
}

#[test]
fn preflight_allows_workspace_paths() {
    let h = Harness::new();
    std::fs::write(h.workspace.path().join("in.txt"), "ok").unwrap();
    let manager = with_fs_policy(&h, EnforcementMode::Enforce);

    let result = manager.execute(&["cat", "./in.txt"]);
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "ok");
    assert!(h.monitor.is_empty());
}

#[test]
fn preflight_warns_and_proceeds_in_warn_mode() {
    let h = Harness::new();
    let manager = with_fs_policy(&h, EnforcementMode::Warn);

    let result = manager.execute(&["ls", "/"]);
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(h.events(SecurityEventType::PolicyWarning), 1);
    assert_eq!(h.events(SecurityEventType::PolicyDenied), 0);

    let execs = h.executions();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].policy_violations.len(), 1);
}

#[test]
fn several_warn_mode_violations_raise_one_event() {
    let h = Harness::new();
    let manager = with_fs_policy(&h, EnforcementMode::Warn);

    let before = h.monitor.len();
    let result = manager.execute(&["sh", "-c", "exit 0", "/usr/lib", "/var/lib"]);
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(h.monitor.len() - before, 1);

    let event = &h.monitor.events_of_type(SecurityEventType::PolicyWarning)[0];
    assert_eq!(event.details["paths"], "/usr/lib, /var/lib");
    assert_eq!(event.details["execution_id"], result.execution_id.to_string());
    assert_eq!(h.executions()[0].policy_violations.len(), 2);
}

#[test]
fn warn_mode_violations_fold_into_timeout_event() {
    let h = Harness::new();
    let config = SandboxConfig::builder()
        .syscall_profile(SyscallProfile::Permissive)
        .mode(EnforcementMode::Warn)
        .timeout_secs(1.0)
        .build()
        .unwrap();
    let policy = FileSystemPolicy::new(h.workspace.path()).unwrap();
    let manager = h
        .manager(config)
        .with_filesystem_policy(FileSystemAccessControl::new(policy));

    let before = h.monitor.len();
    let result = manager.execute(&["sh", "-c", "sleep 5", "/usr/lib", "/var/lib"]);
    assert!(result.timed_out);
    assert_eq!(h.monitor.len() - before, 1);
    assert_eq!(h.events(SecurityEventType::PolicyWarning), 0);

    let event = &h.monitor.events_of_type(SecurityEventType::Timeout)[0];
    assert_eq!(event.details["paths"], "/usr/lib, /var/lib");
    assert!(event.details["policy_violations"].contains("/var/lib"));
}

#[test]
fn several_enforce_mode_violations_raise_one_denial() {
    let h = Harness::new();
    let manager = with_fs_policy(&h, EnforcementMode::Enforce);

    let result = manager.execute(&["cat", "/etc/passwd", "/etc/group"]);
    assert_eq!(result.exit_code, EXIT_POLICY_DENIED);
    assert!(result.stderr.contains("/etc/passwd"));
    assert!(result.stderr.contains("/etc/group"));
    assert_eq!(h.monitor.len(), 1);
    assert_eq!(h.events(SecurityEventType::PolicyDenied), 1);
    assert_eq!(h.executions()[0].policy_violations.len(), 2);
}

#[test]
fn one_audit_entry_per_execution() {
    let h = Harness::new();
    let manager = h.manager(permissive());

    for cmd in [&["true"][..], &["false"][..], &["warden-missing-xyz"][..]] {
        manager.execute(cmd);
    }
    assert_eq!(h.executions().len(), 3);
    assert!(h.audit.verify_chain().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executions_are_all_audited() {
    let h = Harness::new();
    let manager = h.manager(permissive());

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .execute_async(&["sh", "-c", &format!("echo run-{}", i)])
                .await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, format!("run-{}\n", i));
    }

    assert_eq!(h.executions().len(), 8);
    assert!(h.audit.verify_chain().unwrap().is_empty());
}

#[test]
fn audit_file_lives_where_configured() {
    let h = Harness::new();
    let manager = h.manager(permissive());
    manager.execute(&["true"]);
    assert!(Path::new(h.audit.path()).exists());
}
