use std::sync::Arc;

use warden::sandbox::{EnforcementMode, SandboxConfig, SandboxManager, SecurityServices};
use warden::security::{
    AccessMode, AuditLogger, AuditRecord, FileSystemAccessControl, FileSystemPolicy,
    NetworkAccessControl, NetworkPolicy, SecurityEventType, SecurityMonitor,
};

struct Fixture {
    _state: tempfile::TempDir,
    workspace: tempfile::TempDir,
    monitor: Arc<SecurityMonitor>,
    audit: Arc<AuditLogger>,
}

impl Fixture {
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

    fn manager(&self, mode: EnforcementMode) -> SandboxManager {
        let config = SandboxConfig::builder().mode(mode).build().unwrap();
        let services = SecurityServices::new(Arc::clone(&self.monitor), Arc::clone(&self.audit));
        let fs_policy = FileSystemPolicy::new(self.workspace.path()).unwrap();
        let net_policy = NetworkPolicy::new(false, &["api.example.com", "*.crates.io"], &["evil.crates.io"]).unwrap();
        SandboxManager::new(config, self.workspace.path(), services)
            .with_filesystem_policy(FileSystemAccessControl::new(fs_policy))
            .with_network_policy(NetworkAccessControl::new(net_policy))
    }

    fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit
            .read_all_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.record)
            .collect()
    }
}

#[test]
fn file_access_inside_workspace_is_allowed_and_audited() {
    let f = Fixture::new();
    let manager = f.manager(EnforcementMode::Enforce);

    assert!(manager.authorize_file_access(f.workspace.path().join("out.txt"), AccessMode::Write));
    assert!(f.monitor.is_empty());

    let records = f.audit_records();
    assert_eq!(records.len(), 1);
    match &records[0] {
        AuditRecord::FileAccess(access) => {
            assert!(access.allowed);
            assert_eq!(access.operation, AccessMode::Write);
            assert!(access.reason.is_none());
        }
        other => panic!("unexpected record {:?}", other),
    }
}

#[test]
fn file_access_outside_workspace_denied_in_enforce_mode() {
    let f = Fixture::new();
    let manager = f.manager(EnforcementMode::Enforce);

    assert!(!manager.authorize_file_access("/etc/shadow", AccessMode::Read));
    assert_eq!(f.monitor.events_of_type(SecurityEventType::PolicyDenied).len(), 1);

    let stats = f.audit.get_statistics().unwrap();
    assert_eq!(stats.file_access_denied, 1);
    assert_eq!(stats.file_access_allowed, 0);
}

#[test]
fn traversal_is_denied() {
    let f = Fixture::new();
    let manager = f.manager(EnforcementMode::Enforce);

    let sneaky = f.workspace.path().join("a/../../outside.txt");
    assert!(!manager.authorize_file_access(sneaky, AccessMode::Read));
}

#[test]
fn file_access_denial_proceeds_in_warn_mode() {
    let f = Fixture::new();
    let manager = f.manager(EnforcementMode::Warn);

    assert!(manager.authorize_file_access("/etc/passwd", AccessMode::Read));
    assert_eq!(f.monitor.events_of_type(SecurityEventType::PolicyWarning).len(), 1);
    assert_eq!(f.monitor.events_of_type(SecurityEventType::PolicyDenied).len(), 0);

    match &f.audit_records()[0] {
        AuditRecord::FileAccess(access) => {
            assert!(access.allowed);
            assert_eq!(access.reason.as_deref(), Some("outside_workspace"));
        }
        other => panic!("unexpected record {:?}", other),
    }
}

#[test]
fn network_allow_list_and_wildcards() {
    let f = Fixture::new();
    let manager = f.manager(EnforcementMode::Enforce);

    assert!(manager.authorize_network_access("api.example.com", Some(443), "https"));
    assert!(manager.authorize_network_access("static.crates.io", Some(443), "https"));
    assert!(!manager.authorize_network_access("crates.io", Some(443), "https"));
    assert!(!manager.authorize_network_access("evil.crates.io", Some(443), "https"));
    assert!(!manager.authorize_network_access("other.org", None, "tcp"));

    let stats = f.audit.get_statistics().unwrap();
    assert_eq!(stats.network_access_allowed, 2);
    assert_eq!(stats.network_access_denied, 3);
    assert_eq!(f.monitor.events_of_type(SecurityEventType::PolicyDenied).len(), 3);
}

#[test]
fn internal_destinations_are_never_allowed() {
    let f = Fixture::new();
    let config = SandboxConfig::default();
    let services = SecurityServices::new(Arc::clone(&f.monitor), Arc::clone(&f.audit));
    let open = NetworkPolicy::new(true, &["localhost", "169.254.169.254"], &[] as &[&str]).unwrap();
    let manager = SandboxManager::new(config, f.workspace.path(), services)
        .with_network_policy(NetworkAccessControl::new(open));

    for host in ["169.254.169.254", "127.0.0.1", "localhost", "10.1.2.3", "[::1]", "metadata.google.internal"] {
        assert!(!manager.authorize_network_access(host, Some(80), "http"), "{} was allowed", host);
    }
    assert!(manager.authorize_network_access("example.org", Some(80), "http"));
}

#[test]
fn network_defaults_to_deny_without_policy() {
    let f = Fixture::new();
    let services = SecurityServices::new(Arc::clone(&f.monitor), Arc::clone(&f.audit));
    let manager = SandboxManager::new(SandboxConfig::default(), f.workspace.path(), services);

    assert!(!manager.authorize_network_access("example.org", Some(443), "https"));
    assert_eq!(f.audit_records().len(), 1);
}

#[test]
fn file_access_without_policy_uses_workspace_root() {
    let f = Fixture::new();
    let services = SecurityServices::new(Arc::clone(&f.monitor), Arc::clone(&f.audit));
    let manager = SandboxManager::new(SandboxConfig::default(), f.workspace.path(), services);

    assert!(manager.authorize_file_access(f.workspace.path().join("x"), AccessMode::Read));
    assert!(!manager.authorize_file_access("/etc/hostname", AccessMode::Read));
}
