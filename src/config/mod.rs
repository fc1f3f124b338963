//! On-disk configuration (`config.toml`).
//!
//! The file holds plain values; conversion into the core types goes through
//! their validating constructors, so an invalid value is reported as a
//! [`ConfigError`] at load time rather than clamped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigResult;
use crate::paths::Paths;
use crate::sandbox::{DEFAULT_MAX_OUTPUT_BYTES, EnforcementMode, SandboxConfig, SyscallProfile};
use crate::security::{
    AuditLogger, DEFAULT_MAX_EVENTS, FileSystemPolicy, NetworkPolicy, SecurityMonitor,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Option<Paths>,

    #[serde(default)]
    pub sandbox: SandboxSettings,

    #[serde(default)]
    pub filesystem: FilesystemSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub audit: AuditSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// `false` runs commands unrestricted (still audited)
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub mode: EnforcementMode,

    /// Wall-clock limit, fractional seconds allowed
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    #[serde(default)]
    pub cpu_time_limit_secs: Option<f64>,

    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    #[serde(default)]
    pub profile: SyscallProfile,

    #[serde(default)]
    pub allow_syscalls: Vec<String>,

    #[serde(default)]
    pub deny_syscalls: Vec<String>,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default)]
    pub max_processes: Option<u64>,

    #[serde(default)]
    pub max_file_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemSettings {
    /// Overrides the resolved workspace directory
    #[serde(default)]
    pub workspace: Option<String>,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub allow_paths: Vec<String>,

    #[serde(default)]
    pub deny_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default)]
    pub default_allow: bool,

    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    #[serde(default)]
    pub denied_hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Defaults to state_dir/audit.jsonl
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Events kept in memory; 0 keeps everything
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> f64 {
    120.0
}
fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}
fn default_max_events() -> usize {
    DEFAULT_MAX_EVENTS
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            mode: EnforcementMode::default(),
            timeout_secs: default_timeout_secs(),
            cpu_time_limit_secs: None,
            memory_limit_mb: None,
            profile: SyscallProfile::default(),
            allow_syscalls: Vec::new(),
            deny_syscalls: Vec::new(),
            max_output_bytes: default_max_output_bytes(),
            max_processes: None,
            max_file_size_bytes: None,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load `config.toml` from the resolved config dir, creating it from
    /// the commented template on first run.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            save_template(&path)?;
            return Ok(Config {
                paths: Some(paths),
                ..Config::default()
            });
        }

        Self::load_from(&path, paths)
    }

    /// Load an explicit config file. A missing file is an error here.
    pub fn load_from(path: &Path, paths: Paths) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config.paths = Some(paths);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        // Surface value errors now rather than at first use.
        config.sandbox_config()?;
        config.network_policy()?;
        Ok(config)
    }

    fn paths(&self) -> Result<Paths> {
        match &self.paths {
            Some(paths) => Ok(paths.clone()),
            None => Paths::resolve(),
        }
    }

    pub fn sandbox_config(&self) -> ConfigResult<SandboxConfig> {
        let s = &self.sandbox;
        SandboxConfig::builder()
            .enabled(s.enabled)
            .mode(s.mode)
            .timeout_secs(s.timeout_secs)
            .cpu_time_limit_secs(s.cpu_time_limit_secs)
            .memory_limit_mb(s.memory_limit_mb)
            .syscall_profile(s.profile)
            .allow_syscalls(s.allow_syscalls.iter())
            .deny_syscalls(s.deny_syscalls.iter())
            .max_output_bytes(s.max_output_bytes)
            .max_processes(s.max_processes)
            .max_file_size_bytes(s.max_file_size_bytes)
            .build()
    }

    /// `[filesystem].workspace` (with `~` expanded), else the resolved
    /// default (WARDEN_WORKSPACE or data_dir/workspace).
    pub fn workspace(&self) -> Result<PathBuf> {
        if let Some(ws) = self.filesystem.workspace.as_deref().map(str::trim)
            && !ws.is_empty()
        {
            return Ok(expand_path(ws));
        }
        Ok(self.paths()?.workspace)
    }

    /// Requires the workspace to exist.
    pub fn filesystem_policy(&self) -> Result<FileSystemPolicy> {
        let fs_settings = &self.filesystem;
        let mut policy = FileSystemPolicy::new(self.workspace()?)?.read_only(fs_settings.read_only);
        for path in &fs_settings.allow_paths {
            policy = policy.allow_path(expand_path(path));
        }
        for path in &fs_settings.deny_paths {
            policy = policy.deny_path(expand_path(path));
        }
        Ok(policy)
    }

    pub fn network_policy(&self) -> ConfigResult<NetworkPolicy> {
        let n = &self.network;
        NetworkPolicy::new(n.default_allow, &n.allowed_hosts, &n.denied_hosts)
    }

    pub fn audit_path(&self) -> Result<PathBuf> {
        match self.audit.path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => Ok(expand_path(p)),
            _ => Ok(self.paths()?.audit_log()),
        }
    }

    pub fn open_audit_logger(&self) -> Result<AuditLogger> {
        let path = self.audit_path()?;
        AuditLogger::open(&path)
            .with_context(|| format!("Failed to open audit log: {}", path.display()))
    }

    pub fn security_monitor(&self) -> SecurityMonitor {
        match self.monitor.max_events {
            0 => SecurityMonitor::unbounded(),
            n => SecurityMonitor::with_capacity(n),
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Paths::resolve()?.config_file())
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Write the commented default config (first-time setup).
pub fn save_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    eprintln!("Created default config at {}", path.display());
    Ok(())
}

/// Default config template with comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# warden configuration
# Auto-created on first run. Edit as needed.

[sandbox]
enabled = true
mode = "enforce"                  # enforce | warn
timeout_secs = 120
# cpu_time_limit_secs = 30
# memory_limit_mb = 512
profile = "moderate"              # strict | moderate | permissive
# allow_syscalls = []             # added to the profile (never re-admits always-denied calls)
# deny_syscalls = []              # removed from the profile
max_output_bytes = 1048576
# max_processes = 64
# max_file_size_bytes = 52428800

[filesystem]
# Directory commands run in. Default: XDG data dir (~/.local/share/warden/workspace)
# or WARDEN_WORKSPACE.
# workspace = "~/projects/sandbox"
read_only = false
# allow_paths = ["/data/datasets"]
# deny_paths = ["secrets"]

[network]
default_allow = false
# allowed_hosts = ["api.github.com", "*.crates.io"]
# denied_hosts = []

[audit]
# Default: XDG state dir (~/.local/state/warden/audit.jsonl)
# path = "~/.local/state/warden/audit.jsonl"

[monitor]
max_events = 10000                # 0 = unbounded

[logging]
level = "info"
format = "text"                   # text | json
"#;
