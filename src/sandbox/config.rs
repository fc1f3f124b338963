use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::profile::{SyscallProfile, is_known_syscall};
use crate::error::{ConfigError, ConfigResult};

/// What happens when a policy check fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Record the violation, let the action proceed.
    Warn,
    /// Record the violation and stop the action.
    #[default]
    Enforce,
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcementMode::Warn => f.write_str("warn"),
            EnforcementMode::Enforce => f.write_str("enforce"),
        }
    }
}

impl FromStr for EnforcementMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(EnforcementMode::Warn),
            "enforce" => Ok(EnforcementMode::Enforce),
            other => Err(ConfigError::InvalidConfig(format!(
                "unknown mode '{}' (expected warn or enforce)",
                other
            ))),
        }
    }
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_048_576;

/// Immutable, validated settings for one or more sandboxed executions.
///
/// Construct through [`SandboxConfig::builder`]; every invalid value is
/// rejected there, so a `SandboxConfig` in hand is always usable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxConfig {
    enabled: bool,
    mode: EnforcementMode,
    timeout: Duration,
    cpu_time_limit: Option<Duration>,
    memory_limit_mb: Option<u64>,
    syscall_profile: SyscallProfile,
    custom_allowed_syscalls: Vec<String>,
    custom_denied_syscalls: Vec<String>,
    max_output_bytes: usize,
    max_processes: Option<u64>,
    max_file_size_bytes: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: EnforcementMode::Enforce,
            timeout: DEFAULT_TIMEOUT,
            cpu_time_limit: None,
            memory_limit_mb: None,
            syscall_profile: SyscallProfile::default(),
            custom_allowed_syscalls: Vec::new(),
            custom_denied_syscalls: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_processes: None,
            max_file_size_bytes: None,
        }
    }
}

impl SandboxConfig {
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// A pass-through configuration: no filter, no ceilings, timeout only.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cpu_time_limit(&self) -> Option<Duration> {
        self.cpu_time_limit
    }

    pub fn memory_limit_mb(&self) -> Option<u64> {
        self.memory_limit_mb
    }

    pub fn syscall_profile(&self) -> SyscallProfile {
        self.syscall_profile
    }

    pub fn custom_allowed_syscalls(&self) -> &[String] {
        &self.custom_allowed_syscalls
    }

    pub fn custom_denied_syscalls(&self) -> &[String] {
        &self.custom_denied_syscalls
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    pub fn max_processes(&self) -> Option<u64> {
        self.max_processes
    }

    pub fn max_file_size_bytes(&self) -> Option<u64> {
        self.max_file_size_bytes
    }
}

/// Builder for [`SandboxConfig`]. Values are checked in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct SandboxConfigBuilder {
    enabled: bool,
    mode: EnforcementMode,
    timeout_secs: f64,
    cpu_time_limit_secs: Option<f64>,
    memory_limit_mb: Option<u64>,
    syscall_profile: SyscallProfile,
    custom_allowed_syscalls: Vec<String>,
    custom_denied_syscalls: Vec<String>,
    max_output_bytes: usize,
    max_processes: Option<u64>,
    max_file_size_bytes: Option<u64>,
}

impl Default for SandboxConfigBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: EnforcementMode::default(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs_f64(),
            cpu_time_limit_secs: None,
            memory_limit_mb: None,
            syscall_profile: SyscallProfile::default(),
            custom_allowed_syscalls: Vec::new(),
            custom_denied_syscalls: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_processes: None,
            max_file_size_bytes: None,
        }
    }
}

impl SandboxConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn mode(mut self, mode: EnforcementMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn cpu_time_limit_secs(mut self, secs: Option<f64>) -> Self {
        self.cpu_time_limit_secs = secs;
        self
    }

    pub fn memory_limit_mb(mut self, mb: Option<u64>) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn syscall_profile(mut self, profile: SyscallProfile) -> Self {
        self.syscall_profile = profile;
        self
    }

    pub fn allow_syscalls<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom_allowed_syscalls
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn deny_syscalls<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom_denied_syscalls
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn max_processes(mut self, n: Option<u64>) -> Self {
        self.max_processes = n;
        self
    }

    pub fn max_file_size_bytes(mut self, bytes: Option<u64>) -> Self {
        self.max_file_size_bytes = bytes;
        self
    }

    pub fn build(self) -> ConfigResult<SandboxConfig> {
        let timeout = positive_duration("timeout", self.timeout_secs)?;

        let cpu_time_limit = self
            .cpu_time_limit_secs
            .map(|secs| positive_duration("cpu_time_limit", secs))
            .transpose()?;

        if self.memory_limit_mb == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "memory_limit_mb must be greater than zero".to_string(),
            ));
        }
        if self.max_processes == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_processes must be greater than zero".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }

        let custom_allowed_syscalls = normalize_syscalls(self.custom_allowed_syscalls)?;
        let custom_denied_syscalls = normalize_syscalls(self.custom_denied_syscalls)?;

        Ok(SandboxConfig {
            enabled: self.enabled,
            mode: self.mode,
            timeout,
            cpu_time_limit,
            memory_limit_mb: self.memory_limit_mb,
            syscall_profile: self.syscall_profile,
            custom_allowed_syscalls,
            custom_denied_syscalls,
            max_output_bytes: self.max_output_bytes,
            max_processes: self.max_processes,
            max_file_size_bytes: self.max_file_size_bytes,
        })
    }
}

fn positive_duration(field: &str, secs: f64) -> ConfigResult<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidConfig(format!(
            "{} must be a positive number of seconds, got {}",
            field, secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ConfigError::InvalidConfig(format!("{}: {}", field, e)))
}

fn normalize_syscalls(names: Vec<String>) -> ConfigResult<Vec<String>> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim().to_ascii_lowercase();
        if !is_known_syscall(&name) {
            return Err(ConfigError::UnknownSyscall(name));
        }
        if !out.contains(&name) {
            out.push(name);
        }
    }
    Ok(out)
}
