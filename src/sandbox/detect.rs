use serde::Serialize;
use std::fmt;

/// Outcome of probing for kernel-level syscall filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FilterCapability {
    /// seccomp-bpf can be installed by this process.
    Supported,
    /// The OS family has no syscall filtering facility this crate can drive.
    UnsupportedPlatform,
    /// The platform has the facility but it is unavailable at runtime.
    CapabilityMissing(String),
}

impl FilterCapability {
    pub fn is_supported(&self) -> bool {
        matches!(self, FilterCapability::Supported)
    }
}

impl fmt::Display for FilterCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterCapability::Supported => f.write_str("supported"),
            FilterCapability::UnsupportedPlatform => f.write_str("unsupported platform"),
            FilterCapability::CapabilityMissing(reason) => write!(f, "unavailable ({})", reason),
        }
    }
}

/// Detected sandbox capabilities of the current platform.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxCapabilities {
    /// Kernel syscall filtering (seccomp-bpf, Linux only).
    pub syscall_filter: FilterCapability,

    /// Whether setrlimit-based CPU/memory ceilings are available.
    pub resource_limits: bool,

    /// Whether whole-tree termination via process groups is available.
    pub process_groups: bool,
}

/// Probe the current system for sandbox capabilities.
pub fn detect_capabilities() -> SandboxCapabilities {
    SandboxCapabilities {
        syscall_filter: probe_syscall_filtering(),
        resource_limits: cfg!(unix),
        process_groups: cfg!(unix),
    }
}

/// Probe only the syscall filtering facility.
pub fn probe_syscall_filtering() -> FilterCapability {
    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    {
        probe_seccomp()
    }

    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )))]
    {
        FilterCapability::UnsupportedPlatform
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
fn probe_seccomp() -> FilterCapability {
    // The Seccomp field exists in /proc/self/status on kernels built with
    // CONFIG_SECCOMP (3.8+).
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => parse_seccomp_status(&status),
        Err(e) => FilterCapability::CapabilityMissing(format!("cannot read /proc/self/status: {}", e)),
    }
}

#[cfg_attr(
    not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )),
    allow(dead_code)
)]
fn parse_seccomp_status(status: &str) -> FilterCapability {
    let Some(line) = status.lines().find(|l| l.starts_with("Seccomp:")) else {
        return FilterCapability::CapabilityMissing("kernel built without seccomp".to_string());
    };

    // 0 = disabled, 1 = strict mode, 2 = filter mode. Strict mode forbids
    // everything except read/write/exit, so no further filter can be added.
    match line.trim_start_matches("Seccomp:").trim() {
        "0" | "2" => FilterCapability::Supported,
        "1" => FilterCapability::CapabilityMissing("process is in seccomp strict mode".to_string()),
        other => FilterCapability::CapabilityMissing(format!("unrecognised seccomp mode {}", other)),
    }
}

impl SandboxCapabilities {
    /// Human-readable status lines for the `status` command.
    pub fn status_lines(&self) -> Vec<String> {
        let mark = |ok: bool| if ok { "ok" } else { "--" };

        vec![
            format!(
                "  Syscall filter:  {:<28} {}",
                self.syscall_filter.to_string(),
                mark(self.syscall_filter.is_supported())
            ),
            format!(
                "  Resource limits: {:<28} {}",
                if self.resource_limits { "setrlimit" } else { "not available" },
                mark(self.resource_limits)
            ),
            format!(
                "  Process groups:  {:<28} {}",
                if self.process_groups { "killpg" } else { "not available" },
                mark(self.process_groups)
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_capabilities_runs() {
        let caps = detect_capabilities();
        #[cfg(unix)]
        assert!(caps.resource_limits);
        #[cfg(not(target_os = "linux"))]
        assert_eq!(caps.syscall_filter, FilterCapability::UnsupportedPlatform);
        let _ = caps;
    }

    #[test]
    fn test_parse_seccomp_status_modes() {
        assert_eq!(
            parse_seccomp_status("Name:\tx\nSeccomp:\t0\n"),
            FilterCapability::Supported
        );
        assert_eq!(
            parse_seccomp_status("Seccomp:\t2\nSeccomp_filters:\t1\n"),
            FilterCapability::Supported
        );
        assert!(matches!(
            parse_seccomp_status("Seccomp:\t1\n"),
            FilterCapability::CapabilityMissing(_)
        ));
        assert!(matches!(
            parse_seccomp_status("Name:\tx\n"),
            FilterCapability::CapabilityMissing(_)
        ));
    }

    #[test]
    fn test_status_lines() {
        let lines = detect_capabilities().status_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Syscall filter"));
    }

    #[test]
    fn test_capability_serializes_with_reason() {
        let json =
            serde_json::to_string(&FilterCapability::CapabilityMissing("no".to_string())).unwrap();
        assert!(json.contains("capability_missing"));
        assert!(json.contains("\"no\""));
    }
}
