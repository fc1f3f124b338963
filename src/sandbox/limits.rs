use std::time::Duration;

use super::config::SandboxConfig;

/// Open-file ceiling applied to every sandboxed command.
pub const DEFAULT_MAX_OPEN_FILES: u64 = 256;

/// setrlimit-based ceilings for a sandboxed child.
///
/// CPU time is enforced by the kernel with SIGXCPU at the soft limit and
/// SIGKILL one second later; memory caps the address space (RLIMIT_AS).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_seconds: Option<u64>,
    pub address_space_bytes: Option<u64>,
    pub max_processes: Option<u64>,
    pub max_file_size_bytes: Option<u64>,
    pub max_open_files: Option<u64>,
}

impl ResourceLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            cpu_seconds: config.cpu_time_limit().map(cpu_seconds),
            address_space_bytes: config
                .memory_limit_mb()
                .map(|mb| mb.saturating_mul(1024 * 1024)),
            max_processes: config.max_processes(),
            max_file_size_bytes: config.max_file_size_bytes(),
            max_open_files: Some(DEFAULT_MAX_OPEN_FILES),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to the calling process. Meant for `pre_exec`: no allocation,
    /// and the first failure aborts the spawn.
    ///
    /// Requests above the current hard limit are clamped to it, since an
    /// unprivileged process cannot raise its own hard limit.
    #[cfg(unix)]
    pub fn apply(&self) -> std::io::Result<()> {
        use nix::sys::resource::Resource;

        if let Some(secs) = self.cpu_seconds {
            set_limit(Resource::RLIMIT_CPU, secs, secs.saturating_add(1))?;
        }
        if let Some(bytes) = self.address_space_bytes {
            set_limit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        // RLIMIT_NPROC is per-user on Linux and absent on some other unixes.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if let Some(n) = self.max_processes {
                set_limit(Resource::RLIMIT_NPROC, n, n)?;
            }
        }
        if let Some(bytes) = self.max_file_size_bytes {
            set_limit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        if let Some(n) = self.max_open_files {
            set_limit(Resource::RLIMIT_NOFILE, n, n)?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply(&self) -> std::io::Result<()> {
        Ok(())
    }
}

fn cpu_seconds(limit: Duration) -> u64 {
    // Round up so a 0.5s limit still grants the child a full tick.
    let secs = limit.as_secs();
    if limit.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
}

#[cfg(unix)]
fn set_limit(resource: nix::sys::resource::Resource, soft: u64, hard: u64) -> std::io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, current_hard) = getrlimit(resource).map_err(std::io::Error::from)?;
    let hard = hard.min(current_hard);
    let soft = soft.min(hard);
    setrlimit(resource, soft, hard).map_err(std::io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_default_config() {
        let limits = ResourceLimits::from_config(&SandboxConfig::default());
        assert_eq!(limits.cpu_seconds, None);
        assert_eq!(limits.address_space_bytes, None);
        assert_eq!(limits.max_open_files, Some(DEFAULT_MAX_OPEN_FILES));
    }

    #[test]
    fn test_from_config_converts_units() {
        let config = SandboxConfig::builder()
            .cpu_time_limit_secs(Some(2.5))
            .memory_limit_mb(Some(64))
            .max_processes(Some(32))
            .build()
            .unwrap();
        let limits = ResourceLimits::from_config(&config);
        assert_eq!(limits.cpu_seconds, Some(3));
        assert_eq!(limits.address_space_bytes, Some(64 * 1024 * 1024));
        assert_eq!(limits.max_processes, Some(32));
    }

    #[test]
    fn test_cpu_seconds_rounding() {
        assert_eq!(cpu_seconds(Duration::from_millis(100)), 1);
        assert_eq!(cpu_seconds(Duration::from_secs(4)), 4);
        assert_eq!(cpu_seconds(Duration::from_millis(4001)), 5);
    }

    #[test]
    fn test_empty_limits_apply_succeeds() {
        let limits = ResourceLimits::default();
        assert!(limits.is_unlimited());
        assert!(limits.apply().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_limits_enforced_in_child() {
        use std::os::unix::process::CommandExt;
        use std::process::Command;

        let limits = ResourceLimits {
            max_file_size_bytes: Some(1024),
            ..ResourceLimits::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("big");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("head -c 4096 /dev/zero > {}", target.display()));
        // SAFETY: apply() only calls getrlimit/setrlimit.
        unsafe {
            cmd.pre_exec(move || limits.apply());
        }
        let status = cmd.status().unwrap();
        assert!(!status.success());
        assert!(std::fs::metadata(&target).map(|m| m.len() <= 1024).unwrap_or(true));
    }
}
