use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::{EnforcementMode, SandboxConfig};
use super::detect::{FilterCapability, probe_syscall_filtering};
use super::profile::{PolicySet, SyscallProfile};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("syscall filtering is not supported on this platform")]
    UnsupportedPlatform,

    #[error("syscall filtering unavailable: {0}")]
    CapabilityMissing(String),

    #[error("failed to compile syscall filter: {0}")]
    Compile(String),

    #[error("failed to install syscall filter: {0}")]
    Install(String),
}

/// A kernel-level syscall allow-list built from a [`PolicySet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallFilter {
    policy: PolicySet,
    mode: EnforcementMode,
}

impl SyscallFilter {
    /// Effective allow-set is `(profile ∪ custom_allowed) \ custom_denied \ ALWAYS_DENIED`.
    pub fn new<A, D>(profile: SyscallProfile, custom_allowed: &[A], custom_denied: &[D]) -> Self
    where
        A: AsRef<str>,
        D: AsRef<str>,
    {
        Self {
            policy: PolicySet::new(profile, custom_allowed, custom_denied),
            mode: EnforcementMode::Enforce,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(
            config.syscall_profile(),
            config.custom_allowed_syscalls(),
            config.custom_denied_syscalls(),
        )
        .with_mode(config.mode())
    }

    /// In warn mode calls outside the allow-list are logged by the kernel
    /// instead of failing with EPERM. ALWAYS_DENIED stays denied.
    pub fn with_mode(mut self, mode: EnforcementMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn policy(&self) -> &PolicySet {
        &self.policy
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    pub fn allows(&self, syscall: &str) -> bool {
        self.policy.allows(syscall)
    }

    /// Compile the filter without installing it.
    pub fn prepare(&self) -> Result<PreparedFilter, FilterError> {
        match probe_syscall_filtering() {
            FilterCapability::Supported => {}
            FilterCapability::UnsupportedPlatform => return Err(FilterError::UnsupportedPlatform),
            FilterCapability::CapabilityMissing(reason) => {
                return Err(FilterError::CapabilityMissing(reason));
            }
        }
        PreparedFilter::compile(&self.policy, self.mode)
    }

    /// Install the filter on the current process.
    ///
    /// Returns `false` when filtering is unavailable or installation fails;
    /// never panics. Once this returns `true` the filter stays for the rest
    /// of the process's life and is inherited by every child spawned later.
    pub fn apply(&self) -> bool {
        let result = self.prepare().and_then(|prepared| prepared.install());
        match result {
            Ok(()) => {
                info!(
                    profile = %self.policy.profile(),
                    mode = %self.mode,
                    allowed = self.policy.len(),
                    "syscall filter installed"
                );
                true
            }
            Err(FilterError::UnsupportedPlatform) => {
                debug!("syscall filtering not supported on this platform; skipping");
                false
            }
            Err(e) => {
                warn!("syscall filter not applied: {}", e);
                false
            }
        }
    }

    /// Build a closure suitable for `CommandExt::pre_exec`.
    ///
    /// The filter is compiled here, in the parent. The closure only installs
    /// it and swallows any failure, so a filtering problem never prevents
    /// the spawn; resource limits remain in force either way.
    pub fn create_preexec_fn(&self) -> impl FnMut() -> std::io::Result<()> + Send + Sync + 'static {
        let prepared = match self.prepare() {
            Ok(prepared) => prepared,
            Err(FilterError::UnsupportedPlatform) => {
                debug!("syscall filtering not supported on this platform; child runs unfiltered");
                PreparedFilter::default()
            }
            Err(e) => {
                warn!("child will run without a syscall filter: {}", e);
                PreparedFilter::default()
            }
        };
        move || {
            let _ = prepared.install();
            Ok(())
        }
    }
}

/// A compiled filter, ready to install. Empty when filtering is unavailable.
#[derive(Debug, Default)]
pub struct PreparedFilter {
    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    programs: Vec<seccompiler::BpfProgram>,
}

impl PreparedFilter {
    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    fn compile(policy: &PolicySet, mode: EnforcementMode) -> Result<Self, FilterError> {
        Ok(Self {
            programs: super::linux::compile(policy, mode)?,
        })
    }

    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )))]
    fn compile(_policy: &PolicySet, _mode: EnforcementMode) -> Result<Self, FilterError> {
        Err(FilterError::UnsupportedPlatform)
    }

    pub fn is_empty(&self) -> bool {
        #[cfg(all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        ))]
        {
            self.programs.is_empty()
        }

        #[cfg(not(all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        )))]
        {
            true
        }
    }

    /// Install into the calling process. An empty filter installs nothing.
    ///
    /// Async-signal-safe on the success path, so it may run between fork
    /// and exec.
    pub fn install(&self) -> Result<(), FilterError> {
        #[cfg(all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        ))]
        {
            if !self.programs.is_empty() {
                return super::linux::install(&self.programs);
            }
        }
        Ok(())
    }
}

/// Marker: no filter has been installed through this handle.
#[derive(Debug)]
pub struct Unfiltered;

/// Marker: at least one filter is installed; it can only be tightened.
#[derive(Debug)]
pub struct Filtered;

static HANDLE_TAKEN: AtomicBool = AtomicBool::new(false);

/// The current process's syscall capability set, tracked in the type.
///
/// There is exactly one handle per process. `Unfiltered` can be consumed
/// into `Filtered`, and `Filtered` only offers `restrict_further`, so
/// loosening an installed filter is not expressible.
#[derive(Debug)]
pub struct ProcessCapabilities<S> {
    installed: usize,
    _state: PhantomData<S>,
}

/// A failed restriction hands the unchanged handle back.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct RestrictError<S: std::fmt::Debug> {
    pub process: ProcessCapabilities<S>,
    #[source]
    pub reason: FilterError,
}

impl ProcessCapabilities<Unfiltered> {
    /// Take the process-wide handle. Returns `None` if it was already taken.
    pub fn acquire() -> Option<Self> {
        if HANDLE_TAKEN.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self {
            installed: 0,
            _state: PhantomData,
        })
    }

    pub fn restrict(
        self,
        filter: &SyscallFilter,
    ) -> Result<ProcessCapabilities<Filtered>, RestrictError<Unfiltered>> {
        match filter.prepare().and_then(|prepared| prepared.install()) {
            Ok(()) => Ok(ProcessCapabilities {
                installed: 1,
                _state: PhantomData,
            }),
            Err(reason) => Err(RestrictError {
                process: self,
                reason,
            }),
        }
    }
}

impl ProcessCapabilities<Filtered> {
    /// Stack another filter. The kernel evaluates every installed filter and
    /// applies the most restrictive verdict.
    pub fn restrict_further(self, filter: &SyscallFilter) -> Result<Self, RestrictError<Filtered>> {
        match filter.prepare().and_then(|prepared| prepared.install()) {
            Ok(()) => Ok(Self {
                installed: self.installed + 1,
                _state: PhantomData,
            }),
            Err(reason) => Err(RestrictError {
                process: self,
                reason,
            }),
        }
    }

    pub fn installed_filters(&self) -> usize {
        self.installed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::profile::ALWAYS_DENIED;

    // apply() and restrict() are exercised from child processes in tests/;
    // calling them here would filter the test runner itself.

    #[test]
    fn test_custom_allow_cannot_readmit_denied() {
        let filter = SyscallFilter::new(SyscallProfile::Permissive, &["ptrace", "mount"], &[] as &[&str]);
        assert!(!filter.allows("ptrace"));
        assert!(!filter.allows("mount"));
        for name in ALWAYS_DENIED {
            assert!(!filter.allows(name));
        }
    }

    #[test]
    fn test_custom_deny_removes_from_profile() {
        let filter = SyscallFilter::new(SyscallProfile::Moderate, &[] as &[&str], &["kill"]);
        assert!(!filter.allows("kill"));
        assert!(filter.allows("read"));
    }

    #[test]
    fn test_from_config_carries_mode_and_lists() {
        let config = SandboxConfig::builder()
            .mode(EnforcementMode::Warn)
            .syscall_profile(SyscallProfile::Strict)
            .allow_syscalls(["wait4"])
            .build()
            .unwrap();
        let filter = SyscallFilter::from_config(&config);
        assert_eq!(filter.mode(), EnforcementMode::Warn);
        assert_eq!(filter.policy().profile(), SyscallProfile::Strict);
        assert!(filter.allows("wait4"));
    }

    #[test]
    fn test_prepare_matches_capability() {
        let filter = SyscallFilter::new(SyscallProfile::Moderate, &[] as &[&str], &[] as &[&str]);
        match probe_syscall_filtering() {
            FilterCapability::Supported => assert!(!filter.prepare().unwrap().is_empty()),
            FilterCapability::UnsupportedPlatform => {
                assert_eq!(filter.prepare().unwrap_err(), FilterError::UnsupportedPlatform)
            }
            FilterCapability::CapabilityMissing(_) => assert!(matches!(
                filter.prepare(),
                Err(FilterError::CapabilityMissing(_))
            )),
        }
    }

    #[test]
    fn test_empty_prepared_filter_installs_nothing() {
        let prepared = PreparedFilter::default();
        assert!(prepared.is_empty());
        assert!(prepared.install().is_ok());
    }

    #[test]
    fn test_process_handle_is_unique() {
        let first = ProcessCapabilities::acquire();
        assert!(first.is_some());
        assert!(ProcessCapabilities::acquire().is_none());
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_apply_is_a_noop_without_seccomp() {
        let filter = SyscallFilter::new(SyscallProfile::Strict, &[] as &[&str], &[] as &[&str]);
        assert!(!filter.apply());
    }

    #[test]
    fn test_preexec_fn_is_constructible() {
        let filter = SyscallFilter::new(SyscallProfile::Strict, &[] as &[&str], &[] as &[&str]);
        let _hook = filter.create_preexec_fn();
    }
}
