//! Declarative syscall profiles.
//!
//! Profiles are cumulative: `Strict ⊆ Moderate ⊆ Permissive`. The
//! [`ALWAYS_DENIED`] set is subtracted from every effective allow-set,
//! including caller-supplied additions, so no configuration can re-admit
//! a networking, privilege-escalation, process-group escape, mount/module
//! or tracing syscall.
//!
//! Names are architecture-neutral. Resolution to syscall numbers happens in
//! the Linux backend, which skips names the target architecture lacks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Preset syscall allow-set.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SyscallProfile {
    /// Enough to exec a single program that reads, writes and exits.
    Strict,
    /// Strict + process control, pipes, polling and workspace file manipulation.
    #[default]
    Moderate,
    /// Moderate + IPC, scheduling, xattrs and I/O on already-open sockets.
    Permissive,
}

impl SyscallProfile {
    pub const ALL: [SyscallProfile; 3] = [
        SyscallProfile::Strict,
        SyscallProfile::Moderate,
        SyscallProfile::Permissive,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            SyscallProfile::Strict => "exec, memory, basic file I/O and exit",
            SyscallProfile::Moderate => "Strict + processes, pipes, polling, file manipulation",
            SyscallProfile::Permissive => "Moderate + IPC, scheduling, xattrs, socket I/O",
        }
    }

    /// Cumulative base allow-set for this profile, before customization.
    ///
    /// Never contains a member of [`ALWAYS_DENIED`].
    pub fn base_syscalls(&self) -> BTreeSet<&'static str> {
        let mut set: BTreeSet<&'static str> = STRICT_SYSCALLS.iter().copied().collect();

        if *self >= SyscallProfile::Moderate {
            set.extend(MODERATE_EXTRAS.iter().copied());
        }
        if *self >= SyscallProfile::Permissive {
            set.extend(PERMISSIVE_EXTRAS.iter().copied());
        }

        set.retain(|name| !is_always_denied(name));
        set
    }
}

impl fmt::Display for SyscallProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyscallProfile::Strict => "strict",
            SyscallProfile::Moderate => "moderate",
            SyscallProfile::Permissive => "permissive",
        };
        f.write_str(name)
    }
}

impl FromStr for SyscallProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(SyscallProfile::Strict),
            "moderate" => Ok(SyscallProfile::Moderate),
            "permissive" => Ok(SyscallProfile::Permissive),
            other => Err(ConfigError::InvalidConfig(format!(
                "unknown syscall profile '{}' (expected strict, moderate or permissive)",
                other
            ))),
        }
    }
}

/// Syscalls no profile or customization may allow.
pub const ALWAYS_DENIED: &[&str] = &[
    // Networking: creating or establishing sockets
    "socket",
    "connect",
    "bind",
    "listen",
    "accept",
    "accept4",
    // Privilege changes
    "setuid",
    "setgid",
    "setreuid",
    "setregid",
    "setresuid",
    "setresgid",
    "setfsuid",
    "setfsgid",
    "setgroups",
    "capset",
    "unshare",
    "setns",
    "personality",
    // Leaving the supervised process group or session
    "setpgid",
    "setsid",
    // Mount, reboot, kernel modules, system-wide state
    "mount",
    "umount2",
    "pivot_root",
    "chroot",
    "reboot",
    "kexec_load",
    "kexec_file_load",
    "init_module",
    "finit_module",
    "delete_module",
    "swapon",
    "swapoff",
    "acct",
    "settimeofday",
    "clock_settime",
    "sethostname",
    "setdomainname",
    "iopl",
    "ioperm",
    // Tracing and introspection of other processes
    "ptrace",
    "process_vm_readv",
    "process_vm_writev",
    "perf_event_open",
    "bpf",
    "userfaultfd",
    "keyctl",
    "add_key",
    "request_key",
];

const STRICT_SYSCALLS: &[&str] = &[
    // I/O
    "read",
    "write",
    "readv",
    "writev",
    "pread64",
    "pwrite64",
    "lseek",
    "close",
    "close_range",
    "openat",
    "open",
    "ioctl",
    "fcntl",
    "dup",
    "dup2",
    "dup3",
    "fadvise64",
    // Stat
    "fstat",
    "stat",
    "lstat",
    "newfstatat",
    "statx",
    "access",
    "faccessat",
    "faccessat2",
    "readlink",
    "readlinkat",
    "getcwd",
    // Memory
    "brk",
    "mmap",
    "munmap",
    "mprotect",
    "madvise",
    "mremap",
    // Signals
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "sigaltstack",
    // Lifecycle
    "execve",
    "exit",
    "exit_group",
    // libc init
    "arch_prctl",
    "set_tid_address",
    "set_robust_list",
    "get_robust_list",
    "rseq",
    "futex",
    "getrandom",
    "prlimit64",
    "prctl",
    "uname",
    "sysinfo",
    // Identity
    "getpid",
    "gettid",
    "getppid",
    "getuid",
    "geteuid",
    "getgid",
    "getegid",
    // Time
    "clock_gettime",
    "clock_getres",
    "gettimeofday",
    "time",
    "nanosleep",
    "clock_nanosleep",
    "sched_yield",
    "sched_getaffinity",
];

const MODERATE_EXTRAS: &[&str] = &[
    // Processes
    "clone",
    "clone3",
    "fork",
    "vfork",
    "execveat",
    "wait4",
    "waitid",
    "kill",
    "tkill",
    "tgkill",
    "getpgrp",
    "getpgid",
    "getsid",
    "getrusage",
    "getrlimit",
    "setrlimit",
    "getresuid",
    "getresgid",
    "getgroups",
    "umask",
    "alarm",
    // Signals
    "rt_sigsuspend",
    "rt_sigtimedwait",
    "rt_sigpending",
    "rt_sigqueueinfo",
    // Pipes and polling
    "pipe",
    "pipe2",
    "poll",
    "ppoll",
    "select",
    "pselect6",
    "epoll_create",
    "epoll_create1",
    "epoll_ctl",
    "epoll_wait",
    "epoll_pwait",
    "eventfd2",
    // Directories and files
    "getdents",
    "getdents64",
    "chdir",
    "fchdir",
    "mkdir",
    "mkdirat",
    "rmdir",
    "unlink",
    "unlinkat",
    "rename",
    "renameat",
    "renameat2",
    "link",
    "linkat",
    "symlink",
    "symlinkat",
    "chmod",
    "fchmod",
    "fchmodat",
    "truncate",
    "ftruncate",
    "fsync",
    "fdatasync",
    "utimensat",
    "statfs",
    "fstatfs",
    "flock",
    "copy_file_range",
    "sendfile",
    "splice",
    "tee",
    "memfd_create",
    // Timers
    "timer_create",
    "timer_settime",
    "timer_gettime",
    "timer_getoverrun",
    "timer_delete",
];

const PERMISSIVE_EXTRAS: &[&str] = &[
    // Scheduling
    "sched_getscheduler",
    "sched_setscheduler",
    "sched_getparam",
    "sched_setparam",
    "sched_get_priority_max",
    "sched_get_priority_min",
    "sched_setaffinity",
    "getpriority",
    "setpriority",
    "membarrier",
    // Memory
    "mlock",
    "munlock",
    "mlockall",
    "munlockall",
    "mincore",
    "msync",
    // Ownership and extended attributes
    "chown",
    "fchown",
    "fchownat",
    "lchown",
    "fallocate",
    "getxattr",
    "lgetxattr",
    "fgetxattr",
    "listxattr",
    "setxattr",
    "fsetxattr",
    "removexattr",
    "capget",
    // Notification fds
    "inotify_init1",
    "inotify_add_watch",
    "inotify_rm_watch",
    "signalfd4",
    "timerfd_create",
    "timerfd_settime",
    "timerfd_gettime",
    "pidfd_open",
    "pidfd_send_signal",
    // System V IPC
    "shmget",
    "shmat",
    "shmdt",
    "shmctl",
    "semget",
    "semop",
    "semctl",
    "msgget",
    "msgsnd",
    "msgrcv",
    "msgctl",
    // Async I/O
    "io_setup",
    "io_destroy",
    "io_submit",
    "io_getevents",
    "io_cancel",
    "vmsplice",
    // I/O on sockets the process already holds
    "socketpair",
    "getsockopt",
    "setsockopt",
    "getsockname",
    "getpeername",
    "sendto",
    "recvfrom",
    "sendmsg",
    "recvmsg",
    "shutdown",
];

pub fn is_always_denied(name: &str) -> bool {
    ALWAYS_DENIED.contains(&name)
}

/// Whether `name` appears anywhere in the catalogue this crate knows about.
pub fn is_known_syscall(name: &str) -> bool {
    is_always_denied(name)
        || STRICT_SYSCALLS.contains(&name)
        || MODERATE_EXTRAS.contains(&name)
        || PERMISSIVE_EXTRAS.contains(&name)
}

/// Effective allow-set: `(profile_base ∪ custom_allowed) \ custom_denied \ ALWAYS_DENIED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    profile: SyscallProfile,
    allowed: BTreeSet<String>,
}

impl PolicySet {
    pub fn new<A, D>(profile: SyscallProfile, custom_allowed: &[A], custom_denied: &[D]) -> Self
    where
        A: AsRef<str>,
        D: AsRef<str>,
    {
        let mut allowed: BTreeSet<String> = profile
            .base_syscalls()
            .into_iter()
            .map(str::to_string)
            .collect();

        for name in custom_allowed {
            allowed.insert(name.as_ref().trim().to_string());
        }
        for name in custom_denied {
            allowed.remove(name.as_ref().trim());
        }

        // Denial wins over any customization.
        allowed.retain(|name| !name.is_empty() && !is_always_denied(name));

        Self { profile, allowed }
    }

    pub fn from_profile(profile: SyscallProfile) -> Self {
        Self::new::<&str, &str>(profile, &[], &[])
    }

    pub fn profile(&self) -> SyscallProfile {
        self.profile
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    pub fn allowed(&self) -> &BTreeSet<String> {
        &self.allowed
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}
