//! seccomp-bpf backend for the syscall filter.
//!
//! Compilation happens in the parent so the forked child only has to call
//! `prctl` and `seccomp`, neither of which allocates.

use std::collections::BTreeMap;

use nix::libc;
use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use tracing::debug;

use super::config::EnforcementMode;
use super::filter::FilterError;
use super::profile::{ALWAYS_DENIED, PolicySet};

/// Resolve a syscall name to its number on the running architecture.
///
/// Names that exist only on other architectures resolve to `None`.
pub fn syscall_number(name: &str) -> Option<i64> {
    let nr = match name {
        "read" => libc::SYS_read,
        "write" => libc::SYS_write,
        "readv" => libc::SYS_readv,
        "writev" => libc::SYS_writev,
        "pread64" => libc::SYS_pread64,
        "pwrite64" => libc::SYS_pwrite64,
        "lseek" => libc::SYS_lseek,
        "close" => libc::SYS_close,
        "close_range" => libc::SYS_close_range,
        "openat" => libc::SYS_openat,
        "ioctl" => libc::SYS_ioctl,
        "fcntl" => libc::SYS_fcntl,
        "dup" => libc::SYS_dup,
        "dup3" => libc::SYS_dup3,
        "fadvise64" => libc::SYS_fadvise64,
        "fstat" => libc::SYS_fstat,
        "newfstatat" => libc::SYS_newfstatat,
        "statx" => libc::SYS_statx,
        "faccessat" => libc::SYS_faccessat,
        "faccessat2" => libc::SYS_faccessat2,
        "readlinkat" => libc::SYS_readlinkat,
        "getcwd" => libc::SYS_getcwd,
        "brk" => libc::SYS_brk,
        "mmap" => libc::SYS_mmap,
        "munmap" => libc::SYS_munmap,
        "mprotect" => libc::SYS_mprotect,
        "madvise" => libc::SYS_madvise,
        "mremap" => libc::SYS_mremap,
        "rt_sigaction" => libc::SYS_rt_sigaction,
        "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
        "rt_sigreturn" => libc::SYS_rt_sigreturn,
        "sigaltstack" => libc::SYS_sigaltstack,
        "execve" => libc::SYS_execve,
        "exit" => libc::SYS_exit,
        "exit_group" => libc::SYS_exit_group,
        "set_tid_address" => libc::SYS_set_tid_address,
        "set_robust_list" => libc::SYS_set_robust_list,
        "get_robust_list" => libc::SYS_get_robust_list,
        "rseq" => libc::SYS_rseq,
        "futex" => libc::SYS_futex,
        "getrandom" => libc::SYS_getrandom,
        "prlimit64" => libc::SYS_prlimit64,
        "prctl" => libc::SYS_prctl,
        "uname" => libc::SYS_uname,
        "sysinfo" => libc::SYS_sysinfo,
        "getpid" => libc::SYS_getpid,
        "gettid" => libc::SYS_gettid,
        "getppid" => libc::SYS_getppid,
        "getuid" => libc::SYS_getuid,
        "geteuid" => libc::SYS_geteuid,
        "getgid" => libc::SYS_getgid,
        "getegid" => libc::SYS_getegid,
        "clock_gettime" => libc::SYS_clock_gettime,
        "clock_getres" => libc::SYS_clock_getres,
        "gettimeofday" => libc::SYS_gettimeofday,
        "nanosleep" => libc::SYS_nanosleep,
        "clock_nanosleep" => libc::SYS_clock_nanosleep,
        "sched_yield" => libc::SYS_sched_yield,
        "sched_getaffinity" => libc::SYS_sched_getaffinity,
        "clone" => libc::SYS_clone,
        "clone3" => libc::SYS_clone3,
        "execveat" => libc::SYS_execveat,
        "wait4" => libc::SYS_wait4,
        "waitid" => libc::SYS_waitid,
        "kill" => libc::SYS_kill,
        "tkill" => libc::SYS_tkill,
        "tgkill" => libc::SYS_tgkill,
        "getpgid" => libc::SYS_getpgid,
        "setpgid" => libc::SYS_setpgid,
        "getsid" => libc::SYS_getsid,
        "setsid" => libc::SYS_setsid,
        "getrusage" => libc::SYS_getrusage,
        "getrlimit" => libc::SYS_getrlimit,
        "setrlimit" => libc::SYS_setrlimit,
        "getresuid" => libc::SYS_getresuid,
        "getresgid" => libc::SYS_getresgid,
        "getgroups" => libc::SYS_getgroups,
        "umask" => libc::SYS_umask,
        "rt_sigsuspend" => libc::SYS_rt_sigsuspend,
        "rt_sigtimedwait" => libc::SYS_rt_sigtimedwait,
        "rt_sigpending" => libc::SYS_rt_sigpending,
        "rt_sigqueueinfo" => libc::SYS_rt_sigqueueinfo,
        "pipe2" => libc::SYS_pipe2,
        "ppoll" => libc::SYS_ppoll,
        "pselect6" => libc::SYS_pselect6,
        "epoll_create1" => libc::SYS_epoll_create1,
        "epoll_ctl" => libc::SYS_epoll_ctl,
        "epoll_pwait" => libc::SYS_epoll_pwait,
        "eventfd2" => libc::SYS_eventfd2,
        "getdents64" => libc::SYS_getdents64,
        "chdir" => libc::SYS_chdir,
        "fchdir" => libc::SYS_fchdir,
        "mkdirat" => libc::SYS_mkdirat,
        "unlinkat" => libc::SYS_unlinkat,
        "renameat" => libc::SYS_renameat,
        "renameat2" => libc::SYS_renameat2,
        "linkat" => libc::SYS_linkat,
        "symlinkat" => libc::SYS_symlinkat,
        "fchmod" => libc::SYS_fchmod,
        "fchmodat" => libc::SYS_fchmodat,
        "truncate" => libc::SYS_truncate,
        "ftruncate" => libc::SYS_ftruncate,
        "fsync" => libc::SYS_fsync,
        "fdatasync" => libc::SYS_fdatasync,
        "utimensat" => libc::SYS_utimensat,
        "statfs" => libc::SYS_statfs,
        "fstatfs" => libc::SYS_fstatfs,
        "flock" => libc::SYS_flock,
        "copy_file_range" => libc::SYS_copy_file_range,
        "sendfile" => libc::SYS_sendfile,
        "splice" => libc::SYS_splice,
        "tee" => libc::SYS_tee,
        "memfd_create" => libc::SYS_memfd_create,
        "timer_create" => libc::SYS_timer_create,
        "timer_settime" => libc::SYS_timer_settime,
        "timer_gettime" => libc::SYS_timer_gettime,
        "timer_getoverrun" => libc::SYS_timer_getoverrun,
        "timer_delete" => libc::SYS_timer_delete,
        "sched_getscheduler" => libc::SYS_sched_getscheduler,
        "sched_setscheduler" => libc::SYS_sched_setscheduler,
        "sched_getparam" => libc::SYS_sched_getparam,
        "sched_setparam" => libc::SYS_sched_setparam,
        "sched_get_priority_max" => libc::SYS_sched_get_priority_max,
        "sched_get_priority_min" => libc::SYS_sched_get_priority_min,
        "sched_setaffinity" => libc::SYS_sched_setaffinity,
        "getpriority" => libc::SYS_getpriority,
        "setpriority" => libc::SYS_setpriority,
        "membarrier" => libc::SYS_membarrier,
        "mlock" => libc::SYS_mlock,
        "munlock" => libc::SYS_munlock,
        "mlockall" => libc::SYS_mlockall,
        "munlockall" => libc::SYS_munlockall,
        "mincore" => libc::SYS_mincore,
        "msync" => libc::SYS_msync,
        "fchown" => libc::SYS_fchown,
        "fchownat" => libc::SYS_fchownat,
        "fallocate" => libc::SYS_fallocate,
        "getxattr" => libc::SYS_getxattr,
        "lgetxattr" => libc::SYS_lgetxattr,
        "fgetxattr" => libc::SYS_fgetxattr,
        "listxattr" => libc::SYS_listxattr,
        "setxattr" => libc::SYS_setxattr,
        "fsetxattr" => libc::SYS_fsetxattr,
        "removexattr" => libc::SYS_removexattr,
        "capget" => libc::SYS_capget,
        "inotify_init1" => libc::SYS_inotify_init1,
        "inotify_add_watch" => libc::SYS_inotify_add_watch,
        "inotify_rm_watch" => libc::SYS_inotify_rm_watch,
        "signalfd4" => libc::SYS_signalfd4,
        "timerfd_create" => libc::SYS_timerfd_create,
        "timerfd_settime" => libc::SYS_timerfd_settime,
        "timerfd_gettime" => libc::SYS_timerfd_gettime,
        "pidfd_open" => libc::SYS_pidfd_open,
        "pidfd_send_signal" => libc::SYS_pidfd_send_signal,
        "shmget" => libc::SYS_shmget,
        "shmat" => libc::SYS_shmat,
        "shmdt" => libc::SYS_shmdt,
        "shmctl" => libc::SYS_shmctl,
        "semget" => libc::SYS_semget,
        "semop" => libc::SYS_semop,
        "semctl" => libc::SYS_semctl,
        "msgget" => libc::SYS_msgget,
        "msgsnd" => libc::SYS_msgsnd,
        "msgrcv" => libc::SYS_msgrcv,
        "msgctl" => libc::SYS_msgctl,
        "io_setup" => libc::SYS_io_setup,
        "io_destroy" => libc::SYS_io_destroy,
        "io_submit" => libc::SYS_io_submit,
        "io_getevents" => libc::SYS_io_getevents,
        "io_cancel" => libc::SYS_io_cancel,
        "vmsplice" => libc::SYS_vmsplice,
        "socketpair" => libc::SYS_socketpair,
        "getsockopt" => libc::SYS_getsockopt,
        "setsockopt" => libc::SYS_setsockopt,
        "getsockname" => libc::SYS_getsockname,
        "getpeername" => libc::SYS_getpeername,
        "sendto" => libc::SYS_sendto,
        "recvfrom" => libc::SYS_recvfrom,
        "sendmsg" => libc::SYS_sendmsg,
        "recvmsg" => libc::SYS_recvmsg,
        "shutdown" => libc::SYS_shutdown,
        "socket" => libc::SYS_socket,
        "connect" => libc::SYS_connect,
        "bind" => libc::SYS_bind,
        "listen" => libc::SYS_listen,
        "accept" => libc::SYS_accept,
        "accept4" => libc::SYS_accept4,
        "setuid" => libc::SYS_setuid,
        "setgid" => libc::SYS_setgid,
        "setreuid" => libc::SYS_setreuid,
        "setregid" => libc::SYS_setregid,
        "setresuid" => libc::SYS_setresuid,
        "setresgid" => libc::SYS_setresgid,
        "setfsuid" => libc::SYS_setfsuid,
        "setfsgid" => libc::SYS_setfsgid,
        "setgroups" => libc::SYS_setgroups,
        "capset" => libc::SYS_capset,
        "unshare" => libc::SYS_unshare,
        "setns" => libc::SYS_setns,
        "personality" => libc::SYS_personality,
        "mount" => libc::SYS_mount,
        "umount2" => libc::SYS_umount2,
        "pivot_root" => libc::SYS_pivot_root,
        "chroot" => libc::SYS_chroot,
        "reboot" => libc::SYS_reboot,
        "kexec_load" => libc::SYS_kexec_load,
        "kexec_file_load" => libc::SYS_kexec_file_load,
        "init_module" => libc::SYS_init_module,
        "finit_module" => libc::SYS_finit_module,
        "delete_module" => libc::SYS_delete_module,
        "swapon" => libc::SYS_swapon,
        "swapoff" => libc::SYS_swapoff,
        "acct" => libc::SYS_acct,
        "settimeofday" => libc::SYS_settimeofday,
        "clock_settime" => libc::SYS_clock_settime,
        "sethostname" => libc::SYS_sethostname,
        "setdomainname" => libc::SYS_setdomainname,
        "ptrace" => libc::SYS_ptrace,
        "process_vm_readv" => libc::SYS_process_vm_readv,
        "process_vm_writev" => libc::SYS_process_vm_writev,
        "perf_event_open" => libc::SYS_perf_event_open,
        "bpf" => libc::SYS_bpf,
        "userfaultfd" => libc::SYS_userfaultfd,
        "keyctl" => libc::SYS_keyctl,
        "add_key" => libc::SYS_add_key,
        "request_key" => libc::SYS_request_key,
        // Legacy entry points only present in the x86_64 table.
        #[cfg(target_arch = "x86_64")]
        "open" => libc::SYS_open,
        #[cfg(target_arch = "x86_64")]
        "stat" => libc::SYS_stat,
        #[cfg(target_arch = "x86_64")]
        "lstat" => libc::SYS_lstat,
        #[cfg(target_arch = "x86_64")]
        "access" => libc::SYS_access,
        #[cfg(target_arch = "x86_64")]
        "readlink" => libc::SYS_readlink,
        #[cfg(target_arch = "x86_64")]
        "dup2" => libc::SYS_dup2,
        #[cfg(target_arch = "x86_64")]
        "arch_prctl" => libc::SYS_arch_prctl,
        #[cfg(target_arch = "x86_64")]
        "time" => libc::SYS_time,
        #[cfg(target_arch = "x86_64")]
        "fork" => libc::SYS_fork,
        #[cfg(target_arch = "x86_64")]
        "vfork" => libc::SYS_vfork,
        #[cfg(target_arch = "x86_64")]
        "pipe" => libc::SYS_pipe,
        #[cfg(target_arch = "x86_64")]
        "poll" => libc::SYS_poll,
        #[cfg(target_arch = "x86_64")]
        "select" => libc::SYS_select,
        #[cfg(target_arch = "x86_64")]
        "epoll_create" => libc::SYS_epoll_create,
        #[cfg(target_arch = "x86_64")]
        "epoll_wait" => libc::SYS_epoll_wait,
        #[cfg(target_arch = "x86_64")]
        "getdents" => libc::SYS_getdents,
        #[cfg(target_arch = "x86_64")]
        "mkdir" => libc::SYS_mkdir,
        #[cfg(target_arch = "x86_64")]
        "rmdir" => libc::SYS_rmdir,
        #[cfg(target_arch = "x86_64")]
        "unlink" => libc::SYS_unlink,
        #[cfg(target_arch = "x86_64")]
        "rename" => libc::SYS_rename,
        #[cfg(target_arch = "x86_64")]
        "link" => libc::SYS_link,
        #[cfg(target_arch = "x86_64")]
        "symlink" => libc::SYS_symlink,
        #[cfg(target_arch = "x86_64")]
        "chmod" => libc::SYS_chmod,
        #[cfg(target_arch = "x86_64")]
        "chown" => libc::SYS_chown,
        #[cfg(target_arch = "x86_64")]
        "lchown" => libc::SYS_lchown,
        #[cfg(target_arch = "x86_64")]
        "getpgrp" => libc::SYS_getpgrp,
        #[cfg(target_arch = "x86_64")]
        "iopl" => libc::SYS_iopl,
        #[cfg(target_arch = "x86_64")]
        "ioperm" => libc::SYS_ioperm,
        #[cfg(target_arch = "x86_64")]
        "alarm" => libc::SYS_alarm,
        _ => return None,
    };
    Some(nr as i64)
}

fn target_arch() -> Result<TargetArch, FilterError> {
    std::env::consts::ARCH
        .try_into()
        .map_err(|e: seccompiler::BackendError| {
            FilterError::Compile(format!("unsupported architecture: {}", e))
        })
}

fn rules_for<'a, I>(names: I) -> BTreeMap<i64, Vec<SeccompRule>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    for name in names {
        match syscall_number(name) {
            // An empty rule list matches the syscall regardless of arguments.
            Some(nr) => {
                rules.entry(nr).or_default();
            }
            None => debug!(syscall = name, "syscall not present on this architecture"),
        }
    }
    rules
}

fn build(
    rules: BTreeMap<i64, Vec<SeccompRule>>,
    mismatch: SeccompAction,
    on_match: SeccompAction,
    arch: TargetArch,
) -> Result<BpfProgram, FilterError> {
    let filter = SeccompFilter::new(rules, mismatch, on_match, arch)
        .map_err(|e| FilterError::Compile(format!("seccomp filter creation: {}", e)))?;
    filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| {
            FilterError::Compile(format!("seccomp BPF compilation: {}", e))
        })
}

/// Compile `policy` into the BPF programs to install, in installation order.
///
/// Enforce mode yields a single default-deny allow-list. Warn mode stacks a
/// hard deny for [`ALWAYS_DENIED`] under an allow-list whose mismatch action
/// only logs, so the permanent denials hold in both modes.
pub fn compile(policy: &PolicySet, mode: EnforcementMode) -> Result<Vec<BpfProgram>, FilterError> {
    let arch = target_arch()?;
    let eperm = SeccompAction::Errno(libc::EPERM as u32);
    let mut programs = Vec::with_capacity(2);

    if mode == EnforcementMode::Warn {
        programs.push(build(
            rules_for(ALWAYS_DENIED.iter().copied()),
            SeccompAction::Allow,
            eperm.clone(),
            arch,
        )?);
    }

    let allowed = rules_for(policy.allowed().iter().map(String::as_str));
    if allowed.is_empty() {
        return Err(FilterError::Compile("effective allow-set is empty".to_string()));
    }
    let mismatch = match mode {
        EnforcementMode::Enforce => eperm,
        EnforcementMode::Warn => SeccompAction::Log,
    };
    programs.push(build(allowed, mismatch, SeccompAction::Allow, arch)?);

    Ok(programs)
}

pub fn set_no_new_privs() -> Result<(), FilterError> {
    // SAFETY: PR_SET_NO_NEW_PRIVS takes only integer arguments and touches
    // no memory of ours; it only sets a flag on the calling thread.
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(FilterError::Install(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Install precompiled programs into the calling thread's process.
///
/// Safe to call between `fork` and `exec`: nothing here allocates except
/// on the error path.
pub fn install(programs: &[BpfProgram]) -> Result<(), FilterError> {
    set_no_new_privs()?;
    for program in programs {
        seccompiler::apply_filter(program)
            .map_err(|e| FilterError::Install(format!("seccomp apply_filter: {}", e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::profile::{SyscallProfile, is_known_syscall};

    // Nothing here installs a filter: that would restrict the test runner.

    #[test]
    fn test_core_syscalls_resolve() {
        for name in ["read", "write", "execve", "exit_group", "socket", "ptrace"] {
            assert!(syscall_number(name).is_some(), "{} did not resolve", name);
        }
        assert_eq!(syscall_number("read"), Some(libc::SYS_read as i64));
        assert_eq!(syscall_number("not_a_syscall"), None);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_every_catalogued_syscall_resolves_on_x86_64() {
        for profile in SyscallProfile::ALL {
            for name in profile.base_syscalls() {
                assert!(syscall_number(name).is_some(), "{} did not resolve", name);
            }
        }
        for name in ALWAYS_DENIED {
            assert!(is_known_syscall(name));
            assert!(syscall_number(name).is_some(), "{} did not resolve", name);
        }
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_legacy_syscalls_absent_on_aarch64() {
        assert_eq!(syscall_number("open"), None);
        assert_eq!(syscall_number("fork"), None);
        assert!(syscall_number("openat").is_some());
    }

    #[test]
    fn test_compile_all_profiles_both_modes() {
        for profile in SyscallProfile::ALL {
            let policy = PolicySet::from_profile(profile);
            let enforce = compile(&policy, EnforcementMode::Enforce).unwrap();
            assert_eq!(enforce.len(), 1);
            assert!(!enforce[0].is_empty());

            let warn = compile(&policy, EnforcementMode::Warn).unwrap();
            assert_eq!(warn.len(), 2);
        }
    }

    #[test]
    fn test_compile_rejects_empty_allow_set() {
        let everything: Vec<&str> = SyscallProfile::Strict.base_syscalls().into_iter().collect();
        let policy = PolicySet::new(SyscallProfile::Strict, &[] as &[&str], &everything);
        assert!(policy.is_empty());
        assert!(matches!(
            compile(&policy, EnforcementMode::Enforce),
            Err(FilterError::Compile(_))
        ));
    }
}
