//! Whole-tree termination for sandboxed commands.
//!
//! Every sandboxed command is spawned as the leader of a fresh process group
//! (`CommandExt::process_group(0)`), so signalling the group reaches every
//! descendant that has not deliberately left it.

use std::io;

/// Signal used when terminating a process group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM, lets the group clean up
    Term,
    /// SIGKILL, cannot be caught
    #[default]
    Kill,
}

#[cfg(unix)]
impl KillSignal {
    fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Signal every member of process group `pgid`.
///
/// Idempotent: a group that no longer exists (ESRCH) counts as success, so
/// the watchdog and the reaper can both call this without coordinating.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32, signal: KillSignal) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    // pgid 0 or 1 would hit our own group or init.
    if pgid <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {}", pgid),
        ));
    }

    match killpg(Pid::from_raw(pgid as i32), signal.as_nix()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32, _signal: KillSignal) -> io::Result<()> {
    Ok(())
}

/// Whether any process in group `pgid` is still alive (zombies included).
#[cfg(unix)]
pub fn process_group_alive(pgid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if pgid <= 1 {
        return false;
    }
    // Signal 0 only performs the existence and permission checks.
    match killpg(Pid::from_raw(pgid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_group_alive(_pgid: u32) -> bool {
    false
}
