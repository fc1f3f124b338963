//! Parent-side supervision of one child process.
//!
//! The child is started as the leader of a fresh process group so the
//! watchdog can take down everything it forked. Exit is observed with
//! `waitid(WNOWAIT)` first: the leader stays a zombie, which keeps the group
//! id reserved while stragglers are killed, and only then is it reaped with
//! `wait4` to collect its rusage.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::filter::PreparedFilter;
use super::limits::ResourceLimits;
use super::process_group::{KillSignal, kill_process_group};

/// How long to wait for the output pipes to close after the group is gone.
/// A descendant that escaped the process group can hold them open forever.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8192;

/// Work done in the child between fork and exec.
pub(crate) struct ChildSetup {
    pub limits: ResourceLimits,
    pub filter: Option<Arc<PreparedFilter>>,
}

impl ChildSetup {
    /// Runs in the forked child. A limit that cannot be set aborts the
    /// spawn; a filter that cannot be installed does not.
    fn run(&self) -> io::Result<()> {
        self.limits.apply()?;
        if let Some(filter) = &self.filter {
            let _ = filter.install();
        }
        Ok(())
    }
}

pub(crate) struct ChildSpec<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    /// `None` runs the command without limits or filter.
    pub setup: Option<ChildSetup>,
}

/// Raw rusage of the reaped child, normalized to milliseconds and KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RawUsage {
    pub user_time_ms: u64,
    pub system_time_ms: u64,
    pub max_rss_kb: u64,
}

#[derive(Debug)]
pub(crate) struct ChildExit {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub usage: Option<RawUsage>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub output_truncated: bool,
}

#[derive(Debug, Default)]
struct WatchState {
    exited: bool,
    timed_out: bool,
}

#[derive(Debug, Default)]
struct Capture {
    data: Vec<u8>,
    truncated: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Spawn, supervise and reap. `Err` means the command never started.
#[cfg(unix)]
pub(crate) fn run(spec: ChildSpec<'_>) -> io::Result<ChildExit> {
    use std::os::unix::process::CommandExt;

    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    if let Some(setup) = spec.setup {
        // SAFETY: `pre_exec` runs in the child between fork and exec. The
        // closure only calls getrlimit/setrlimit, prctl and seccomp on data
        // prepared in the parent, and performs no allocation.
        unsafe {
            cmd.pre_exec(move || setup.run());
        }
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    debug!(pid, program = %program, "spawned child");

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let out = spawn_reader(child.stdout.take(), spec.max_output_bytes, done_tx.clone());
    let err = spawn_reader(child.stderr.take(), spec.max_output_bytes, done_tx);

    let state = Arc::new(Mutex::new(WatchState::default()));
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let watchdog = {
        let state = Arc::clone(&state);
        let timeout = spec.timeout;
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                let mut state = lock(&state);
                // The leader may have exited before `exited` was set.
                if !state.exited && !leader_exited(pid) {
                    warn!(pid, timeout_secs = timeout.as_secs_f64(), "timeout reached, killing process group");
                    if let Err(e) = kill_process_group(pid, KillSignal::Kill) {
                        warn!(pid, "failed to kill process group: {}", e);
                    }
                    state.timed_out = true;
                }
            }
        })
    };

    let waited = wait_exited(pid);
    lock(&state).exited = true;

    // The leader is gone (or lost); nothing else in its group may outlive it.
    let _ = kill_process_group(pid, KillSignal::Kill);

    let reaped = match waited {
        Ok(()) => reap(pid),
        Err(e) => Err(e),
    };

    drop(cancel_tx);
    let _ = watchdog.join();
    drop(child);

    let (status, usage) = match reaped {
        Ok(pair) => pair,
        Err(e) => {
            warn!(pid, "lost track of child: {}", e);
            return Err(e);
        }
    };

    // Readers finish once every writer end is closed.
    let deadline = Instant::now() + OUTPUT_GRACE;
    for _ in 0..2 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if done_rx.recv_timeout(remaining).is_err() {
            warn!(pid, "output pipes still open after exit; returning partial output");
            break;
        }
    }

    let (stdout, out_truncated) = take_capture(&out);
    let (stderr, err_truncated) = take_capture(&err);
    let (code, signal) = decode_status(status);
    let timed_out = killed_by_watchdog(lock(&state).timed_out, signal);
    Ok(ChildExit {
        pid,
        code,
        signal,
        timed_out,
        usage: Some(usage),
        stdout,
        stderr,
        output_truncated: out_truncated || err_truncated,
    })
}

#[cfg(not(unix))]
pub(crate) fn run(_spec: ChildSpec<'_>) -> io::Result<ChildExit> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "sandboxed execution requires a unix host",
    ))
}

fn spawn_reader<R>(pipe: Option<R>, cap: usize, done: mpsc::Sender<()>) -> Arc<Mutex<Capture>>
where
    R: Read + Send + 'static,
{
    let capture = Arc::new(Mutex::new(Capture::default()));
    let Some(mut pipe) = pipe else {
        let _ = done.send(());
        return capture;
    };
    let sink = Arc::clone(&capture);
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let mut sink = lock(&sink);
                    let room = cap.saturating_sub(sink.data.len());
                    // Past the cap the pipe is still drained so the child
                    // never blocks on a full buffer.
                    if n > room {
                        sink.truncated = true;
                    }
                    sink.data.extend_from_slice(&buf[..n.min(room)]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = done.send(());
    });
    capture
}

fn take_capture(capture: &Mutex<Capture>) -> (Vec<u8>, bool) {
    let mut capture = lock(capture);
    (std::mem::take(&mut capture.data), capture.truncated)
}

/// Block until `pid` has exited, leaving it unreaped.
#[cfg(unix)]
fn wait_exited(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: an all-zero siginfo_t is a valid out-parameter.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is a valid, writable siginfo_t.
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Non-blocking: has `pid` exited? Leaves it unreaped.
#[cfg(unix)]
fn leader_exited(pid: u32) -> bool {
    // SAFETY: an all-zero siginfo_t is a valid out-parameter.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    // SAFETY: `info` is a valid, writable siginfo_t.
    let ret = unsafe {
        libc::waitid(
            libc::P_PID,
            pid as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    // With WNOHANG and nothing to report, si_pid stays zero.
    ret == 0 && siginfo_pid(&info) != 0
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn siginfo_pid(info: &libc::siginfo_t) -> libc::pid_t {
    // SAFETY: waitid fills the SIGCHLD layout that si_pid reads.
    unsafe { info.si_pid() }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn siginfo_pid(info: &libc::siginfo_t) -> libc::pid_t {
    info.si_pid
}

/// A watchdog kill only counts if the leader actually died of it. A leader
/// that exited on its own as the timer fired has a normal exit status.
#[cfg(unix)]
fn killed_by_watchdog(watchdog_fired: bool, signal: Option<i32>) -> bool {
    watchdog_fired && signal == Some(libc::SIGKILL)
}

#[cfg(unix)]
fn reap(pid: u32) -> io::Result<(libc::c_int, RawUsage)> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: an all-zero rusage is a valid out-parameter.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: both out-pointers refer to live locals.
        let ret = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage) };
        if ret == pid as libc::pid_t {
            return Ok((status, raw_usage(&usage)));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn raw_usage(usage: &libc::rusage) -> RawUsage {
    fn millis(tv: &libc::timeval) -> u64 {
        (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000
    }
    let max_rss = usage.ru_maxrss.max(0) as u64;
    // macOS reports bytes, Linux kilobytes.
    #[cfg(target_os = "macos")]
    let max_rss = max_rss / 1024;
    RawUsage {
        user_time_ms: millis(&usage.ru_utime),
        system_time_ms: millis(&usage.ru_stime),
        max_rss_kb: max_rss,
    }
}

#[cfg(unix)]
fn decode_status(status: libc::c_int) -> (Option<i32>, Option<i32>) {
    if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(libc::WTERMSIG(status)))
    } else {
        (None, None)
    }
}
