use std::{process::ExitStatus, time::Duration};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub(crate) const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub(crate) const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// How long to wait for the kernel to reap a SIGKILLed process.
pub(crate) const KILL_WAIT: Duration = Duration::from_secs(2);
/// How long a failed launch waits for the exit watcher to record the code.
pub(crate) const EXIT_CODE_WAIT: Duration = Duration::from_millis(500);
pub(crate) const STDERR_TAIL_LINES: usize = 20;
pub(crate) const STDERR_TAIL_BYTES: u64 = 16 * 1024;

/// Exit code as a shell would report it: signal deaths become `128 + signo`.
pub(crate) fn exit_code(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|s| 128 + s)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Signals the process group led by `pid`, falling back to the bare pid for
/// processes that are not group leaders (e.g. adopted from a pid file).
#[cfg(unix)]
pub(crate) fn signal_process(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    if unsafe { libc::kill(-raw, signal) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(raw, signal) } == 0 {
        return Ok(());
    }
    Err(std::io::Error::last_os_error())
}

/// SIGKILLs whatever is left in the process group `pgid`. The group outlives
/// its leader while members remain; no bare-pid fallback since the leader's
/// pid may already be reused.
#[cfg(unix)]
pub(crate) fn kill_group(pgid: u32) -> std::io::Result<()> {
    let raw = libc::pid_t::try_from(pgid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::kill(-raw, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    Err(std::io::Error::last_os_error())
}

pub(crate) fn is_no_such_process(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
