//! Raw process operations.
//!
//! The daemons probe plugin mover liveness through process groups and signal
//! their tape-client children directly. Handlers and probes go through
//! `libc` so the exact signal semantics (ESRCH vs EPERM) stay visible.

use std::io;

/// Reports whether the process group `pgid` still has live members.
///
/// Sends signal 0 to the group. `EPERM` counts as alive (the group exists but
/// belongs to another user); only `ESRCH` counts as dead. A non-positive
/// `pgid` is treated as dead, matching a malformed or absent request field.
#[must_use]
pub fn process_group_alive(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs only permission and existence
    // checks; no signal is delivered.
    let rc = unsafe { libc::kill(-pgid, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Sends `SIGKILL` to a single process.
///
/// The tape client must be killed with SIGKILL; its own documentation warns
/// that SIGTERM can corrupt its local database.
pub fn kill_process(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGKILL)
}

/// Sends an arbitrary signal to a single process.
///
/// # Errors
///
/// Returns the underlying OS error; `ESRCH` (already gone) is mapped to
/// success since the desired state is reached.
pub fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
    // SAFETY: plain kill(2) on a pid owned by this supervisor.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_group_is_alive() {
        // SAFETY: getpgrp has no failure modes.
        let pgid = unsafe { libc::getpgrp() };
        assert!(process_group_alive(pgid));
    }

    #[test]
    fn nonpositive_pgid_is_dead() {
        assert!(!process_group_alive(0));
        assert!(!process_group_alive(-5));
    }

    #[test]
    fn signalling_a_reaped_pid_is_not_an_error() {
        // pid_max on Linux defaults to 4 million; this pid cannot exist.
        assert!(send_signal(0x3fff_fff0, libc::SIGTERM).is_ok());
    }
}
