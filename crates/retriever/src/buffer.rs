//! Free-space backoff for the `in/` filesystem.
//!
//! The retriever reserves a buffer on the filesystem receiving staged files.
//! Consuming the buffer past the backlog threshold pauses new workers;
//! consuming it past the kill threshold kills the running ones, because a
//! tape client that fills the filesystem mid-retrieve leaves far worse wreck
//! than a killed session.

use std::io;
use std::path::Path;

/// What the current free space allows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Plenty of room; spawn freely.
    Ok,
    /// Buffer under backlog pressure; do not spawn new workers this pass.
    Backlog,
    /// Buffer nearly exhausted; kill running workers.
    Kill,
}

/// Free-space snapshot of a filesystem.
#[derive(Clone, Copy, Debug)]
pub struct FsUsage {
    /// Total size in bytes.
    pub total: u64,
    /// Bytes available to unprivileged writers.
    pub avail: u64,
}

/// Reads the filesystem usage behind `path`.
///
/// # Errors
///
/// Propagates the underlying `statvfs` failure.
pub fn fs_usage(path: &Path) -> io::Result<FsUsage> {
    let vfs = rustix::fs::statvfs(path)?;
    Ok(FsUsage {
        total: vfs.f_frsize.saturating_mul(vfs.f_blocks),
        avail: vfs.f_frsize.saturating_mul(vfs.f_bavail),
    })
}

/// Applies the two buffer thresholds to a usage snapshot.
///
/// The reserved buffer is `buffersize`, shrunk to half the filesystem when
/// the filesystem is smaller than the configured reserve. `backlog_pct` and
/// `kill_pct` are the configured percentages of the buffer that may be
/// consumed before each reaction.
#[must_use]
pub fn buffer_state(
    usage: FsUsage,
    buffersize: u64,
    backlog_pct: u64,
    kill_pct: u64,
) -> BufferState {
    let buffer = if usage.total < buffersize {
        usage.total / 2
    } else {
        buffersize
    };

    let kill_floor = buffer.saturating_mul(100u64.saturating_sub(kill_pct)) / 100;
    let backlog_floor = buffer.saturating_mul(100u64.saturating_sub(backlog_pct)) / 100;

    if usage.avail <= kill_floor {
        BufferState::Kill
    } else if usage.avail <= backlog_floor {
        BufferState::Backlog
    } else {
        BufferState::Ok
    }
}
