//! PID File
//!
//! Detects an already-running instance. The file holds the decimal PID plus
//! a line terminator and is written only after this process wins the
//! exclusive lock; the lock itself is the authority, the recorded PID only
//! feeds diagnostics. Inconclusive evidence (unreadable file, liveness
//! probe failure) resolves toward "proceed": a false "other instance
//! running" refuses service for nothing, while a rare double start is still
//! caught by the locking step.

use crate::{IpcError, Result};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Held for the process lifetime; the file is removed on drop
pub struct PidFile {
    path: PathBuf,
    lock: Flock<File>,
}

impl PidFile {
    /// Claim the instance's PID file, refusing when a live process holds it
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(previous) = read_recorded_pid(path) {
            match process_alive(previous) {
                Some(true) => debug!(
                    pid = previous,
                    "PID file names a live process; the lock decides"
                ),
                Some(false) => debug!(pid = previous, "PID file is stale"),
                None => debug!(pid = previous, "liveness probe inconclusive; proceeding"),
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| IpcError::io(format!("opening PID file {}", path.display()), e))?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) => {
                let holder = read_recorded_pid(path).unwrap_or(-1);
                warn!(path = %path.display(), %errno, holder, "PID file is locked");
                return Err(IpcError::AlreadyRunning { pid: holder });
            }
        };

        lock.set_len(0)
            .map_err(|e| IpcError::io("truncating PID file", e))?;
        let mut writer: &File = &lock;
        writeln!(writer, "{}", std::process::id())
            .and_then(|_| writer.flush())
            .map_err(|e| IpcError::io("writing PID file", e))?;

        info!(path = %path.display(), pid = std::process::id(), "PID file acquired");
        Ok(Self {
            path: path.to_path_buf(),
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove PID file");
        }
        // The lock itself is released when `self.lock` drops.
    }
}

impl std::fmt::Debug for PidFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidFile").field("path", &self.path).finish()
    }
}

fn read_recorded_pid(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Signal-zero probe: `Some(alive)` when the kernel gave a clear answer
fn process_alive(pid: i32) -> Option<bool> {
    if pid <= 0 {
        return Some(false);
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Some(true),
        Err(nix::errno::Errno::ESRCH) => Some(false),
        // EPERM means it exists but is not ours; anything else is unclear.
        Err(nix::errno::Errno::EPERM) => Some(true),
        Err(_) => None,
    }
}
