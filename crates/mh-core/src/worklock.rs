//! Short-lived file locks for workspace mutations.
//!
//! Specification numbering and store writes take a lock file created with
//! `O_CREAT | O_EXCL`: when two processes race, exactly one wins the create.
//! The lock file holds the owner's PID so a lock left behind by a crashed
//! process can be detected (`kill(pid, 0)`) and reclaimed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock at {path} held by pid {pid}")]
    Held { path: String, pid: u32 },
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An exclusive lock over a workspace resource, released on drop.
#[derive(Debug)]
pub struct WorkLock {
    path: PathBuf,
}

impl WorkLock {
    /// Try once to create the lock file. A stale lock (dead owner) is
    /// removed and the acquire retried a single time.
    pub fn try_acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let pid = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match pid {
                        Some(pid) if pid_alive(pid) => {
                            return Err(LockError::Held {
                                path: path.display().to_string(),
                                pid,
                            });
                        }
                        _ if attempt == 0 => {
                            tracing::info!(path = %path.display(), "removing stale lock file");
                            let _ = std::fs::remove_file(&path);
                        }
                        _ => return Err(LockError::Io(e)),
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }
        }
        unreachable!("acquire loop exits via return")
    }

    /// Acquire with bounded blocking: poll until `timeout` elapses.
    pub fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, LockError> {
        let path = path.into();
        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_acquire(&path) {
                Ok(lock) => return Ok(lock),
                Err(LockError::Held { .. }) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        {
            let _lock = WorkLock::try_acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let _lock = WorkLock::try_acquire(&path).unwrap();
        match WorkLock::try_acquire(&path) {
            Err(LockError::Held { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        // PID 4_000_000 is extremely unlikely to exist.
        std::fs::write(&path, "4000000").unwrap();
        let _lock = WorkLock::try_acquire(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn blocking_acquire_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let _held = WorkLock::try_acquire(&path).unwrap();
        let res = WorkLock::acquire(&path, Duration::from_millis(80));
        assert!(matches!(res, Err(LockError::Held { .. })));
    }

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
