//! On-disk advisory lock for a project archive.
//!
//! Complements the in-process per-project mutex: a second server process
//! pointed at the same storage root must not interleave commits. The lock
//! is a `create_new` file plus an owner metadata record; a lock whose owner
//! pid is dead, or which outlived the stale window, is broken.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MailroomError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STALE_AFTER_SECS: i64 = 180;

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    created_ts: String,
}

#[derive(Debug)]
pub struct ArchiveLock {
    path: PathBuf,
    held: bool,
}

impl ArchiveLock {
    /// Acquire the lock file, waiting up to `timeout`.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    let owner = LockOwner {
                        pid: std::process::id(),
                        created_ts: crate::model::ts(Utc::now()),
                    };
                    std::fs::write(path, serde_json::to_vec(&owner)?)?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        held: true,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::break_if_stale(path)? {
                        continue;
                    }
                    if std::time::Instant::now() >= deadline {
                        return Err(MailroomError::Lock(format!(
                            "timed out waiting for {}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Remove a lock whose owner is gone. Returns true when broken.
    fn break_if_stale(path: &Path) -> Result<bool> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            // Holder released between our open attempt and this read.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        let owner: Option<LockOwner> = serde_json::from_slice(&raw).ok();
        let stale = match owner {
            // Freshly created, metadata not yet written: not stale.
            None => false,
            Some(owner) => {
                let age_exceeded = crate::model::parse_ts(&owner.created_ts)
                    .map(|created| (Utc::now() - created).num_seconds() > STALE_AFTER_SECS)
                    .unwrap_or(true);
                !pid_alive(owner.pid) || age_exceeded
            }
        };
        if stale {
            warn!(lock = %path.display(), "breaking stale archive lock");
            match std::fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
                Err(err) => Err(err.into()),
            }
        } else {
            Ok(false)
        }
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        if self.held {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(lock = %self.path.display(), error = %err, "failed to remove lock file");
                }
            }
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    // Signal 0 probes for existence without delivering anything. EPERM
    // means the process exists but belongs to another uid, so the lock is
    // still held.
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Without a portable probe, rely on the age window alone.
    true
}
