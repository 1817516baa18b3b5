//! Single-writer run lock.
//!
//! The lock is the existence of `<state_dir>/run.lock`, created atomically
//! with `create_new`. The file carries a JSON payload naming the holder so
//! operators can see who owns it. Release happens exactly once, either
//! explicitly or when the guard drops (including during unwinding and when
//! the run future is cancelled by a signal).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};

/// Payload written into the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub run_id: String,
    pub phase: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(run_id: &str, phase: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }
}

/// Handle to the lock file location.
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock or fail with `LockContention` naming the current holder.
    pub fn acquire(&self, info: LockInfo) -> EngineResult<LockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(EngineError::LockContention {
                    path: self.path.clone(),
                    holder: self.holder_label(),
                    phase: Some(info.phase),
                });
            }
            Err(e) => return Err(EngineError::io(&self.path, e)),
        };

        let payload = serde_json::to_string(&info).map_err(anyhow::Error::from)?;
        let written = file
            .write_all(payload.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all());
        if let Err(e) = written {
            // The file exists but is unusable; do not leave a phantom holder.
            let _ = fs::remove_file(&self.path);
            return Err(EngineError::io(&self.path, e));
        }

        debug!(path = %self.path.display(), run_id = %info.run_id, phase = %info.phase, "Run lock acquired");
        Ok(LockGuard {
            path: self.path.clone(),
            run_id: info.run_id,
            released: false,
        })
    }

    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Parsed payload, if the lock exists and holds valid JSON.
    pub fn holder(&self) -> Option<LockInfo> {
        let content = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(content.trim()).ok()
    }

    fn holder_label(&self) -> String {
        match self.holder() {
            Some(info) => format!("{} (pid {}, phase '{}')", info.run_id, info.pid, info.phase),
            None => "unknown".to_string(),
        }
    }

    /// Gate for post-run phases: fail with `RunInProgress` while the lock exists.
    pub fn ensure_absent(&self, phase: &str) -> EngineResult<()> {
        if self.is_held() {
            return Err(EngineError::RunInProgress {
                path: self.path.clone(),
                holder: self.holder_label(),
                phase: phase.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a lock left behind by a crashed run.
    ///
    /// Without `force`, refuses when the recorded holder pid is still alive.
    pub fn clear(&self, force: bool) -> EngineResult<Option<LockInfo>> {
        if !self.is_held() {
            return Ok(None);
        }
        let holder = self.holder();
        if !force
            && let Some(info) = &holder
            && pid_alive(info.pid)
        {
            return Err(EngineError::LockContention {
                path: self.path.clone(),
                holder: self.holder_label(),
                phase: Some(info.phase.clone()),
            });
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(holder),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(holder),
            Err(e) => Err(EngineError::io(&self.path, e)),
        }
    }
}

/// Probe whether a process exists without signalling it.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Proof of lock ownership. Removes the lock file when released or dropped,
/// but only while the file still names this guard's run.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    run_id: String,
    released: bool,
}

impl LockGuard {
    /// Release the lock explicitly, surfacing removal errors.
    pub fn release(mut self) -> EngineResult<()> {
        self.released = true;
        self.remove()
    }

    fn remove(&self) -> EngineResult<()> {
        let owned = fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| serde_json::from_str::<LockInfo>(c.trim()).ok())
            .is_some_and(|info| info.run_id == self.run_id);
        if !owned {
            warn!(path = %self.path.display(), run_id = %self.run_id, "Lock file no longer held by this run; leaving it");
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Run lock released");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(&self.path, e)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.remove() {
                warn!(error = %e, "Failed to release run lock");
            }
        }
    }
}
