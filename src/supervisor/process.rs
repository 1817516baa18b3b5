//! OS-backed worker processes.
//!
//! Workers run as `sh -c <command>` in their own process group with stdout
//! and stderr appended to the task log. Termination signals the whole group
//! so that helpers spawned by the worker go down with it.

use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

use super::watch::{Worker, WorkerExit};

const REAP_POLL: Duration = Duration::from_millis(50);

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub label: String,
    pub command: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub log: PathBuf,
}

fn to_exit(status: ExitStatus) -> WorkerExit {
    match status.code() {
        Some(code) => WorkerExit::Code(code),
        None => WorkerExit::Signal(status.signal().unwrap_or(libc::SIGKILL)),
    }
}

fn signal_group(pgid: u32, signal: i32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid targets the process group we created.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(pgid, signal, error = %std::io::Error::last_os_error(), "Signal not delivered");
    }
}

/// A spawned worker process.
#[derive(Debug)]
pub struct OsWorker {
    child: Child,
    pid: Option<u32>,
    reaped: bool,
}

impl OsWorker {
    /// Spawn the worker with output appended to `spec.log`.
    pub fn spawn(spec: &WorkerSpec) -> std::io::Result<Self> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log)?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .process_group(0)
            .kill_on_drop(true);
        let child = cmd.spawn()?;
        let pid = child.id();
        debug!(task = %spec.label, pid = ?pid, cwd = %spec.cwd.display(), "Worker spawned");
        Ok(Self {
            child,
            pid,
            reaped: false,
        })
    }
}

#[async_trait]
impl Worker for OsWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_exit(&mut self) -> std::io::Result<Option<WorkerExit>> {
        if self.reaped {
            return Ok(None);
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.reaped = true;
                Ok(Some(to_exit(status)))
            }
            None => Ok(None),
        }
    }

    async fn terminate(&mut self, grace: Duration) -> std::io::Result<WorkerExit> {
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGTERM);
        }
        let mut waited = Duration::ZERO;
        while waited < grace {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                return Ok(to_exit(status));
            }
            tokio::time::sleep(REAP_POLL).await;
            waited += REAP_POLL;
        }
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGKILL);
        }
        let _ = self.child.start_kill();
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(to_exit(status))
    }
}

impl Drop for OsWorker {
    fn drop(&mut self) {
        if !self.reaped
            && let Some(pid) = self.pid
        {
            signal_group(pid, libc::SIGKILL);
        }
    }
}
