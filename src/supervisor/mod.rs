//! Process supervision for worker commands.
//!
//! [`Supervisor::supervise`] launches one worker and waits for a terminal
//! outcome. While waiting it emits periodic progress notices, optionally a
//! detailed status line, and stall alerts. It never returns early without
//! a terminal outcome, and a worker it launched never outlives it: dropping
//! the supervise future kills the worker's process group.

pub mod process;
pub mod watch;

use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Timing;
pub use process::{OsWorker, WorkerSpec};
pub use watch::{
    Clock, FsLogProbe, Liveness, LogProbe, LogStat, Notices, StallDetector, SystemClock,
    WatchState, Worker, WorkerExit,
};

/// Timing parameters for one supervised worker.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperviseParams {
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub status_interval: Option<Duration>,
    /// `None` disables stall detection.
    pub stall_timeout: Option<Duration>,
    /// Terminate on stall; otherwise warn once per episode and keep waiting.
    pub stall_kill: bool,
    /// Terminate a warn-only stall once it lasts this long.
    pub stall_hard_limit: Option<Duration>,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl From<&Timing> for SuperviseParams {
    fn from(t: &Timing) -> Self {
        Self {
            poll_interval: t.poll_interval,
            progress_interval: t.progress_interval,
            status_interval: t.status_interval,
            stall_timeout: t.stall_timeout,
            stall_kill: t.stall_kill,
            stall_hard_limit: t.stall_hard_limit,
            kill_grace: t.kill_grace,
        }
    }
}

/// Why a worker did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFault {
    ExitCode(i32),
    Signal(i32),
    Stalled { idle: Duration },
    Spawn(String),
    Supervision(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Completed,
    Failed(WorkerFault),
}

/// Terminal outcome of one supervised worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub status: ProcessStatus,
    pub state: WatchState,
    pub exit: Option<WorkerExit>,
    pub duration: Duration,
    /// Stall episodes observed (warn-only mode can see several).
    pub stall_warnings: u32,
}

impl ProcessOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == ProcessStatus::Completed
    }

    fn spawn_failure(message: String) -> Self {
        Self {
            status: ProcessStatus::Failed(WorkerFault::Spawn(message)),
            state: WatchState::Failed,
            exit: None,
            duration: Duration::ZERO,
            stall_warnings: 0,
        }
    }
}

/// Launches and watches worker processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    params: SuperviseParams,
    status_log: Option<PathBuf>,
    alerts_log: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(params: SuperviseParams) -> Self {
        Self {
            params,
            status_log: None,
            alerts_log: None,
        }
    }

    pub fn with_notice_logs(mut self, status_log: PathBuf, alerts_log: PathBuf) -> Self {
        self.status_log = Some(status_log);
        self.alerts_log = Some(alerts_log);
        self
    }

    /// Run `spec` to a terminal outcome.
    pub async fn supervise(&self, spec: &WorkerSpec) -> ProcessOutcome {
        if let Some(parent) = spec.log.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            return ProcessOutcome::spawn_failure(format!(
                "cannot create log directory {}: {}",
                parent.display(),
                e
            ));
        }
        for notice_log in [&self.status_log, &self.alerts_log].into_iter().flatten() {
            if let Some(parent) = notice_log.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
        }

        info!(task = %spec.label, state = %WatchState::Starting, log = %spec.log.display(), "Launching worker");
        let mut worker = match OsWorker::spawn(spec) {
            Ok(worker) => worker,
            Err(e) => {
                warn!(task = %spec.label, error = %e, "Worker failed to start");
                return ProcessOutcome::spawn_failure(e.to_string());
            }
        };
        let notices = Notices {
            label: spec.label.clone(),
            log: spec.log.clone(),
            status_log: self.status_log.clone(),
            alerts_log: self.alerts_log.clone(),
        };
        let outcome =
            watch::watch(&mut worker, &SystemClock, &FsLogProbe, &self.params, &notices).await;
        info!(
            task = %spec.label,
            state = %outcome.state,
            duration = %crate::util::format_duration(outcome.duration),
            "Worker finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params() -> SuperviseParams {
        SuperviseParams {
            poll_interval: Duration::from_millis(50),
            progress_interval: Duration::from_secs(60),
            status_interval: Some(Duration::from_millis(100)),
            stall_timeout: Some(Duration::from_secs(5)),
            stall_kill: true,
            stall_hard_limit: None,
            kill_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_supervise_creates_log_directories() {
        let dir = tempdir().unwrap();
        let spec = WorkerSpec {
            label: "main/a".into(),
            command: "echo done; sleep 0.3".into(),
            cwd: dir.path().to_path_buf(),
            env: Vec::new(),
            log: dir.path().join("logs/run/main-a-1.log"),
        };
        let supervisor = Supervisor::new(params()).with_notice_logs(
            dir.path().join("logs/status.log"),
            dir.path().join("logs/alerts.log"),
        );
        let outcome = supervisor.supervise(&spec).await;
        assert!(outcome.succeeded());
        assert!(std::fs::read_to_string(&spec.log).unwrap().contains("done"));
        assert!(dir.path().join("logs/status.log").exists());
    }

    #[tokio::test]
    async fn test_supervise_reports_spawn_failure() {
        let dir = tempdir().unwrap();
        let spec = WorkerSpec {
            label: "main/a".into(),
            command: "true".into(),
            cwd: dir.path().join("missing-dir"),
            env: Vec::new(),
            log: dir.path().join("a.log"),
        };
        let outcome = Supervisor::new(params()).supervise(&spec).await;
        assert!(matches!(
            outcome.status,
            ProcessStatus::Failed(WorkerFault::Spawn(_))
        ));
    }

    #[test]
    fn test_params_from_timing() {
        let timing = Timing {
            poll_interval: Duration::from_secs(2),
            progress_interval: Duration::from_secs(60),
            status_interval: None,
            stall_timeout: Some(Duration::from_secs(900)),
            stall_kill: false,
            stall_hard_limit: Some(Duration::from_secs(3600)),
            kill_grace: Duration::from_secs(5),
        };
        let p = SuperviseParams::from(&timing);
        assert!(!p.stall_kill);
        assert_eq!(p.stall_hard_limit, Some(Duration::from_secs(3600)));
    }
}
