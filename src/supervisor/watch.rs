//! Log-activity watch loop.
//!
//! Liveness is judged only by the worker's log file changing (size or
//! modification time). The loop is generic over the worker, the clock and
//! the log probe so that timing behavior can be tested deterministically.

use async_trait::async_trait;
use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use super::{ProcessOutcome, ProcessStatus, SuperviseParams, WorkerFault};
use crate::util::format_duration;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(self, WorkerExit::Code(0))
    }
}

/// A running worker as seen by the watch loop.
#[async_trait]
pub trait Worker: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> std::io::Result<Option<WorkerExit>>;

    /// Ask the worker to stop, escalate after `grace`, and reap it.
    async fn terminate(&mut self, grace: Duration) -> std::io::Result<WorkerExit>;
}

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Observable state of a log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStat {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

pub trait LogProbe: Send + Sync {
    fn stat(&self, path: &Path) -> Option<LogStat>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsLogProbe;

impl LogProbe for FsLogProbe {
    fn stat(&self, path: &Path) -> Option<LogStat> {
        let meta = std::fs::metadata(path).ok()?;
        Some(LogStat {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

/// Result of one stall check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Quiet { idle: Duration },
    /// `newly` is set on the first observation of a stall episode.
    Stalled { idle: Duration, newly: bool },
}

/// Pure stall detector: feed it observations, it reports liveness.
///
/// The baseline is the log state at launch, so a worker that never writes
/// is measured as idle from time zero.
#[derive(Debug, Clone)]
pub struct StallDetector {
    timeout: Option<Duration>,
    last_stat: Option<LogStat>,
    last_activity: Instant,
    stalled: bool,
}

impl StallDetector {
    pub fn new(started: Instant, timeout: Option<Duration>, baseline: Option<LogStat>) -> Self {
        Self {
            timeout,
            last_stat: baseline,
            last_activity: started,
            stalled: false,
        }
    }

    pub fn observe(&mut self, now: Instant, stat: Option<LogStat>) -> Liveness {
        if stat != self.last_stat {
            self.last_stat = stat;
            self.last_activity = now;
            self.stalled = false;
            return Liveness::Active;
        }
        let idle = now.saturating_duration_since(self.last_activity);
        match self.timeout {
            Some(timeout) if idle >= timeout => {
                let newly = !self.stalled;
                self.stalled = true;
                Liveness::Stalled { idle, newly }
            }
            _ => Liveness::Quiet { idle },
        }
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
}

/// Lifecycle of a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Starting,
    Running,
    Stalled,
    Completed,
    Failed,
    Killed,
}

impl std::fmt::Display for WatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatchState::Starting => "starting",
            WatchState::Running => "running",
            WatchState::Stalled => "stalled",
            WatchState::Completed => "completed",
            WatchState::Failed => "failed",
            WatchState::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Where the watch loop reports progress.
#[derive(Debug, Clone)]
pub struct Notices {
    /// Human label, e.g. `main/core`.
    pub label: String,
    pub log: PathBuf,
    pub status_log: Option<PathBuf>,
    pub alerts_log: Option<PathBuf>,
}

fn append_line(path: &Path, line: &str) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to append notice");
    }
}

fn stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn finished(exit: WorkerExit, elapsed: Duration, stall_warnings: u32) -> ProcessOutcome {
    let (status, state) = match exit {
        WorkerExit::Code(0) => (ProcessStatus::Completed, WatchState::Completed),
        WorkerExit::Code(code) => (
            ProcessStatus::Failed(WorkerFault::ExitCode(code)),
            WatchState::Failed,
        ),
        WorkerExit::Signal(sig) => (
            ProcessStatus::Failed(WorkerFault::Signal(sig)),
            WatchState::Failed,
        ),
    };
    ProcessOutcome {
        status,
        state,
        exit: Some(exit),
        duration: elapsed,
        stall_warnings,
    }
}

/// Poll `worker` until it exits or is killed for stalling.
///
/// Each tick checks exit status first, so a worker that exits on the same
/// tick a stall would be declared is reported by its exit status.
pub async fn watch<W, C, P>(
    worker: &mut W,
    clock: &C,
    probe: &P,
    params: &SuperviseParams,
    notices: &Notices,
) -> ProcessOutcome
where
    W: Worker + ?Sized,
    C: Clock + ?Sized,
    P: LogProbe + ?Sized,
{
    let started = clock.now();
    let mut detector = StallDetector::new(started, params.stall_timeout, probe.stat(&notices.log));
    let mut state = WatchState::Running;
    let mut stall_warnings = 0u32;
    let mut next_progress = started + params.progress_interval;
    let mut next_status = params.status_interval.map(|i| started + i);

    loop {
        match worker.try_exit() {
            Ok(Some(exit)) => {
                let elapsed = clock.now().saturating_duration_since(started);
                debug!(task = %notices.label, ?exit, elapsed = %format_duration(elapsed), "Worker exited");
                return finished(exit, elapsed, stall_warnings);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(task = %notices.label, error = %e, "Lost track of worker; terminating");
                let _ = worker.terminate(params.kill_grace).await;
                return ProcessOutcome {
                    status: ProcessStatus::Failed(WorkerFault::Supervision(e.to_string())),
                    state: WatchState::Killed,
                    exit: None,
                    duration: clock.now().saturating_duration_since(started),
                    stall_warnings,
                };
            }
        }

        let now = clock.now();
        let stat = probe.stat(&notices.log);
        let log_bytes = stat.as_ref().map_or(0, |s| s.len);
        match detector.observe(now, stat) {
            Liveness::Active => {
                if state == WatchState::Stalled {
                    info!(task = %notices.label, "Log activity resumed");
                    state = WatchState::Running;
                }
            }
            Liveness::Quiet { .. } => {}
            Liveness::Stalled { idle, newly } => {
                if newly {
                    stall_warnings += 1;
                    state = WatchState::Stalled;
                    warn!(
                        task = %notices.label,
                        idle_secs = idle.as_secs(),
                        log = %notices.log.display(),
                        "No log activity"
                    );
                    if let Some(alerts) = &notices.alerts_log {
                        append_line(
                            alerts,
                            &format!(
                                "{} [ALERT] {} stalled: no log activity for {}s (log: {})",
                                stamp(),
                                notices.label,
                                idle.as_secs(),
                                notices.log.display()
                            ),
                        );
                    }
                }
                let over_hard_limit = params.stall_hard_limit.is_some_and(|limit| idle >= limit);
                if params.stall_kill || over_hard_limit {
                    if let Ok(Some(exit)) = worker.try_exit() {
                        let elapsed = clock.now().saturating_duration_since(started);
                        return finished(exit, elapsed, stall_warnings);
                    }
                    warn!(
                        task = %notices.label,
                        pid = ?worker.pid(),
                        idle_secs = idle.as_secs(),
                        "Terminating stalled worker"
                    );
                    let exit = match worker.terminate(params.kill_grace).await {
                        Ok(exit) => Some(exit),
                        Err(e) => {
                            warn!(task = %notices.label, error = %e, "Failed to terminate worker");
                            None
                        }
                    };
                    return ProcessOutcome {
                        status: ProcessStatus::Failed(WorkerFault::Stalled { idle }),
                        state: WatchState::Killed,
                        exit,
                        duration: clock.now().saturating_duration_since(started),
                        stall_warnings,
                    };
                }
            }
        }

        let elapsed = now.saturating_duration_since(started);
        if now >= next_progress {
            info!(task = %notices.label, elapsed = %format_duration(elapsed), "Still running");
            while next_progress <= now {
                next_progress += params.progress_interval;
            }
        }
        if let (Some(due), Some(interval)) = (next_status, params.status_interval)
            && now >= due
        {
            let line = format!(
                "{} [STATUS] {} state={} elapsed={} log_bytes={} idle={}s pid={}",
                stamp(),
                notices.label,
                state,
                format_duration(elapsed),
                log_bytes,
                detector.idle(now).as_secs(),
                worker.pid().map_or_else(|| "-".to_string(), |p| p.to_string()),
            );
            debug!("{}", line);
            if let Some(status_log) = &notices.status_log {
                append_line(status_log, &line);
            }
            let mut next = due;
            while next <= now {
                next += interval;
            }
            next_status = Some(next);
        }

        clock.sleep(params.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Deterministic clock; `sleep` advances time instantly.
    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        fn elapsed(&self) -> Duration {
            *self.offset.lock().unwrap()
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + self.elapsed()
        }

        async fn sleep(&self, duration: Duration) {
            *self.offset.lock().unwrap() += duration;
        }
    }

    /// Worker that exits with `code` once the clock reaches `exit_at`.
    struct ScriptedWorker {
        clock: Arc<ManualClock>,
        exit_at: Option<(Duration, i32)>,
        terminated: bool,
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_exit(&mut self) -> std::io::Result<Option<WorkerExit>> {
            Ok(match self.exit_at {
                Some((at, code)) if self.clock.elapsed() >= at => Some(WorkerExit::Code(code)),
                _ => None,
            })
        }

        async fn terminate(&mut self, _grace: Duration) -> std::io::Result<WorkerExit> {
            self.terminated = true;
            Ok(WorkerExit::Signal(libc::SIGTERM))
        }
    }

    /// Log that grows during the listed windows of clock time.
    struct ScriptedLog {
        clock: Arc<ManualClock>,
        active: Vec<(Duration, Duration)>,
    }

    impl LogProbe for ScriptedLog {
        fn stat(&self, _path: &Path) -> Option<LogStat> {
            let now = self.clock.elapsed();
            // Bytes written so far: one per millisecond inside active windows.
            let len: u128 = self
                .active
                .iter()
                .map(|(from, to)| {
                    let end = now.min(*to);
                    end.saturating_sub(*from).as_millis()
                })
                .sum();
            Some(LogStat {
                len: len as u64,
                modified: None,
            })
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn params(timeout: u64, kill: bool) -> SuperviseParams {
        SuperviseParams {
            poll_interval: secs(1),
            progress_interval: secs(60),
            status_interval: None,
            stall_timeout: Some(secs(timeout)),
            stall_kill: kill,
            stall_hard_limit: None,
            kill_grace: secs(1),
        }
    }

    fn notices() -> Notices {
        Notices {
            label: "main/test".into(),
            log: PathBuf::from("/nonexistent/test.log"),
            status_log: None,
            alerts_log: None,
        }
    }

    fn fixture(
        exit_at: Option<(u64, i32)>,
        active: &[(u64, u64)],
    ) -> (Arc<ManualClock>, ScriptedWorker, ScriptedLog) {
        let clock = ManualClock::new();
        let worker = ScriptedWorker {
            clock: clock.clone(),
            exit_at: exit_at.map(|(at, code)| (secs(at), code)),
            terminated: false,
        };
        let log = ScriptedLog {
            clock: clock.clone(),
            active: active.iter().map(|(a, b)| (secs(*a), secs(*b))).collect(),
        };
        (clock, worker, log)
    }

    #[test]
    fn test_detector_idle_from_launch() {
        let t0 = Instant::now();
        let mut d = StallDetector::new(t0, Some(secs(10)), None);
        assert_eq!(d.observe(t0 + secs(5), None), Liveness::Quiet { idle: secs(5) });
        assert_eq!(
            d.observe(t0 + secs(10), None),
            Liveness::Stalled {
                idle: secs(10),
                newly: true
            }
        );
        assert_eq!(
            d.observe(t0 + secs(11), None),
            Liveness::Stalled {
                idle: secs(11),
                newly: false
            }
        );
        assert!(d.is_stalled());
    }

    #[test]
    fn test_detector_activity_resets_episode() {
        let t0 = Instant::now();
        let stat = |len| {
            Some(LogStat {
                len,
                modified: None,
            })
        };
        let mut d = StallDetector::new(t0, Some(secs(3)), stat(0));
        assert!(matches!(d.observe(t0 + secs(3), stat(0)), Liveness::Stalled { .. }));
        assert_eq!(d.observe(t0 + secs(4), stat(10)), Liveness::Active);
        assert!(!d.is_stalled());
        assert_eq!(d.observe(t0 + secs(6), stat(10)), Liveness::Quiet { idle: secs(2) });
        assert_eq!(
            d.observe(t0 + secs(7), stat(10)),
            Liveness::Stalled {
                idle: secs(3),
                newly: true
            }
        );
    }

    #[test]
    fn test_detector_without_timeout_never_stalls() {
        let t0 = Instant::now();
        let mut d = StallDetector::new(t0, None, None);
        assert!(matches!(d.observe(t0 + secs(100_000), None), Liveness::Quiet { .. }));
    }

    #[tokio::test]
    async fn test_clean_exit_completes() {
        let (clock, mut worker, log) = fixture(Some((5, 0)), &[(0, 5)]);
        let outcome = watch(&mut worker, clock.as_ref(), &log, &params(10, true), &notices()).await;
        assert_eq!(outcome.status, ProcessStatus::Completed);
        assert_eq!(outcome.state, WatchState::Completed);
        assert_eq!(outcome.duration, secs(5));
        assert!(!worker.terminated);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_code() {
        let (clock, mut worker, log) = fixture(Some((2, 3)), &[(0, 2)]);
        let outcome = watch(&mut worker, clock.as_ref(), &log, &params(10, true), &notices()).await;
        assert_eq!(outcome.status, ProcessStatus::Failed(WorkerFault::ExitCode(3)));
    }

    #[tokio::test]
    async fn test_silent_worker_is_killed_within_one_poll_of_timeout() {
        let (clock, mut worker, log) = fixture(None, &[]);
        let p = params(10, true);
        let outcome = watch(&mut worker, clock.as_ref(), &log, &p, &notices()).await;
        match outcome.status {
            ProcessStatus::Failed(WorkerFault::Stalled { idle }) => {
                assert!(idle >= secs(10));
                assert!(idle <= secs(10) + p.poll_interval);
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(worker.terminated);
        assert_eq!(outcome.state, WatchState::Killed);
        assert!(clock.elapsed() <= secs(11));
    }

    #[tokio::test]
    async fn test_stall_measured_from_last_activity() {
        let (clock, mut worker, log) = fixture(None, &[(0, 20)]);
        let outcome = watch(&mut worker, clock.as_ref(), &log, &params(10, true), &notices()).await;
        assert!(matches!(
            outcome.status,
            ProcessStatus::Failed(WorkerFault::Stalled { .. })
        ));
        let killed_at = clock.elapsed();
        assert!(killed_at >= secs(30) && killed_at <= secs(31), "{killed_at:?}");
    }

    #[tokio::test]
    async fn test_exit_on_stall_tick_reports_exit_status() {
        let (clock, mut worker, log) = fixture(Some((10, 0)), &[]);
        let outcome = watch(&mut worker, clock.as_ref(), &log, &params(10, true), &notices()).await;
        assert_eq!(outcome.status, ProcessStatus::Completed);
        assert!(!worker.terminated);
    }

    #[tokio::test]
    async fn test_warn_only_mode_keeps_waiting() {
        let (clock, mut worker, log) = fixture(Some((100, 0)), &[(0, 5), (40, 45)]);
        let outcome =
            watch(&mut worker, clock.as_ref(), &log, &params(10, false), &notices()).await;
        assert_eq!(outcome.status, ProcessStatus::Completed);
        // Two separate silent stretches, two episodes.
        assert_eq!(outcome.stall_warnings, 2);
        assert!(!worker.terminated);
    }

    #[tokio::test]
    async fn test_hard_limit_kills_in_warn_only_mode() {
        let (clock, mut worker, log) = fixture(None, &[]);
        let mut p = params(10, false);
        p.stall_hard_limit = Some(secs(30));
        let outcome = watch(&mut worker, clock.as_ref(), &log, &p, &notices()).await;
        assert!(matches!(
            outcome.status,
            ProcessStatus::Failed(WorkerFault::Stalled { idle }) if idle >= secs(30)
        ));
        assert_eq!(outcome.stall_warnings, 1);
        assert!(worker.terminated);
    }

    #[tokio::test]
    async fn test_notices_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, mut worker, log) = fixture(Some((25, 0)), &[]);
        let mut p = params(10, false);
        p.status_interval = Some(secs(5));
        let n = Notices {
            label: "main/test".into(),
            log: dir.path().join("test.log"),
            status_log: Some(dir.path().join("status.log")),
            alerts_log: Some(dir.path().join("alerts.log")),
        };
        let outcome = watch(&mut worker, clock.as_ref(), &log, &p, &n).await;
        assert_eq!(outcome.status, ProcessStatus::Completed);

        let status = std::fs::read_to_string(dir.path().join("status.log")).unwrap();
        assert_eq!(status.lines().count(), 4);
        assert!(status.contains("[STATUS] main/test"));
        assert!(status.contains("state=stalled"));

        let alerts = std::fs::read_to_string(dir.path().join("alerts.log")).unwrap();
        assert_eq!(alerts.lines().count(), 1);
        assert!(alerts.contains("[ALERT] main/test stalled"));
    }
}
