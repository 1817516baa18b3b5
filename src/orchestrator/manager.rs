//! Phase manager: drives a run through its phases.
//!
//! For each phase in the resolved plan the manager checks the phase gate,
//! takes the run lock if the phase is privileged, and dispatches the phase's
//! tasks respecting `depends_on`, workspace policy and `max_parallel`. Task
//! state transitions go to the ledger only once their outcome is known.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::artifacts::{ArtifactRef, ArtifactRegistry};
use crate::config::RunConfig;
use crate::errors::{
    EXIT_ARTIFACT_MISSING, EXIT_OK, EXIT_STALL_TIMEOUT, EXIT_WORKER_FAILURE, EXIT_WORKSPACE,
    EngineError, EngineResult,
};
use crate::orchestrator::ledger::{FailureCause, Ledger, LedgerEvent, Replay, TaskState};
use crate::orchestrator::lock::{LockInfo, RunLock};
use crate::orchestrator::new_run_id;
use crate::orchestrator::preflight::preflight;
use crate::orchestrator::report;
use crate::phase::{Phase, PhaseGate, resolve_plan};
use crate::supervisor::{
    ProcessOutcome, ProcessStatus, SuperviseParams, Supervisor, WorkerFault, WorkerSpec,
};
use crate::task_graph::{RenderContext, Selection, Task, TaskPaths};
use crate::util::format_duration;
use crate::workspace::{Finalized, WorkspaceHandle, WorkspacePool};

/// Attempts probed past the ledger's count when branches or paths collide.
const MAX_ATTEMPT_PROBE: u32 = 50;

/// What the caller asked for.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub phase: Option<String>,
    pub include_manual: bool,
    pub resume: bool,
    /// Resume this run instead of the latest one.
    pub run_id: Option<String>,
    /// Validate and report the plan without running anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    Skipped,
    /// Completed by an earlier invocation of the same run.
    AlreadyCompleted,
    /// Never dispatched because the phase stopped first.
    NotStarted,
    /// Dry run only.
    Planned,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub name: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized: Option<Finalized>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    pub optional: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
}

impl TaskReport {
    fn new(task: &Task, status: TaskStatus) -> Self {
        Self {
            name: task.name.clone(),
            status,
            attempt: None,
            cause: None,
            reason: None,
            workspace: None,
            branch: None,
            log: None,
            finalized: None,
            duration_secs: None,
            optional: task.optional,
            artifacts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed,
    /// Waiting on an approval artifact.
    Paused,
    Planned,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub name: String,
    pub status: PhaseStatus,
    pub tasks: Vec<TaskReport>,
    /// Manual tasks awaiting explicit invocation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_manual: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Failure class of a stopped run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WorkerFailure,
    StallTimeout,
    ArtifactMissing,
    Workspace,
}

impl FailureKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureKind::WorkerFailure => EXIT_WORKER_FAILURE,
            FailureKind::StallTimeout => EXIT_STALL_TIMEOUT,
            FailureKind::ArtifactMissing => EXIT_ARTIFACT_MISSING,
            FailureKind::Workspace => EXIT_WORKSPACE,
        }
    }

    fn of(cause: &FailureCause) -> Self {
        match cause {
            FailureCause::Stalled { .. } => FailureKind::StallTimeout,
            FailureCause::ArtifactMissing { .. } => FailureKind::ArtifactMissing,
            FailureCause::Workspace { .. } => FailureKind::Workspace,
            FailureCause::Exit { .. }
            | FailureCause::Signal { .. }
            | FailureCause::Spawn { .. }
            | FailureCause::Supervision { .. } => FailureKind::WorkerFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub phase: String,
    pub task: String,
    pub kind: FailureKind,
    pub cause: FailureCause,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
}

impl From<&RunFailure> for EngineError {
    fn from(failure: &RunFailure) -> Self {
        let log = failure.log.clone().unwrap_or_default();
        match &failure.cause {
            FailureCause::Exit { code } => EngineError::WorkerFailure {
                task: failure.task.clone(),
                exit_code: *code,
                log,
            },
            FailureCause::Signal { signal } => EngineError::WorkerFailure {
                task: failure.task.clone(),
                exit_code: 128 + signal,
                log,
            },
            FailureCause::Stalled { idle_secs } => EngineError::StallTimeout {
                task: failure.task.clone(),
                idle_secs: *idle_secs,
                log,
            },
            FailureCause::ArtifactMissing { name, path } => EngineError::ArtifactMissing {
                phase: failure.phase.clone(),
                name: name.clone(),
                path: path.clone(),
            },
            FailureCause::Workspace { message } => EngineError::Workspace {
                task: failure.task.clone(),
                message: message.clone(),
            },
            FailureCause::Spawn { .. } | FailureCause::Supervision { .. } => {
                EngineError::WorkerFailure {
                    task: failure.task.clone(),
                    exit_code: -1,
                    log,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Paused {
        phase: String,
        artifact: String,
        path: PathBuf,
    },
    Failed(RunFailure),
    DryRun,
}

/// Result of one `run` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested_phase: Option<String>,
    #[serde(flatten)]
    pub status: RunStatus,
    pub phases: Vec<PhaseReport>,
    /// Every artifact exposed or declared by the end of the run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match &self.status {
            RunStatus::Failed(failure) => failure.kind.exit_code(),
            RunStatus::Succeeded | RunStatus::Paused { .. } | RunStatus::DryRun => EXIT_OK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Succeeded,
    Failed,
    Blocked,
}

/// A finished worker handed back to the dispatch loop.
struct Finished {
    index: usize,
    attempt: u32,
    handle: WorkspaceHandle,
    log: PathBuf,
    outcome: ProcessOutcome,
}

fn fault_cause(fault: &WorkerFault) -> FailureCause {
    match fault {
        WorkerFault::ExitCode(code) => FailureCause::Exit { code: *code },
        WorkerFault::Signal(signal) => FailureCause::Signal { signal: *signal },
        WorkerFault::Stalled { idle } => FailureCause::Stalled {
            idle_secs: idle.as_secs(),
        },
        WorkerFault::Spawn(message) => FailureCause::Spawn {
            message: message.clone(),
        },
        WorkerFault::Supervision(message) => FailureCause::Supervision {
            message: message.clone(),
        },
    }
}

fn artifact_env_key(name: &str) -> String {
    let upper: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("FOREMAN_ARTIFACT_{}", upper)
}

/// Drives runs for one resolved configuration.
pub struct PhaseManager {
    config: RunConfig,
    supervisor: Supervisor,
    ledger: Ledger,
    lock: RunLock,
}

impl PhaseManager {
    pub fn new(config: RunConfig) -> Self {
        let supervisor = Supervisor::new(SuperviseParams::from(&config.timing))
            .with_notice_logs(config.status_log.clone(), config.alerts_log.clone());
        let ledger = Ledger::new(&config.ledger_path);
        let lock = RunLock::new(&config.lock_path);
        Self {
            config,
            supervisor,
            ledger,
            lock,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    fn render_ctx<'a>(&'a self, run_id: &'a str, attempt: u32) -> RenderContext<'a> {
        RenderContext {
            run_id,
            attempt,
            project_root: &self.config.project_root,
            workspace_root: &self.config.workspace_root,
            logs_dir: &self.config.logs_dir,
        }
    }

    fn resolve_run_id(&self, request: &RunRequest) -> EngineResult<(String, bool)> {
        if let Some(id) = &request.run_id {
            return Ok((id.clone(), true));
        }
        if request.resume || self.config.resume {
            if let Some(id) = self.ledger.latest_run_id()? {
                return Ok((id, true));
            }
            info!("Nothing to resume; starting a new run");
        }
        Ok((new_run_id(), false))
    }

    /// Execute the plan for `request`.
    ///
    /// Configuration, preflight and lock problems return `Err` before any
    /// workspace is touched. Task-level failures are reported through the
    /// returned outcome.
    pub async fn run(&self, request: &RunRequest) -> EngineResult<RunOutcome> {
        let config = &self.config;
        let skip = if request.phase.is_none() {
            config.skipped_phases()
        } else {
            Vec::new()
        };
        let plan = resolve_plan(&config.phases, request.phase.as_deref(), &skip)?;
        let include_manual = request.include_manual || config.include_manual;
        let selections: Vec<Selection<'_>> = plan
            .iter()
            .map(|p| config.graph.select(&p.name, include_manual))
            .collect::<EngineResult<_>>()?;

        if let Some(requested) = &request.phase
            && config.graph.in_phase(requested).next().is_none()
        {
            return Err(EngineError::config(format!(
                "No tasks defined for phase '{}'",
                requested
            )));
        }

        let (run_id, resumed) = self.resolve_run_id(request)?;
        config.ensure_directories()?;
        preflight(config, &selections, &run_id)?;

        let replay = Replay::from_events(&self.ledger.query(&run_id)?);
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            resumed,
            phases = %plan.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(","),
            "Run starting"
        );

        if request.dry_run {
            let phases = plan
                .iter()
                .zip(&selections)
                .map(|(phase, selection)| self.plan_phase(&run_id, phase, selection, &replay))
                .collect::<EngineResult<Vec<_>>>()?;
            return Ok(RunOutcome {
                run_id,
                resumed,
                started_at,
                finished_at: Utc::now(),
                requested_phase: request.phase.clone(),
                status: RunStatus::DryRun,
                phases,
                artifacts: Vec::new(),
                report_path: None,
            });
        }

        let mut pool = WorkspacePool::open(&config.project_root)?;
        let mut registry = ArtifactRegistry::new(config.artifacts.clone());
        let mut phases = Vec::with_capacity(plan.len());
        let mut status = RunStatus::Succeeded;

        for (phase, selection) in plan.iter().zip(&selections) {
            match &phase.gate {
                PhaseGate::Open => {}
                PhaseGate::LockAbsent => self.lock.ensure_absent(&phase.name)?,
                PhaseGate::Approval { artifact } => {
                    if let Err(EngineError::ArtifactMissing { path, .. }) =
                        registry.require(&phase.name, artifact)
                    {
                        warn!(
                            phase = %phase.name,
                            artifact = %artifact,
                            path = %path.display(),
                            "Approval missing; pausing run"
                        );
                        let now = Utc::now();
                        phases.push(PhaseReport {
                            name: phase.name.clone(),
                            status: PhaseStatus::Paused,
                            tasks: Vec::new(),
                            pending_manual: Vec::new(),
                            started_at: now,
                            finished_at: now,
                        });
                        status = RunStatus::Paused {
                            phase: phase.name.clone(),
                            artifact: artifact.clone(),
                            path,
                        };
                        break;
                    }
                }
            }

            let guard = if phase.privileged {
                Some(self.lock.acquire(LockInfo::new(&run_id, &phase.name))?)
            } else {
                None
            };
            let result = self
                .run_phase(&run_id, phase, selection, &replay, &mut pool, &mut registry)
                .await;
            if let Some(guard) = guard {
                guard.release()?;
            }
            let (report, failure) = result?;
            phases.push(report);
            if let Some(failure) = failure {
                status = RunStatus::Failed(failure);
                break;
            }
        }

        let mut outcome = RunOutcome {
            run_id,
            resumed,
            started_at,
            finished_at: Utc::now(),
            requested_phase: request.phase.clone(),
            status,
            phases,
            artifacts: registry.exposed().to_vec(),
            report_path: None,
        };
        match report::write_report(&config.runs_dir, &outcome) {
            Ok(path) => outcome.report_path = Some(path),
            Err(e) => warn!(error = %e, "Failed to write run report"),
        }
        report::publish(config, &outcome).await;
        Ok(outcome)
    }

    /// Dry-run view of one phase.
    fn plan_phase(
        &self,
        run_id: &str,
        phase: &Phase,
        selection: &Selection<'_>,
        replay: &Replay,
    ) -> EngineResult<PhaseReport> {
        let mut tasks = Vec::with_capacity(selection.tasks.len());
        for task in &selection.tasks {
            if replay.is_completed(&phase.name, &task.name) {
                tasks.push(TaskReport::new(task, TaskStatus::AlreadyCompleted));
                continue;
            }
            let attempt = replay.attempts(&phase.name, &task.name) + 1;
            let paths = task
                .render_paths(&self.render_ctx(run_id, attempt))
                .map_err(|e| EngineError::config(format!("Task '{}': {:#}", task.name, e)))?;
            let mut report = TaskReport::new(task, TaskStatus::Planned);
            report.attempt = Some(attempt);
            report.workspace = paths.worktree;
            report.branch = paths.branch;
            report.log = Some(paths.log);
            tasks.push(report);
        }
        let now = Utc::now();
        Ok(PhaseReport {
            name: phase.name.clone(),
            status: PhaseStatus::Planned,
            tasks,
            pending_manual: selection.pending_manual.iter().map(|t| t.name.clone()).collect(),
            started_at: now,
            finished_at: now,
        })
    }

    fn append(&self, run_id: &str, phase: &str, task: &str, state: TaskState) -> EngineResult<()> {
        self.ledger
            .append(&LedgerEvent::new(run_id, phase, task, state))
    }

    /// Pick the first attempt number whose branch and path are free.
    fn next_attempt(
        &self,
        run_id: &str,
        task: &Task,
        replay: &Replay,
        pool: &WorkspacePool,
    ) -> EngineResult<(u32, TaskPaths)> {
        let first = replay.attempts(&task.phase, &task.name) + 1;
        for attempt in first..first + MAX_ATTEMPT_PROBE {
            let paths = task
                .render_paths(&self.render_ctx(run_id, attempt))
                .map_err(|e| EngineError::config(format!("Task '{}': {:#}", task.name, e)))?;
            if pool.is_free(&paths) {
                return Ok((attempt, paths));
            }
        }
        Err(EngineError::Workspace {
            task: task.name.clone(),
            message: format!(
                "no free branch/worktree found for attempts {}..{}; run `foreman prune`",
                first,
                first + MAX_ATTEMPT_PROBE
            ),
        })
    }

    fn worker_spec(
        &self,
        run_id: &str,
        task: &Task,
        attempt: u32,
        handle: &WorkspaceHandle,
        log: &std::path::Path,
        inputs: &[ArtifactRef],
    ) -> EngineResult<WorkerSpec> {
        let command = if self.config.worker_noop {
            "true".to_string()
        } else {
            task.command_line(run_id, attempt, &handle.path)
                .map_err(|e| EngineError::config(format!("{:#}", e)))?
        };
        let mut env = vec![
            ("FOREMAN_RUN_ID".to_string(), run_id.to_string()),
            ("FOREMAN_PHASE".to_string(), task.phase.clone()),
            ("FOREMAN_TASK".to_string(), task.name.clone()),
            ("FOREMAN_ATTEMPT".to_string(), attempt.to_string()),
            (
                "FOREMAN_WORKSPACE".to_string(),
                handle.path.display().to_string(),
            ),
            ("FOREMAN_LOG".to_string(), log.display().to_string()),
            (
                "FOREMAN_PROJECT_ROOT".to_string(),
                self.config.project_root.display().to_string(),
            ),
            (
                "FOREMAN_OFFLINE".to_string(),
                if self.config.offline { "1" } else { "0" }.to_string(),
            ),
        ];
        if let Some(branch) = &handle.branch {
            env.push(("FOREMAN_BRANCH".to_string(), branch.clone()));
        }
        if let Some(prompt) = task.prompt() {
            env.push(("FOREMAN_PROMPT".to_string(), prompt.display().to_string()));
        }
        for input in inputs {
            env.push((artifact_env_key(&input.name), input.path.display().to_string()));
        }
        Ok(WorkerSpec {
            label: format!("{}/{}", task.phase, task.name),
            command,
            cwd: handle.path.clone(),
            env,
            log: log.to_path_buf(),
        })
    }

    /// Run one phase's tasks to completion or first fatal failure.
    async fn run_phase(
        &self,
        run_id: &str,
        phase: &Phase,
        selection: &Selection<'_>,
        replay: &Replay,
        pool: &mut WorkspacePool,
        registry: &mut ArtifactRegistry,
    ) -> EngineResult<(PhaseReport, Option<RunFailure>)> {
        let started_at = Utc::now();
        let tasks = &selection.tasks;
        let index: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        let mut slots = vec![Slot::Pending; tasks.len()];
        let mut reports: Vec<Option<TaskReport>> = vec![None; tasks.len()];
        let mut failure: Option<RunFailure> = None;

        info!(phase = %phase.name, tasks = tasks.len(), "Phase starting");
        for name in selection.pending_manual.iter().map(|t| &t.name) {
            info!(phase = %phase.name, task = %name, "Manual task awaiting explicit invocation");
        }

        for (i, task) in tasks.iter().enumerate() {
            if let Some(record) = replay.get(&phase.name, &task.name)
                && replay.is_completed(&phase.name, &task.name)
            {
                info!(task = %task.name, "Already completed; skipping");
                slots[i] = Slot::Succeeded;
                let mut report = TaskReport::new(task, TaskStatus::AlreadyCompleted);
                report.attempt = Some(record.attempts);
                report.workspace = record.workspace.clone();
                report.branch = record.branch.clone();
                report.log = record.log.clone();
                let workspace = record
                    .workspace
                    .clone()
                    .unwrap_or_else(|| self.config.project_root.clone());
                report.artifacts =
                    registry.expose(&phase.name, &task.name, &workspace, &task.outputs);
                reports[i] = Some(report);
            }
        }

        let mut running = FuturesUnordered::new();
        let mut dedicated_running = 0usize;
        let mut shared_running = false;

        loop {
            // Dispatch until a pass makes no progress.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for i in 0..tasks.len() {
                    if slots[i] != Slot::Pending {
                        continue;
                    }
                    let task = tasks[i];
                    let dep_slots: Vec<(&str, Slot)> = task
                        .depends_on
                        .iter()
                        .filter_map(|d| index.get(d.as_str()).map(|&j| (d.as_str(), slots[j])))
                        .collect();

                    let blockers: Vec<&str> = dep_slots
                        .iter()
                        .filter(|(_, s)| matches!(s, Slot::Failed | Slot::Blocked))
                        .map(|(d, _)| *d)
                        .collect();
                    if !blockers.is_empty() {
                        let reason = format!("blocked by: {}", blockers.join(", "));
                        let (attempt, paths) = self.next_attempt(run_id, task, replay, pool)?;
                        self.append(
                            run_id,
                            &phase.name,
                            &task.name,
                            TaskState::Started {
                                attempt,
                                workspace: None,
                                branch: None,
                                log: paths.log.clone(),
                            },
                        )?;
                        self.append(
                            run_id,
                            &phase.name,
                            &task.name,
                            TaskState::Skipped {
                                reason: reason.clone(),
                            },
                        )?;
                        warn!(task = %task.name, %reason, "Task skipped");
                        let mut report = TaskReport::new(task, TaskStatus::Skipped);
                        report.attempt = Some(attempt);
                        report.reason = Some(reason);
                        reports[i] = Some(report);
                        slots[i] = Slot::Blocked;
                        progressed = true;
                        continue;
                    }
                    if dep_slots
                        .iter()
                        .any(|(_, s)| matches!(s, Slot::Pending | Slot::Running))
                    {
                        continue;
                    }
                    // After a fatal failure only skips are recorded.
                    if failure.is_some() || shared_running {
                        continue;
                    }

                    if task.is_dedicated() {
                        if dedicated_running >= self.config.max_parallel {
                            continue;
                        }
                    } else if !running.is_empty() {
                        continue;
                    }

                    let (attempt, paths) = self.next_attempt(run_id, task, replay, pool)?;

                    let mut inputs = Vec::with_capacity(task.requires.len());
                    let mut missing = None;
                    for name in &task.requires {
                        match registry.require(&phase.name, name) {
                            Ok(artifact) => inputs.push(artifact),
                            Err(EngineError::ArtifactMissing { name, path, .. }) => {
                                missing = Some(FailureCause::ArtifactMissing { name, path });
                                break;
                            }
                            Err(other) => return Err(other),
                        }
                    }
                    if let Some(cause) = missing {
                        error!(task = %task.name, %cause, "Required artifact missing");
                        self.record_early_failure(
                            run_id,
                            phase,
                            task,
                            attempt,
                            &paths,
                            cause.clone(),
                        )?;
                        reports[i] = Some(failed_report(task, attempt, &paths, cause.clone()));
                        slots[i] = Slot::Failed;
                        if !task.optional {
                            failure =
                                Some(run_failure(phase, task, cause, Some(paths.log.clone())));
                        }
                        progressed = true;
                        continue;
                    }

                    if let Some(parent) = paths.log.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
                    }
                    let handle = match pool.provision(run_id, task, attempt, &paths).await {
                        Ok(handle) => handle,
                        Err(EngineError::Workspace { message, .. }) => {
                            let cause = FailureCause::Workspace { message };
                            error!(task = %task.name, %cause, "Workspace provisioning failed");
                            self.record_early_failure(
                                run_id,
                                phase,
                                task,
                                attempt,
                                &paths,
                                cause.clone(),
                            )?;
                            reports[i] = Some(failed_report(task, attempt, &paths, cause.clone()));
                            slots[i] = Slot::Failed;
                            if !task.optional {
                                failure = Some(run_failure(phase, task, cause, None));
                            }
                            progressed = true;
                            continue;
                        }
                        Err(other) => return Err(other),
                    };

                    self.append(
                        run_id,
                        &phase.name,
                        &task.name,
                        TaskState::Started {
                            attempt,
                            workspace: Some(handle.path.clone()),
                            branch: handle.branch.clone(),
                            log: paths.log.clone(),
                        },
                    )?;
                    let spec =
                        self.worker_spec(run_id, task, attempt, &handle, &paths.log, &inputs)?;
                    info!(
                        task = %task.name,
                        attempt,
                        workspace = %handle.path.display(),
                        log = %paths.log.display(),
                        "Task dispatched"
                    );

                    if task.is_dedicated() {
                        dedicated_running += 1;
                    } else {
                        shared_running = true;
                    }
                    slots[i] = Slot::Running;
                    progressed = true;

                    let supervisor = &self.supervisor;
                    let log = paths.log.clone();
                    running.push(async move {
                        let outcome = supervisor.supervise(&spec).await;
                        Finished {
                            index: i,
                            attempt,
                            handle,
                            log,
                            outcome,
                        }
                    });
                }
            }

            let Some(finished) = running.next().await else {
                break;
            };
            let Finished {
                index: i,
                attempt,
                handle,
                log,
                outcome,
            } = finished;
            let task = tasks[i];
            if task.is_dedicated() {
                dedicated_running -= 1;
            } else {
                shared_running = false;
            }

            let mut report = TaskReport::new(task, TaskStatus::Completed);
            report.attempt = Some(attempt);
            report.workspace = Some(handle.path.clone());
            report.branch = handle.branch.clone();
            report.log = Some(log.clone());
            report.duration_secs = Some(outcome.duration.as_secs());

            let cause = match &outcome.status {
                ProcessStatus::Completed => {
                    match pool.finalize(&handle, true, task.on_success).await {
                        Ok(finalized) => {
                            report.finalized = Some(finalized);
                            let workspace = if finalized == Finalized::Merged {
                                &self.config.project_root
                            } else {
                                &handle.path
                            };
                            report.artifacts =
                                registry.expose(&phase.name, &task.name, workspace, &task.outputs);
                            None
                        }
                        Err(EngineError::Workspace { message, .. }) => {
                            Some(FailureCause::Workspace { message })
                        }
                        Err(other) => return Err(other),
                    }
                }
                ProcessStatus::Failed(fault) => {
                    match pool.finalize(&handle, false, task.on_success).await {
                        Ok(finalized) => report.finalized = Some(finalized),
                        Err(e) => warn!(task = %task.name, error = %e, "Finalize after failure"),
                    }
                    Some(fault_cause(fault))
                }
            };

            match cause {
                None => {
                    self.append(
                        run_id,
                        &phase.name,
                        &task.name,
                        TaskState::Completed { exit_code: 0 },
                    )?;
                    info!(
                        task = %task.name,
                        duration = %format_duration(outcome.duration),
                        finalized = ?report.finalized,
                        "Task completed"
                    );
                    slots[i] = Slot::Succeeded;
                }
                Some(cause) => {
                    self.append(
                        run_id,
                        &phase.name,
                        &task.name,
                        TaskState::Failed {
                            cause: cause.clone(),
                        },
                    )?;
                    error!(task = %task.name, %cause, log = %log.display(), "Task failed");
                    slots[i] = Slot::Failed;
                    report.status = TaskStatus::Failed;
                    report.cause = Some(cause.clone());
                    if task.optional {
                        warn!(task = %task.name, "Optional task failed; continuing");
                    } else if failure.is_none() {
                        if !running.is_empty() {
                            warn!(
                                phase = %phase.name,
                                running = running.len(),
                                "Stopping dispatch; waiting for running tasks"
                            );
                        }
                        failure = Some(run_failure(phase, task, cause, Some(log)));
                    }
                }
            }
            reports[i] = Some(report);
        }

        let tasks_out = tasks
            .iter()
            .zip(reports)
            .map(|(task, report)| {
                report.unwrap_or_else(|| TaskReport::new(task, TaskStatus::NotStarted))
            })
            .collect();
        let status = if failure.is_some() {
            PhaseStatus::Failed
        } else {
            PhaseStatus::Completed
        };
        info!(phase = %phase.name, status = ?status, "Phase finished");
        Ok((
            PhaseReport {
                name: phase.name.clone(),
                status,
                tasks: tasks_out,
                pending_manual: selection.pending_manual.iter().map(|t| t.name.clone()).collect(),
                started_at,
                finished_at: Utc::now(),
            },
            failure,
        ))
    }

    /// Record a task that failed before its worker could start.
    fn record_early_failure(
        &self,
        run_id: &str,
        phase: &Phase,
        task: &Task,
        attempt: u32,
        paths: &TaskPaths,
        cause: FailureCause,
    ) -> EngineResult<()> {
        self.append(
            run_id,
            &phase.name,
            &task.name,
            TaskState::Started {
                attempt,
                workspace: None,
                branch: None,
                log: paths.log.clone(),
            },
        )?;
        self.append(run_id, &phase.name, &task.name, TaskState::Failed { cause })
    }
}

fn failed_report(task: &Task, attempt: u32, paths: &TaskPaths, cause: FailureCause) -> TaskReport {
    let mut report = TaskReport::new(task, TaskStatus::Failed);
    report.attempt = Some(attempt);
    report.log = Some(paths.log.clone());
    report.cause = Some(cause);
    report
}

fn run_failure(
    phase: &Phase,
    task: &Task,
    cause: FailureCause,
    log: Option<PathBuf>,
) -> RunFailure {
    RunFailure {
        phase: phase.name.clone(),
        task: task.name.clone(),
        kind: FailureKind::of(&cause),
        cause,
        log,
    }
}
