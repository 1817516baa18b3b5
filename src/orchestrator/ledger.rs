//! Append-only run ledger.
//!
//! Every task state transition is one JSON line in `<state_dir>/ledger.jsonl`.
//! Appends take an exclusive advisory lock and are synced before returning,
//! so the file survives a crash of the control plane and concurrent readers
//! never observe a torn line. Resume decisions are made purely by replaying
//! events; nothing else is consulted.

use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::{EngineError, EngineResult};

/// Why a task did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    Exit { code: i32 },
    Signal { signal: i32 },
    Stalled { idle_secs: u64 },
    Spawn { message: String },
    Workspace { message: String },
    ArtifactMissing { name: String, path: PathBuf },
    Supervision { message: String },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Exit { code } => write!(f, "exit code {}", code),
            FailureCause::Signal { signal } => write!(f, "killed by signal {}", signal),
            FailureCause::Stalled { idle_secs } => {
                write!(f, "stalled: no log activity for {}s", idle_secs)
            }
            FailureCause::Spawn { message } => write!(f, "failed to start: {}", message),
            FailureCause::Workspace { message } => write!(f, "workspace: {}", message),
            FailureCause::ArtifactMissing { name, path } => {
                write!(f, "artifact '{}' missing at {}", name, path.display())
            }
            FailureCause::Supervision { message } => write!(f, "supervision: {}", message),
        }
    }
}

/// A task state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Started {
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        log: PathBuf,
    },
    Completed {
        exit_code: i32,
    },
    Failed {
        cause: FailureCause,
    },
    Skipped {
        reason: String,
    },
}

impl TaskState {
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Started { .. } => "started",
            TaskState::Completed { .. } => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::Skipped { .. } => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Started { .. })
    }
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub run_id: String,
    pub phase: String,
    pub task: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub state: TaskState,
}

impl LedgerEvent {
    pub fn new(run_id: &str, phase: &str, task: &str, state: TaskState) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            task: task.to_string(),
            timestamp: Utc::now(),
            state,
        }
    }
}

/// Durable event store backed by a JSON-lines file.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event; durable once this returns.
    pub fn append(&self, event: &LedgerEvent) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        let mut line = serde_json::to_string(event).context("Failed to serialize ledger event")?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EngineError::io(&self.path, e))?;
        file.lock_exclusive()
            .map_err(|e| EngineError::io(&self.path, e))?;
        let result = file
            .write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data());
        let unlocked = FileExt::unlock(&file);
        result.map_err(|e| EngineError::io(&self.path, e))?;
        unlocked.map_err(|e| EngineError::io(&self.path, e))?;
        Ok(())
    }

    /// All events in append order. A malformed line (for example one torn
    /// by a crash mid-write) is skipped with a warning.
    pub fn events(&self) -> EngineResult<Vec<LedgerEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| EngineError::io(&self.path, e))?;
        let mut events = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %e,
                    "Skipping malformed ledger line"
                ),
            }
        }
        Ok(events)
    }

    /// Events of one run, in append order.
    pub fn query(&self, run_id: &str) -> EngineResult<Vec<LedgerEvent>> {
        Ok(self
            .events()?
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect())
    }

    /// The run id of the most recently appended event.
    pub fn latest_run_id(&self) -> EngineResult<Option<String>> {
        Ok(self.events()?.pop().map(|e| e.run_id))
    }

    /// Distinct run ids in order of first appearance.
    pub fn run_ids(&self) -> EngineResult<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();
        for event in self.events()? {
            if !ids.contains(&event.run_id) {
                ids.push(event.run_id);
            }
        }
        Ok(ids)
    }
}

/// Replayed status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    /// Started without a terminal event: interrupted, re-run on resume.
    Incomplete,
    Completed,
    Failed,
    Skipped,
}

/// Per-task result of replaying a run's events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub status: ReplayStatus,
    pub attempts: u32,
    pub workspace: Option<PathBuf>,
    pub branch: Option<String>,
    pub log: Option<PathBuf>,
    pub cause: Option<FailureCause>,
    pub last_update: DateTime<Utc>,
}

/// Pure reduction of ledger events into per-task records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replay {
    records: BTreeMap<(String, String), TaskRecord>,
}

impl Replay {
    pub fn from_events(events: &[LedgerEvent]) -> Self {
        let mut records: BTreeMap<(String, String), TaskRecord> = BTreeMap::new();
        for event in events {
            let key = (event.phase.clone(), event.task.clone());
            match &event.state {
                TaskState::Started {
                    attempt,
                    workspace,
                    branch,
                    log,
                } => {
                    let record = records.entry(key).or_insert_with(|| TaskRecord {
                        status: ReplayStatus::Incomplete,
                        attempts: 0,
                        workspace: None,
                        branch: None,
                        log: None,
                        cause: None,
                        last_update: event.timestamp,
                    });
                    record.status = ReplayStatus::Incomplete;
                    record.attempts = record.attempts.max(*attempt);
                    record.workspace = workspace.clone();
                    record.branch = branch.clone();
                    record.log = Some(log.clone());
                    record.cause = None;
                    record.last_update = event.timestamp;
                }
                terminal => {
                    let Some(record) = records.get_mut(&key) else {
                        continue;
                    };
                    record.last_update = event.timestamp;
                    match terminal {
                        TaskState::Completed { .. } => record.status = ReplayStatus::Completed,
                        TaskState::Failed { cause } => {
                            record.status = ReplayStatus::Failed;
                            record.cause = Some(cause.clone());
                        }
                        TaskState::Skipped { .. } => record.status = ReplayStatus::Skipped,
                        TaskState::Started { .. } => {}
                    }
                }
            }
        }
        Self { records }
    }

    pub fn get(&self, phase: &str, task: &str) -> Option<&TaskRecord> {
        self.records.get(&(phase.to_string(), task.to_string()))
    }

    pub fn is_completed(&self, phase: &str, task: &str) -> bool {
        self.get(phase, task)
            .is_some_and(|r| r.status == ReplayStatus::Completed)
    }

    /// Attempts already started for a task.
    pub fn attempts(&self, phase: &str, task: &str) -> u32 {
        self.get(phase, task).map_or(0, |r| r.attempts)
    }

    pub fn records(&self) -> impl Iterator<Item = (&(String, String), &TaskRecord)> {
        self.records.iter()
    }
}

/// A violation of the per-task event ordering rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceViolation {
    pub run_id: String,
    pub phase: String,
    pub task: String,
    pub message: String,
}

impl std::fmt::Display for TraceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}: {}",
            self.run_id, self.phase, self.task, self.message
        )
    }
}

/// Check that every task's events follow `started (terminal)?`, repeated, and
/// that nothing follows `completed`.
pub fn validate_trace(events: &[LedgerEvent]) -> Vec<TraceViolation> {
    #[derive(Clone, Copy, PartialEq)]
    enum Slot {
        Open,
        Closed,
        Done,
    }
    let mut slots: BTreeMap<(&str, &str, &str), Slot> = BTreeMap::new();
    let mut violations = Vec::new();
    for event in events {
        let key = (
            event.run_id.as_str(),
            event.phase.as_str(),
            event.task.as_str(),
        );
        let current = slots.get(&key).copied();
        let violation = match (current, event.state.is_terminal()) {
            (Some(Slot::Done), _) => Some(format!(
                "'{}' recorded after completion",
                event.state.label()
            )),
            (Some(Slot::Open), false) => Some("started twice without a terminal event".to_string()),
            (None | Some(Slot::Closed), true) => Some(format!(
                "'{}' without a preceding start",
                event.state.label()
            )),
            _ => None,
        };
        if let Some(message) = violation {
            violations.push(TraceViolation {
                run_id: event.run_id.clone(),
                phase: event.phase.clone(),
                task: event.task.clone(),
                message,
            });
            continue;
        }
        let next = match &event.state {
            TaskState::Started { .. } => Slot::Open,
            TaskState::Completed { .. } => Slot::Done,
            _ => Slot::Closed,
        };
        slots.insert(key, next);
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn started(run: &str, task: &str, attempt: u32) -> LedgerEvent {
        LedgerEvent::new(
            run,
            "main",
            task,
            TaskState::Started {
                attempt,
                workspace: Some(PathBuf::from(format!("/wt/{task}-{attempt}"))),
                branch: Some(format!("foreman/{run}/{task}-{attempt}")),
                log: PathBuf::from(format!("/logs/{task}.log")),
            },
        )
    }

    fn terminal(run: &str, task: &str, state: TaskState) -> LedgerEvent {
        LedgerEvent::new(run, "main", task, state)
    }

    #[test]
    fn test_event_json_shape() {
        let event = terminal(
            "r1",
            "core",
            TaskState::Failed {
                cause: FailureCause::Stalled { idle_secs: 30 },
            },
        );
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["cause"]["kind"], "stalled");
        assert_eq!(value["cause"]["idle_secs"], 30);
        assert_eq!(value["task"], "core");

        let back: LedgerEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_append_and_query() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("state/ledger.jsonl"));
        assert!(ledger.events().unwrap().is_empty());
        assert_eq!(ledger.latest_run_id().unwrap(), None);

        ledger.append(&started("r1", "a", 1)).unwrap();
        ledger
            .append(&terminal("r1", "a", TaskState::Completed { exit_code: 0 }))
            .unwrap();
        ledger.append(&started("r2", "a", 1)).unwrap();

        assert_eq!(ledger.events().unwrap().len(), 3);
        assert_eq!(ledger.query("r1").unwrap().len(), 2);
        assert_eq!(ledger.latest_run_id().unwrap().as_deref(), Some("r2"));
        assert_eq!(ledger.run_ids().unwrap(), vec!["r1", "r2"]);
    }

    #[test]
    fn test_torn_trailing_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = Ledger::new(&path);
        ledger.append(&started("r1", "a", 1)).unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"run_id":"r1","phase":"main","ta"#).unwrap();
        drop(file);

        let events = ledger.events().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_concurrent_appends_produce_whole_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Ledger::new(&path);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        ledger
                            .append(&started("r1", &format!("t{i}-{j}"), 1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let ledger = Ledger::new(&path);
        assert_eq!(ledger.events().unwrap().len(), 200);
    }

    #[test]
    fn test_replay_tracks_latest_attempt() {
        let events = vec![
            started("r1", "a", 1),
            terminal(
                "r1",
                "a",
                TaskState::Failed {
                    cause: FailureCause::Exit { code: 2 },
                },
            ),
            started("r1", "b", 1),
            terminal("r1", "b", TaskState::Completed { exit_code: 0 }),
            started("r1", "a", 2),
            started("r1", "c", 1),
        ];
        let replay = Replay::from_events(&events);

        let a = replay.get("main", "a").unwrap();
        assert_eq!(a.status, ReplayStatus::Incomplete);
        assert_eq!(a.attempts, 2);
        assert_eq!(a.cause, None);
        assert_eq!(a.workspace, Some(PathBuf::from("/wt/a-2")));

        assert!(replay.is_completed("main", "b"));
        assert_eq!(replay.attempts("main", "c"), 1);
        assert_eq!(replay.attempts("main", "zzz"), 0);
        assert!(!replay.is_completed("post", "b"));
    }

    #[test]
    fn test_replay_ignores_orphan_terminal() {
        let events = vec![terminal("r1", "x", TaskState::Completed { exit_code: 0 })];
        assert!(Replay::from_events(&events).get("main", "x").is_none());
    }

    #[test]
    fn test_validate_trace_accepts_retry_sequence() {
        let events = vec![
            started("r1", "a", 1),
            terminal(
                "r1",
                "a",
                TaskState::Failed {
                    cause: FailureCause::Exit { code: 1 },
                },
            ),
            started("r1", "a", 2),
            terminal("r1", "a", TaskState::Completed { exit_code: 0 }),
            started("r1", "b", 1),
            terminal(
                "r1",
                "b",
                TaskState::Skipped {
                    reason: "blocked by: a".into(),
                },
            ),
        ];
        assert!(validate_trace(&events).is_empty());
    }

    #[test]
    fn test_validate_trace_flags_violations() {
        let events = vec![
            terminal("r1", "orphan", TaskState::Completed { exit_code: 0 }),
            started("r1", "a", 1),
            started("r1", "a", 2),
            started("r1", "b", 1),
            terminal("r1", "b", TaskState::Completed { exit_code: 0 }),
            started("r1", "b", 2),
        ];
        let violations = validate_trace(&events);
        assert_eq!(violations.len(), 3);
        assert_eq!(violations[0].task, "orphan");
        assert!(violations[1].message.contains("started twice"));
        assert!(violations[2].message.contains("after completion"));
    }

    #[test]
    fn test_failure_cause_display() {
        let cause = FailureCause::ArtifactMissing {
            name: "approval".into(),
            path: PathBuf::from("/docs/approval.md"),
        };
        assert_eq!(
            cause.to_string(),
            "artifact 'approval' missing at /docs/approval.md"
        );
    }
}
