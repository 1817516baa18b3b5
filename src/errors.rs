//! Typed error hierarchy for the run orchestration engine.
//!
//! `EngineError` carries one variant per fatal category. Each category maps to
//! a stable process exit code so operators and wrapper scripts can tell a lock
//! refusal from a worker failure without parsing output.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a run that finished (or paused) without a fatal failure.
pub const EXIT_OK: i32 = 0;
/// A worker exited non-zero, or its dependents could not run.
pub const EXIT_WORKER_FAILURE: i32 = 1;
/// A required upstream or approval artifact is absent.
pub const EXIT_ARTIFACT_MISSING: i32 = 66;
/// An isolated workspace could not be provisioned or merged.
pub const EXIT_WORKSPACE: i32 = 73;
/// Another privileged run holds the lock; retry later.
pub const EXIT_LOCK_CONTENTION: i32 = 75;
/// Configuration is malformed or missing.
pub const EXIT_CONFIG: i32 = 78;
/// A worker was killed after showing no log activity.
pub const EXIT_STALL_TIMEOUT: i32 = 124;
/// The control plane received SIGINT/SIGTERM.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Errors surfaced by the engine. Task-level categories are normally recorded
/// in the ledger and reported through `RunOutcome`; configuration and lock
/// errors abort the run before any workspace is touched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run lock held at {path} by run {holder}{}", phase_suffix(.phase))]
    LockContention {
        path: PathBuf,
        holder: String,
        phase: Option<String>,
    },

    #[error("Run still in progress: lock file {path} exists (held by {holder}); phase '{phase}' only starts after the privileged run finishes")]
    RunInProgress {
        path: PathBuf,
        holder: String,
        phase: String,
    },

    #[error("Workspace error for task '{task}': {message}")]
    Workspace { task: String, message: String },

    #[error("Task '{task}' failed with exit code {exit_code} (log: {log})")]
    WorkerFailure {
        task: String,
        exit_code: i32,
        log: PathBuf,
    },

    #[error("Task '{task}' stalled: no log activity for {idle_secs}s (log: {log})")]
    StallTimeout {
        task: String,
        idle_secs: u64,
        log: PathBuf,
    },

    #[error("Required artifact '{name}' for phase '{phase}' is missing or empty at {path}")]
    ArtifactMissing {
        phase: String,
        name: String,
        path: PathBuf,
    },

    #[error("Run interrupted by signal")]
    Interrupted,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn phase_suffix(phase: &Option<String>) -> String {
    match phase {
        Some(p) => format!(" (phase '{}')", p),
        None => String::new(),
    }
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable exit code class for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => EXIT_CONFIG,
            EngineError::LockContention { .. } | EngineError::RunInProgress { .. } => {
                EXIT_LOCK_CONTENTION
            }
            EngineError::Workspace { .. } => EXIT_WORKSPACE,
            EngineError::WorkerFailure { .. } => EXIT_WORKER_FAILURE,
            EngineError::StallTimeout { .. } => EXIT_STALL_TIMEOUT,
            EngineError::ArtifactMissing { .. } => EXIT_ARTIFACT_MISSING,
            EngineError::Interrupted => EXIT_INTERRUPTED,
            EngineError::Io { .. } | EngineError::Other(_) => EXIT_WORKER_FAILURE,
        }
    }

    /// Whether retrying later (without changing anything) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockContention { .. } | EngineError::RunInProgress { .. }
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
