//! Checks run before the lock is taken or any workspace is touched.
//!
//! Every problem found is collected so that one invocation reports all of
//! them as a single configuration error.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::config::RunConfig;
use crate::errors::{EngineError, EngineResult};
use crate::phase::PhaseGate;
use crate::task_graph::{RenderContext, Selection};
use crate::workspace::GitRepo;

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

fn state_dir_writable(config: &RunConfig) -> Result<(), String> {
    std::fs::create_dir_all(&config.logs_dir)
        .map_err(|e| format!("Cannot create {}: {}", config.logs_dir.display(), e))?;
    let probe = config
        .state_dir
        .join(format!(".preflight-{}", std::process::id()));
    std::fs::write(&probe, b"ok")
        .map_err(|e| {
            format!(
                "State directory {} is not writable: {}",
                config.state_dir.display(),
                e
            )
        })?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Validate the environment for the selected tasks.
pub fn preflight(
    config: &RunConfig,
    selections: &[Selection<'_>],
    run_id: &str,
) -> EngineResult<()> {
    let mut problems: Vec<String> = Vec::new();

    let git = match GitRepo::open(&config.project_root) {
        Ok(git) => Some(git),
        Err(e) => {
            problems.push(format!("{:#}", e));
            None
        }
    };

    let tasks: Vec<_> = selections.iter().flat_map(|s| s.tasks.iter().copied()).collect();
    if tasks.iter().any(|t| t.is_dedicated()) {
        if !git_available() {
            problems.push("git executable not found on PATH".to_string());
        }
        if let Some(git) = &git
            && git.head_commit().is_none()
        {
            problems.push(format!(
                "Repository at {} has no commits; worktrees need a base commit",
                config.project_root.display()
            ));
        }
    }

    if let Err(problem) = state_dir_writable(config) {
        problems.push(problem);
    }

    // Artifact names any selected task or gate may ask for.
    let mut known_artifacts: HashSet<&str> = config.artifacts.keys().map(String::as_str).collect();
    known_artifacts.extend(
        config
            .graph
            .tasks()
            .iter()
            .flat_map(|t| t.outputs.iter().map(|o| o.name.as_str())),
    );
    for selection in selections {
        if let Some(PhaseGate::Approval { artifact }) =
            config.phase(&selection.phase).map(|p| &p.gate)
            && !known_artifacts.contains(artifact.as_str())
        {
            problems.push(format!(
                "Phase '{}' waits for approval artifact '{}', which no task produces and [artifacts] does not declare",
                selection.phase, artifact
            ));
        }
    }

    let mut worktrees: HashMap<PathBuf, &str> = HashMap::new();
    let mut branches: HashMap<String, &str> = HashMap::new();
    let mut logs: HashMap<PathBuf, &str> = HashMap::new();
    for task in &tasks {
        if let Some(prompt) = task.prompt()
            && !prompt.is_file()
        {
            problems.push(format!(
                "Task '{}' prompt not found: {}",
                task.name,
                prompt.display()
            ));
        }
        for required in &task.requires {
            if !known_artifacts.contains(required.as_str()) {
                problems.push(format!(
                    "Task '{}' requires unknown artifact '{}'",
                    task.name, required
                ));
            }
        }

        let ctx = RenderContext {
            run_id,
            attempt: 1,
            project_root: &config.project_root,
            workspace_root: &config.workspace_root,
            logs_dir: &config.logs_dir,
        };
        let paths = match task.render_paths(&ctx) {
            Ok(paths) => paths,
            Err(e) => {
                problems.push(format!("Task '{}': {:#}", task.name, e));
                continue;
            }
        };

        if let Some(other) = logs.insert(paths.log.clone(), &task.name) {
            problems.push(format!(
                "Tasks '{}' and '{}' write the same log {}",
                other,
                task.name,
                paths.log.display()
            ));
        }
        if paths.log.is_dir() {
            problems.push(format!(
                "Task '{}' log path is a directory: {}",
                task.name,
                paths.log.display()
            ));
        }
        if let Some(worktree) = &paths.worktree {
            if let Some(other) = worktrees.insert(worktree.clone(), &task.name) {
                problems.push(format!(
                    "Tasks '{}' and '{}' share worktree path {}",
                    other,
                    task.name,
                    worktree.display()
                ));
            }
            if worktree.exists() && !git.as_ref().is_some_and(|g| g.is_linked_worktree(worktree)) {
                problems.push(format!(
                    "Task '{}' worktree path exists and is not a git worktree: {}",
                    task.name,
                    worktree.display()
                ));
            }
        }
        if let Some(branch) = &paths.branch
            && let Some(other) = branches.insert(branch.clone(), &task.name)
        {
            problems.push(format!(
                "Tasks '{}' and '{}' share branch '{}'",
                other, task.name, branch
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::config(format!(
            "Preflight failed:\n  - {}",
            problems.join("\n  - ")
        )))
    }
}
