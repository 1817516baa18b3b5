//! Isolated workspaces for task execution.
//!
//! Dedicated tasks get a fresh git worktree on their own branch; shared tasks
//! run in the primary working tree, one at a time. The pool is an arena of
//! live handles keyed by `(run_id, task, attempt)`, so a workspace is never
//! handed to two tasks at once.

pub mod git;

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::task_graph::{FinalizeAction, Task, TaskPaths, WorkspacePolicy};
pub use git::GitRepo;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkspaceKey {
    pub run_id: String,
    pub task: String,
    pub attempt: u32,
}

/// A provisioned workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceHandle {
    pub key: WorkspaceKey,
    pub policy: WorkspacePolicy,
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// What happened to a workspace after its task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Finalized {
    Merged,
    Parked,
    Discarded,
    /// Kept intact for postmortem after a failure.
    Preserved,
    /// Shared workspace; nothing to do.
    InPlace,
}

impl std::fmt::Display for Finalized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Finalized::Merged => "merged",
            Finalized::Parked => "parked",
            Finalized::Discarded => "discarded",
            Finalized::Preserved => "preserved",
            Finalized::InPlace => "in place",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct WorkspacePool {
    git: GitRepo,
    handles: HashMap<WorkspaceKey, WorkspaceHandle>,
    shared_holder: Option<WorkspaceKey>,
}

impl WorkspacePool {
    /// Open the pool on the primary tree. A missing repository is a
    /// configuration problem, not a workspace failure.
    pub fn open(project_root: &Path) -> EngineResult<Self> {
        let git = GitRepo::open(project_root).map_err(|e| EngineError::config(format!("{:#}", e)))?;
        Ok(Self {
            git,
            handles: HashMap::new(),
            shared_holder: None,
        })
    }

    pub fn git(&self) -> &GitRepo {
        &self.git
    }

    /// Live handles.
    pub fn active(&self) -> usize {
        self.handles.len()
    }

    pub fn shared_busy(&self) -> bool {
        self.shared_holder.is_some()
    }

    /// Whether `paths` can be provisioned without colliding with an existing
    /// branch, directory or live handle.
    pub fn is_free(&self, paths: &TaskPaths) -> bool {
        let path_free = paths.worktree.as_ref().is_none_or(|p| {
            !p.exists() && !self.handles.values().any(|h| &h.path == p)
        });
        let branch_free = paths
            .branch
            .as_ref()
            .is_none_or(|b| !self.git.branch_exists(b));
        path_free && branch_free
    }

    /// Provision the workspace for one attempt of `task`.
    pub async fn provision(
        &mut self,
        run_id: &str,
        task: &Task,
        attempt: u32,
        paths: &TaskPaths,
    ) -> EngineResult<WorkspaceHandle> {
        let key = WorkspaceKey {
            run_id: run_id.to_string(),
            task: task.name.clone(),
            attempt,
        };
        let workspace_err = |message: String| EngineError::Workspace {
            task: task.name.clone(),
            message,
        };
        if self.handles.contains_key(&key) {
            return Err(workspace_err("workspace already provisioned for this attempt".into()));
        }

        let handle = match (task.workspace, &paths.worktree, &paths.branch) {
            (WorkspacePolicy::Shared, _, _) => {
                if let Some(holder) = &self.shared_holder {
                    return Err(workspace_err(format!(
                        "primary tree is in use by task '{}'",
                        holder.task
                    )));
                }
                self.shared_holder = Some(key.clone());
                WorkspaceHandle {
                    key: key.clone(),
                    policy: WorkspacePolicy::Shared,
                    path: self.git.root().to_path_buf(),
                    branch: None,
                }
            }
            (WorkspacePolicy::Dedicated, Some(path), Some(branch)) => {
                if path.exists() {
                    return Err(workspace_err(format!(
                        "worktree path already exists: {}",
                        path.display()
                    )));
                }
                if self.git.branch_exists(branch) {
                    return Err(workspace_err(format!("branch '{}' already exists", branch)));
                }
                if self.git.head_commit().is_none() {
                    return Err(workspace_err("repository has no commits to branch from".into()));
                }
                self.git
                    .add_worktree(path, branch)
                    .await
                    .map_err(|e| workspace_err(format!("{:#}", e)))?;
                info!(task = %task.name, path = %path.display(), branch, "Worktree provisioned");
                WorkspaceHandle {
                    key: key.clone(),
                    policy: WorkspacePolicy::Dedicated,
                    path: path.clone(),
                    branch: Some(branch.clone()),
                }
            }
            (WorkspacePolicy::Dedicated, _, _) => {
                return Err(workspace_err("dedicated workspace needs a path and branch".into()));
            }
        };
        self.handles.insert(key, handle.clone());
        Ok(handle)
    }

    /// Release a handle according to the task's outcome.
    ///
    /// Failed tasks keep their worktree and branch. A merge conflict leaves
    /// the worktree in place and is reported as a workspace error.
    pub async fn finalize(
        &mut self,
        handle: &WorkspaceHandle,
        succeeded: bool,
        action: FinalizeAction,
    ) -> EngineResult<Finalized> {
        self.handles.remove(&handle.key);
        if self.shared_holder.as_ref() == Some(&handle.key) {
            self.shared_holder = None;
        }
        let task = &handle.key.task;
        let workspace_err = |message: String| EngineError::Workspace {
            task: task.clone(),
            message,
        };

        let Some(branch) = handle.branch.as_deref() else {
            return Ok(Finalized::InPlace);
        };
        if !succeeded {
            info!(task = %task, path = %handle.path.display(), "Workspace preserved for inspection");
            return Ok(Finalized::Preserved);
        }

        match action {
            FinalizeAction::Park => Ok(Finalized::Parked),
            FinalizeAction::Merge => {
                let message = format!("foreman: merge {} ({})", task, handle.key.run_id);
                let merged = self
                    .git
                    .merge(branch, &message)
                    .await
                    .map_err(|e| workspace_err(format!("{:#}", e)))?;
                if !merged {
                    return Err(workspace_err(format!(
                        "merge of '{}' into the primary tree failed; worktree kept at {}",
                        branch,
                        handle.path.display()
                    )));
                }
                if let Err(e) = self.git.remove_worktree(&handle.path).await {
                    warn!(task = %task, error = %format!("{:#}", e), "Merged, but worktree removal failed");
                }
                info!(
                    task = %task,
                    branch,
                    into = %self.git.current_branch().unwrap_or_else(|| "HEAD".to_string()),
                    "Branch merged into primary tree"
                );
                Ok(Finalized::Merged)
            }
            FinalizeAction::Discard => {
                self.git
                    .remove_worktree(&handle.path)
                    .await
                    .map_err(|e| workspace_err(format!("{:#}", e)))?;
                self.git
                    .delete_branch(branch)
                    .await
                    .map_err(|e| workspace_err(format!("{:#}", e)))?;
                Ok(Finalized::Discarded)
            }
        }
    }

    /// Remove every linked worktree under `root` and prune stale entries.
    pub async fn prune_under(&self, root: &Path) -> EngineResult<Vec<PathBuf>> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut removed = Vec::new();
        let paths = self.git.worktree_paths().map_err(EngineError::from)?;
        for path in paths {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            if !canonical.starts_with(&root) {
                continue;
            }
            match self.git.remove_worktree(&path).await {
                Ok(()) => removed.push(path),
                Err(e) => warn!(path = %path.display(), error = %format!("{:#}", e), "Failed to remove worktree"),
            }
        }
        self.git.prune().await.map_err(EngineError::from)?;
        Ok(removed)
    }
}
