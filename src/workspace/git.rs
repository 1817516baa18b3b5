use anyhow::{Context, Result, bail};
use git2::Repository;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Git operations on the primary working tree.
///
/// Read-only queries go through `git2`. Worktree and merge operations shell
/// out to the `git` CLI, which owns the worktree bookkeeping.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn open(root: &Path) -> Result<Self> {
        let repo = Repository::open(root)
            .with_context(|| format!("Not a git repository: {}", root.display()))?;
        if repo.is_bare() {
            bail!("Repository at {} is bare", root.display());
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.root).context("Failed to open git repository")
    }

    /// HEAD commit id, or `None` on an unborn branch.
    pub fn head_commit(&self) -> Option<String> {
        let repo = self.repo().ok()?;
        let commit = repo.head().ok()?.peel_to_commit().ok()?;
        Some(commit.id().to_string())
    }

    pub fn current_branch(&self) -> Option<String> {
        let repo = self.repo().ok()?;
        let head = repo.head().ok()?;
        if head.is_branch() {
            head.shorthand().map(str::to_string)
        } else {
            None
        }
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo()
            .ok()
            .is_some_and(|repo| repo.find_branch(name, git2::BranchType::Local).is_ok())
    }

    /// Paths of all linked worktrees.
    pub fn worktree_paths(&self) -> Result<Vec<PathBuf>> {
        let repo = self.repo()?;
        let names = repo.worktrees().context("Failed to list worktrees")?;
        let mut paths = Vec::new();
        for name in names.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                paths.push(wt.path().to_path_buf());
            }
        }
        Ok(paths)
    }

    /// Whether `path` is one of this repository's linked worktrees.
    pub fn is_linked_worktree(&self, path: &Path) -> bool {
        let Ok(target) = path.canonicalize() else {
            return false;
        };
        self.worktree_paths().is_ok_and(|paths| {
            paths
                .iter()
                .any(|p| p.canonicalize().is_ok_and(|p| p == target))
        })
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(args = ?args, cwd = %self.root.display(), "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    /// Create a worktree at `path` on a new branch cut from HEAD.
    pub async fn add_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        let output = self
            .git(&["worktree", "add", "-b", branch, path_str, "HEAD"])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree add failed: {}", stderr.trim());
        }
        Ok(())
    }

    pub async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        let output = self
            .git(&["worktree", "remove", "--force", path_str])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree remove failed: {}", stderr.trim());
        }
        Ok(())
    }

    /// Merge `branch` into the currently checked-out branch with a merge
    /// commit. On conflict the merge is aborted and `Ok(false)` returned.
    pub async fn merge(&self, branch: &str, message: &str) -> Result<bool> {
        let output = self
            .git(&["merge", "--no-ff", "-m", message, branch])
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(branch, error = %stderr.trim(), "Merge failed; aborting");
        match self.git(&["merge", "--abort"]).await {
            Ok(abort) if !abort.status.success() => {
                warn!(
                    error = %String::from_utf8_lossy(&abort.stderr).trim(),
                    "git merge --abort failed"
                );
            }
            Err(e) => warn!(error = %e, "git merge --abort failed"),
            Ok(_) => {}
        }
        Ok(false)
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        let output = self.git(&["branch", "-D", branch]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git branch -D failed: {}", stderr.trim());
        }
        Ok(())
    }

    /// Drop bookkeeping for worktrees whose directories are gone.
    pub async fn prune(&self) -> Result<()> {
        let output = self.git(&["worktree", "prune"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree prune failed: {}", stderr.trim());
        }
        Ok(())
    }
}
