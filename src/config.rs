use anyhow::Context;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{EngineError, EngineResult};
use crate::foreman_config::{EnvOverrides, ForemanFile, ReportSection, TimingSection};
use crate::phase::{Phase, build_phases};
use crate::task_graph::TaskGraph;

const DEFAULT_STATE_DIR: &str = ".foreman";

/// Supervisor timing with zero-valued settings mapped to `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub status_interval: Option<Duration>,
    pub stall_timeout: Option<Duration>,
    pub stall_kill: bool,
    pub stall_hard_limit: Option<Duration>,
    pub kill_grace: Duration,
}

impl From<&TimingSection> for Timing {
    fn from(t: &TimingSection) -> Self {
        let nonzero = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Self {
            poll_interval: Duration::from_secs_f64(t.poll_interval_secs),
            progress_interval: Duration::from_secs(t.progress_interval_secs),
            status_interval: nonzero(t.status_interval_secs),
            stall_timeout: nonzero(t.stall_timeout_secs),
            stall_kill: t.stall_kill,
            stall_hard_limit: t.stall_hard_limit_secs.and_then(nonzero),
            kill_grace: Duration::from_secs(t.kill_grace_secs),
        }
    }
}

/// Fully resolved, immutable configuration for one invocation.
///
/// Every relative path in the configuration file is resolved here: the
/// project root against the file's directory, everything else against the
/// project root.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub config_path: PathBuf,
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub logs_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub lock_path: PathBuf,
    pub runs_dir: PathBuf,
    pub status_log: PathBuf,
    pub alerts_log: PathBuf,
    pub timing: Timing,
    pub max_parallel: usize,
    pub resume: bool,
    pub include_manual: bool,
    pub offline: bool,
    pub skip_discovery: bool,
    /// Replace every worker command with `true`.
    pub worker_noop: bool,
    pub phases: Vec<Phase>,
    pub graph: TaskGraph,
    /// Externally produced artifacts by name.
    pub artifacts: BTreeMap<String, PathBuf>,
    pub report: ReportSection,
}

impl RunConfig {
    /// Load the configuration file, a sibling `.env`, and `FOREMAN_*` overrides.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.is_file() {
            return Err(EngineError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        if let Some(dir) = path.parent() {
            let env_file = dir.join(".env");
            if env_file.is_file() {
                dotenvy::from_path(&env_file).map_err(|e| {
                    EngineError::config(format!("Failed to load {}: {}", env_file.display(), e))
                })?;
            }
        }
        let env = EnvOverrides::from_env().map_err(|e| EngineError::config(format!("{:#}", e)))?;
        let file = ForemanFile::load(path).map_err(|e| EngineError::config(format!("{:#}", e)))?;
        Self::from_file(file, path, &env)
    }

    /// Resolve an already-parsed document.
    pub fn from_file(
        mut file: ForemanFile,
        config_path: &Path,
        env: &EnvOverrides,
    ) -> EngineResult<Self> {
        env.apply(&mut file);
        let problems = file.validate();
        if !problems.is_empty() {
            return Err(EngineError::config(problems.join("; ")));
        }

        let config_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let project_root = config_dir
            .join(&file.project_root)
            .canonicalize()
            .with_context(|| {
                format!("Project root does not exist: {}", file.project_root.display())
            })
            .map_err(|e| EngineError::config(format!("{:#}", e)))?;

        let under_root = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                project_root.join(p)
            }
        };
        let state_dir = under_root(
            file.state_dir
                .as_deref()
                .unwrap_or_else(|| Path::new(DEFAULT_STATE_DIR)),
        );
        let workspace_root = file
            .workspace_root
            .as_deref()
            .map(under_root)
            .unwrap_or_else(|| state_dir.join("worktrees"));
        let logs_dir = state_dir.join("logs");

        let phases = build_phases(file.phases.as_deref())?;
        let graph = TaskGraph::load(&file.tasks, &file.runners, &phases, &project_root)?;
        let artifacts = file
            .artifacts
            .iter()
            .map(|(name, path)| (name.clone(), under_root(path)))
            .collect();

        Ok(Self {
            config_path: config_path.to_path_buf(),
            ledger_path: state_dir.join("ledger.jsonl"),
            lock_path: state_dir.join("run.lock"),
            runs_dir: state_dir.join("runs"),
            status_log: logs_dir.join("status.log"),
            alerts_log: logs_dir.join("alerts.log"),
            timing: Timing::from(&file.timing),
            max_parallel: file.max_parallel,
            resume: file.resume,
            include_manual: file.include_manual,
            offline: env.offline,
            skip_discovery: env.skip_discovery,
            worker_noop: env.worker_noop,
            phases,
            graph,
            artifacts,
            report: file.report,
            project_root,
            state_dir,
            workspace_root,
            logs_dir,
        })
    }

    pub fn ensure_directories(&self) -> EngineResult<()> {
        for dir in [&self.state_dir, &self.logs_dir, &self.runs_dir] {
            std::fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
        }
        Ok(())
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Phases excluded when the whole run is requested.
    pub fn skipped_phases(&self) -> Vec<&str> {
        if self.skip_discovery {
            vec!["discovery"]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreman_config::ConfigFormat;
    use tempfile::tempdir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("foreman.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_resolves_paths_relative_to_project_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("repo")).unwrap();
        let path = write_config(
            dir.path(),
            r#"
project_root = "repo"

[artifacts]
approval = "docs/approval.md"

[[tasks]]
name = "core"
command = "true"
"#,
        );
        let config = RunConfig::load(&path).unwrap();
        let root = dir.path().join("repo").canonicalize().unwrap();
        assert_eq!(config.project_root, root);
        assert_eq!(config.state_dir, root.join(".foreman"));
        assert_eq!(config.workspace_root, root.join(".foreman/worktrees"));
        assert_eq!(config.ledger_path, root.join(".foreman/ledger.jsonl"));
        assert_eq!(config.lock_path, root.join(".foreman/run.lock"));
        assert_eq!(config.artifacts["approval"], root.join("docs/approval.md"));
        assert_eq!(config.phases.len(), 4);
        assert_eq!(config.graph.tasks().len(), 1);
    }

    #[test]
    fn test_missing_file_and_missing_root_are_config_errors() {
        let dir = tempdir().unwrap();
        let err = RunConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let path = write_config(dir.path(), "project_root = \"absent\"\n");
        let err = RunConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Project root does not exist"));
    }

    #[test]
    fn test_env_overrides_flow_into_timing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        let file =
            ForemanFile::parse("[timing]\nstall_timeout_secs = 0\n", ConfigFormat::Toml).unwrap();
        let env = EnvOverrides {
            poll_interval_secs: Some(0.1),
            status_interval_secs: Some(0),
            worker_noop: true,
            skip_discovery: true,
            ..Default::default()
        };
        let config = RunConfig::from_file(file, &path, &env).unwrap();
        assert_eq!(config.timing.poll_interval, Duration::from_millis(100));
        assert_eq!(config.timing.stall_timeout, None);
        assert_eq!(config.timing.status_interval, None);
        assert!(config.worker_noop);
        assert_eq!(config.skipped_phases(), vec!["discovery"]);
    }

    #[test]
    fn test_validation_problems_are_reported_together() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "max_parallel = 0\n[timing]\npoll_interval_secs = -1.0\n",
        );
        let err = RunConfig::load(&path).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("max_parallel"));
        assert!(msg.contains("poll_interval_secs"));
    }

    #[test]
    fn test_huge_poll_interval_override_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        let env = EnvOverrides {
            poll_interval_secs: Some(1e20),
            ..Default::default()
        };
        let err = RunConfig::from_file(ForemanFile::default(), &path, &env).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)), "{:?}", err);
        assert!(err.to_string().contains("poll_interval_secs"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), "state_dir = \"state\"\n");
        let config = RunConfig::load(&path).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.logs_dir.is_dir());
        assert!(config.runs_dir.is_dir());
    }
}
