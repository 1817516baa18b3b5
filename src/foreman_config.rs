//! On-disk configuration document and environment overrides.
//!
//! The configuration file enumerates phases, tasks, runner templates and the
//! engine's timing parameters. It may be written as TOML, JSON or YAML; the
//! format is chosen from the file extension.
//!
//! ```toml
//! project_root = "."
//! max_parallel = 4
//!
//! [timing]
//! poll_interval_secs = 2.0
//! stall_timeout_secs = 900
//! stall_kill = true
//!
//! [runners.codex]
//! command = "codex exec - < {prompt}"
//!
//! [[phases]]
//! name = "main"
//! privileged = true
//!
//! [[tasks]]
//! name = "core"
//! phase = "main"
//! runner = "codex"
//! prompt = "prompts/core.md"
//! ```
//!
//! Layering is file → environment (`FOREMAN_*`) → CLI flags. The CLI layer is
//! applied by the caller when it builds the run request.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::phase::GateKind;
use crate::task_graph::{FinalizeAction, WorkspacePolicy};
use crate::util::parse_bool;

/// Timing parameters for the process supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingSection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,
    /// Detailed status line cadence; 0 disables it.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// 0 disables stall detection entirely.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_stall_kill")]
    pub stall_kill: bool,
    /// Terminate a warned-but-not-killed stall once it lasts this long.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall_hard_limit_secs: Option<u64>,
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
}

/// Upper bound for every timing value, in seconds (30 days).
pub const MAX_TIMING_SECS: u64 = 30 * 24 * 60 * 60;

fn default_poll_interval() -> f64 {
    2.0
}

fn default_progress_interval() -> u64 {
    60
}

fn default_status_interval() -> u64 {
    10
}

fn default_stall_timeout() -> u64 {
    900
}

fn default_stall_kill() -> bool {
    true
}

fn default_kill_grace() -> u64 {
    5
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            progress_interval_secs: default_progress_interval(),
            status_interval_secs: default_status_interval(),
            stall_timeout_secs: default_stall_timeout(),
            stall_kill: default_stall_kill(),
            stall_hard_limit_secs: None,
            kill_grace_secs: default_kill_grace(),
        }
    }
}

/// A named worker command template. `{prompt}` is replaced with the task's
/// resolved prompt path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSection {
    pub command: String,
}

/// Optional post-run publish hook for the reporting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_report_phases")]
    pub phases: Vec<String>,
    /// Seconds the publish command may run before it is killed.
    #[serde(default = "default_report_timeout")]
    pub timeout_secs: u64,
}

fn default_report_phases() -> Vec<String> {
    vec!["main".to_string(), "post".to_string(), "legacy".to_string()]
}

fn default_report_timeout() -> u64 {
    300
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            command: None,
            phases: default_report_phases(),
            timeout_secs: default_report_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseSection {
    pub name: String,
    /// Acquires the run lock for the phase's duration.
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub gate: GateKind,
    /// Artifact name checked when `gate = "approval"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSection {
    pub name: String,
    #[serde(default = "default_task_phase")]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PathBuf>,
    #[serde(default)]
    pub workspace: WorkspacePolicy,
    #[serde(default)]
    pub on_success: FinalizeAction,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

fn default_task_phase() -> String {
    "main".to_string()
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_parallel() -> usize {
    4
}

/// The complete configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForemanFile {
    /// Resolved relative to the configuration file's directory.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Lock, ledger, logs and run reports. Defaults to `.foreman`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Parent directory for dedicated worktrees. Defaults to `<state_dir>/worktrees`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub include_manual: bool,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub runners: BTreeMap<String, RunnerSection>,
    /// Externally produced artifacts, such as human approval records.
    #[serde(default)]
    pub artifacts: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub report: ReportSection,
    /// Omitted means the default `discovery, main, legacy, post` list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<PhaseSection>>,
    #[serde(default)]
    pub tasks: Vec<TaskSection>,
}

impl Default for ForemanFile {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            state_dir: None,
            workspace_root: None,
            max_parallel: default_max_parallel(),
            resume: false,
            include_manual: false,
            timing: TimingSection::default(),
            runners: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            report: ReportSection::default(),
            phases: None,
            tasks: Vec::new(),
        }
    }
}

/// Serialization format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("toml") => Some(ConfigFormat::Toml),
            Some("json") => Some(ConfigFormat::Json),
            Some("yaml") | Some("yml") => Some(ConfigFormat::Yaml),
            _ => None,
        }
    }
}

impl ForemanFile {
    /// Load a configuration document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        match ConfigFormat::from_path(path) {
            Some(format) => Self::parse(&content, format)
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
            None => Self::parse_any(&content)
                .with_context(|| format!("Unsupported config format: {}", path.display())),
        }
    }

    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        match format {
            ConfigFormat::Toml => toml::from_str(content).context("Invalid TOML"),
            ConfigFormat::Json => serde_json::from_str(content).context("Invalid JSON"),
            ConfigFormat::Yaml => serde_yaml::from_str(content).context("Invalid YAML"),
        }
    }

    /// Try TOML, then JSON, then YAML.
    fn parse_any(content: &str) -> Result<Self> {
        Self::parse(content, ConfigFormat::Toml)
            .or_else(|_| Self::parse(content, ConfigFormat::Json))
            .or_else(|_| Self::parse(content, ConfigFormat::Yaml))
            .map_err(|_| anyhow!("content is not valid TOML, JSON or YAML"))
    }

    /// Validate field ranges that serde cannot express.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let t = &self.timing;
        if !(t.poll_interval_secs.is_finite() && t.poll_interval_secs > 0.0) {
            problems.push(format!(
                "timing.poll_interval_secs must be positive, got {}",
                t.poll_interval_secs
            ));
        } else if t.poll_interval_secs > MAX_TIMING_SECS as f64 {
            problems.push(format!(
                "timing.poll_interval_secs must be at most {}, got {}",
                MAX_TIMING_SECS, t.poll_interval_secs
            ));
        }
        let whole = [
            ("progress_interval_secs", Some(t.progress_interval_secs)),
            ("status_interval_secs", Some(t.status_interval_secs)),
            ("stall_timeout_secs", Some(t.stall_timeout_secs)),
            ("stall_hard_limit_secs", t.stall_hard_limit_secs),
            ("kill_grace_secs", Some(t.kill_grace_secs)),
        ];
        for (field, value) in whole {
            if let Some(value) = value
                && value > MAX_TIMING_SECS
            {
                problems.push(format!(
                    "timing.{} must be at most {}, got {}",
                    field, MAX_TIMING_SECS, value
                ));
            }
        }
        if self.timing.progress_interval_secs == 0 {
            problems.push("timing.progress_interval_secs must be at least 1".to_string());
        }
        if self.max_parallel == 0 {
            problems.push("max_parallel must be at least 1".to_string());
        }
        if let Some(limit) = self.timing.stall_hard_limit_secs
            && limit < self.timing.stall_timeout_secs
        {
            problems.push(format!(
                "timing.stall_hard_limit_secs ({}) is shorter than stall_timeout_secs ({})",
                limit, self.timing.stall_timeout_secs
            ));
        }
        for (name, runner) in &self.runners {
            if runner.command.trim().is_empty() {
                problems.push(format!("Runner '{}' has empty command", name));
            }
        }
        problems
    }
}

/// Values read from `FOREMAN_*` environment variables. Each one overrides the
/// matching configuration default without requiring a config edit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub poll_interval_secs: Option<f64>,
    pub progress_interval_secs: Option<u64>,
    pub status_interval_secs: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
    pub stall_kill: Option<bool>,
    pub stall_hard_limit_secs: Option<u64>,
    pub max_parallel: Option<usize>,
    pub resume: Option<bool>,
    pub offline: bool,
    pub skip_discovery: bool,
    pub worker_noop: bool,
}

impl EnvOverrides {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn num<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
        ) -> Result<Option<T>> {
            match lookup(key) {
                Some(raw) if !raw.trim().is_empty() => raw
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| anyhow!("{} must be a number, got '{}'", key, raw)),
                _ => Ok(None),
            }
        }
        fn flag(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
            match lookup(key) {
                Some(raw) => parse_bool(&raw)
                    .map(Some)
                    .ok_or_else(|| anyhow!("{} must be a boolean, got '{}'", key, raw)),
                None => Ok(None),
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        Ok(Self {
            poll_interval_secs: num(lookup, "FOREMAN_POLL_INTERVAL")?,
            progress_interval_secs: num(lookup, "FOREMAN_PROGRESS_INTERVAL")?,
            status_interval_secs: num(lookup, "FOREMAN_STATUS_INTERVAL")?,
            stall_timeout_secs: num(lookup, "FOREMAN_STALL_TIMEOUT")?,
            stall_kill: flag(lookup, "FOREMAN_STALL_KILL")?,
            stall_hard_limit_secs: num(lookup, "FOREMAN_STALL_HARD_LIMIT")?,
            max_parallel: num(lookup, "FOREMAN_MAX_PARALLEL")?,
            resume: flag(lookup, "FOREMAN_RESUME")?,
            offline: flag(lookup, "FOREMAN_OFFLINE")?.unwrap_or(false),
            skip_discovery: flag(lookup, "FOREMAN_SKIP_DISCOVERY")?.unwrap_or(false),
            worker_noop: flag(lookup, "FOREMAN_WORKER_NOOP")?.unwrap_or(false),
        })
    }

    /// Apply the overrides that map onto file settings.
    pub fn apply(&self, file: &mut ForemanFile) {
        let timing = &mut file.timing;
        if let Some(v) = self.poll_interval_secs {
            timing.poll_interval_secs = v;
        }
        if let Some(v) = self.progress_interval_secs {
            timing.progress_interval_secs = v;
        }
        if let Some(v) = self.status_interval_secs {
            timing.status_interval_secs = v;
        }
        if let Some(v) = self.stall_timeout_secs {
            timing.stall_timeout_secs = v;
        }
        if let Some(v) = self.stall_kill {
            timing.stall_kill = v;
        }
        if let Some(v) = self.stall_hard_limit_secs {
            timing.stall_hard_limit_secs = Some(v);
        }
        if let Some(v) = self.max_parallel {
            file.max_parallel = v;
        }
        if let Some(v) = self.resume {
            file.resume = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE_TOML: &str = r#"
project_root = ".."
max_parallel = 2

[timing]
poll_interval_secs = 0.5
stall_timeout_secs = 30
stall_kill = false

[runners.codex]
command = "codex exec {prompt}"

[artifacts]
legacy_approval = "docs/approval.md"

[[phases]]
name = "main"
privileged = true

[[phases]]
name = "post"
gate = "lock_absent"

[[tasks]]
name = "core"
runner = "codex"
prompt = "prompts/core.md"
outputs = { report = "docs/report.md" }

[[tasks]]
name = "review"
phase = "post"
command = "true"
workspace = "shared"
"#;

    #[test]
    fn test_parse_toml_document() {
        let file = ForemanFile::parse(SAMPLE_TOML, ConfigFormat::Toml).unwrap();
        assert_eq!(file.project_root, PathBuf::from(".."));
        assert_eq!(file.max_parallel, 2);
        assert_eq!(file.timing.poll_interval_secs, 0.5);
        assert!(!file.timing.stall_kill);
        // unspecified timing fields keep their defaults
        assert_eq!(file.timing.status_interval_secs, 10);
        let phases = file.phases.as_ref().unwrap();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[1].gate, GateKind::LockAbsent);
        assert_eq!(file.tasks[0].phase, "main");
        assert_eq!(file.tasks[1].workspace, WorkspacePolicy::Shared);
        assert_eq!(
            file.tasks[0].outputs.get("report"),
            Some(&PathBuf::from("docs/report.md"))
        );
    }

    #[test]
    fn test_parse_json_and_yaml_documents() {
        let json = r#"{"tasks": [{"name": "a", "command": "true"}], "timing": {"stall_timeout_secs": 5}}"#;
        let file = ForemanFile::parse(json, ConfigFormat::Json).unwrap();
        assert_eq!(file.tasks.len(), 1);
        assert_eq!(file.timing.stall_timeout_secs, 5);

        let yaml = "tasks:\n  - name: a\n    command: \"true\"\n    manual: true\n";
        let file = ForemanFile::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert!(file.tasks[0].manual);
    }

    #[test]
    fn test_unknown_task_field_is_rejected() {
        let toml = "[[tasks]]\nname = \"a\"\ncommand = \"true\"\nworkspce = \"shared\"\n";
        assert!(ForemanFile::parse(toml, ConfigFormat::Toml).is_err());
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("foreman.TOML")),
            Some(ConfigFormat::Toml)
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("x.yml")),
            Some(ConfigFormat::Yaml)
        );
        assert_eq!(ConfigFormat::from_path(Path::new("x.cfg")), None);
    }

    #[test]
    fn test_load_unknown_extension_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.conf");
        std::fs::write(&path, r#"{"max_parallel": 3}"#).unwrap();
        let file = ForemanFile::load(&path).unwrap();
        assert_eq!(file.max_parallel, 3);
    }

    #[test]
    fn test_validate_reports_bad_ranges() {
        let mut file = ForemanFile::default();
        file.timing.poll_interval_secs = 0.0;
        file.max_parallel = 0;
        file.timing.stall_hard_limit_secs = Some(10);
        let problems = file.validate();
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn test_validate_rejects_oversized_timing() {
        let mut file = ForemanFile::default();
        file.timing.poll_interval_secs = 1e20;
        file.timing.progress_interval_secs = u64::MAX;
        file.timing.stall_timeout_secs = MAX_TIMING_SECS;
        let problems = file.validate();
        assert_eq!(problems.len(), 2, "{:?}", problems);
        assert!(problems[0].contains("poll_interval_secs must be at most"));
        assert!(problems[1].contains("progress_interval_secs"));
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides_apply() {
        let env = EnvOverrides::from_lookup(lookup(&[
            ("FOREMAN_POLL_INTERVAL", "0.25"),
            ("FOREMAN_STALL_TIMEOUT", "5"),
            ("FOREMAN_STALL_KILL", "no"),
            ("FOREMAN_RESUME", "1"),
            ("FOREMAN_OFFLINE", "true"),
        ]))
        .unwrap();
        let mut file = ForemanFile::default();
        env.apply(&mut file);
        assert_eq!(file.timing.poll_interval_secs, 0.25);
        assert_eq!(file.timing.stall_timeout_secs, 5);
        assert!(!file.timing.stall_kill);
        assert!(file.resume);
        assert!(env.offline);
        assert!(!env.skip_discovery);
    }

    #[test]
    fn test_env_overrides_reject_malformed_values() {
        let err = EnvOverrides::from_lookup(lookup(&[("FOREMAN_STALL_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("FOREMAN_STALL_TIMEOUT"));

        let err = EnvOverrides::from_lookup(lookup(&[("FOREMAN_STALL_KILL", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("FOREMAN_STALL_KILL"));
    }

    #[test]
    fn test_empty_env_leaves_defaults() {
        let env = EnvOverrides::from_lookup(|_| None).unwrap();
        let mut file = ForemanFile::default();
        env.apply(&mut file);
        assert_eq!(file, ForemanFile::default());
    }
}
