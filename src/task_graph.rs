//! Task graph loading, validation and per-phase selection.
//!
//! Tasks are normalized from configuration sections into immutable [`Task`]
//! values. Loading rejects anything that would only fail later at run time:
//! unknown phases or runners, missing prompts for runner tasks, dependency
//! cycles, and path templates with unknown placeholders.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use crate::errors::{EngineError, EngineResult};
use crate::foreman_config::{RunnerSection, TaskSection};
use crate::phase::Phase;
use crate::util::{render_template, shell_quote, template_keys};

pub const DEFAULT_BRANCH_TEMPLATE: &str = "foreman/{run_id}/{task}-{attempt}";
pub const DEFAULT_WORKTREE_TEMPLATE: &str = "{workspace_root}/{run_id}/{task}-{attempt}";
pub const DEFAULT_LOG_TEMPLATE: &str = "{logs_dir}/{run_id}/{phase}-{task}-{attempt}.log";

const PATH_KEYS: &[&str] = &[
    "run_id",
    "phase",
    "task",
    "attempt",
    "workspace_root",
    "logs_dir",
    "project_root",
];
const RUNNER_KEYS: &[&str] = &["prompt", "run_id", "phase", "task", "attempt", "workspace"];

/// Where a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspacePolicy {
    /// A fresh git worktree on its own branch.
    #[default]
    Dedicated,
    /// The primary working tree. Such tasks never overlap with others.
    Shared,
}

/// What happens to a dedicated workspace after its task succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeAction {
    /// Merge the branch into the primary tree, then remove the worktree.
    Merge,
    /// Keep branch and worktree for a later phase or human review.
    #[default]
    Park,
    /// Remove the worktree and delete the branch.
    Discard,
}

/// The command a worker process executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// A literal shell command line.
    Shell(String),
    /// A runner template instantiated with the task's prompt.
    Runner {
        runner: String,
        template: String,
        prompt: PathBuf,
    },
}

/// A declared artifact a task produces, relative to its workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputDecl {
    pub name: String,
    pub path: PathBuf,
}

/// One unit of work. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    pub phase: String,
    pub command: WorkerCommand,
    pub workspace: WorkspacePolicy,
    pub on_success: FinalizeAction,
    /// Only runs when manual tasks are explicitly included.
    pub manual: bool,
    /// A failure does not stop the phase.
    pub optional: bool,
    pub depends_on: Vec<String>,
    /// Artifacts that must exist and be non-empty before dispatch.
    pub requires: Vec<String>,
    pub outputs: Vec<OutputDecl>,
    pub branch_template: String,
    pub worktree_template: String,
    pub log_template: String,
}

/// Values substituted into path templates.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub run_id: &'a str,
    pub attempt: u32,
    pub project_root: &'a Path,
    pub workspace_root: &'a Path,
    pub logs_dir: &'a Path,
}

/// Rendered locations for one attempt of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPaths {
    /// `None` for shared-workspace tasks.
    pub worktree: Option<PathBuf>,
    pub branch: Option<String>,
    pub log: PathBuf,
}

impl Task {
    pub fn is_dedicated(&self) -> bool {
        self.workspace == WorkspacePolicy::Dedicated
    }

    fn path_vars(&self, ctx: &RenderContext<'_>) -> HashMap<&'static str, String> {
        HashMap::from([
            ("run_id", ctx.run_id.to_string()),
            ("phase", self.phase.clone()),
            ("task", self.name.clone()),
            ("attempt", ctx.attempt.to_string()),
            ("workspace_root", ctx.workspace_root.display().to_string()),
            ("logs_dir", ctx.logs_dir.display().to_string()),
            ("project_root", ctx.project_root.display().to_string()),
        ])
    }

    /// Render worktree, branch and log locations for one attempt.
    pub fn render_paths(&self, ctx: &RenderContext<'_>) -> Result<TaskPaths> {
        let vars = self.path_vars(ctx);
        let absolute = |rendered: String| {
            let path = PathBuf::from(rendered);
            if path.is_absolute() {
                path
            } else {
                ctx.project_root.join(path)
            }
        };
        let log = absolute(render_template(&self.log_template, &vars)?);
        if !self.is_dedicated() {
            return Ok(TaskPaths {
                worktree: None,
                branch: None,
                log,
            });
        }
        let worktree = absolute(render_template(&self.worktree_template, &vars)?);
        let branch = render_template(&self.branch_template, &vars)?;
        Ok(TaskPaths {
            worktree: Some(worktree),
            branch: Some(branch),
            log,
        })
    }

    /// The shell command line to run for one attempt.
    pub fn command_line(&self, run_id: &str, attempt: u32, workspace: &Path) -> Result<String> {
        match &self.command {
            WorkerCommand::Shell(command) => Ok(command.clone()),
            WorkerCommand::Runner {
                runner,
                template,
                prompt,
            } => {
                let vars = HashMap::from([
                    ("prompt", shell_quote(&prompt.display().to_string())),
                    ("run_id", run_id.to_string()),
                    ("phase", self.phase.clone()),
                    ("task", self.name.clone()),
                    ("attempt", attempt.to_string()),
                    ("workspace", shell_quote(&workspace.display().to_string())),
                ]);
                render_template(template, &vars)
                    .with_context(|| format!("Failed to render runner '{}'", runner))
            }
        }
    }

    pub fn prompt(&self) -> Option<&Path> {
        match &self.command {
            WorkerCommand::Runner { prompt, .. } => Some(prompt),
            WorkerCommand::Shell(_) => None,
        }
    }
}

/// Tasks chosen to run in one phase.
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    pub phase: String,
    /// Declared order; dispatch honors `depends_on` on top of this.
    pub tasks: Vec<&'a Task>,
    /// Manual tasks left out because manual inclusion was not requested.
    pub pending_manual: Vec<&'a Task>,
}

/// Validated, immutable set of tasks across all phases.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

fn valid_task_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn check_keys(owner: &str, field: &str, template: &str, allowed: &[&str]) -> EngineResult<()> {
    let unknown: Vec<String> = template_keys(template)
        .into_iter()
        .filter(|k| !allowed.contains(&k.as_str()))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(EngineError::config(format!(
            "{} {} uses unknown placeholder(s): {} (allowed: {})",
            owner,
            field,
            unknown.join(", "),
            allowed.join(", ")
        )))
    }
}

impl TaskGraph {
    /// Normalize and validate task sections. Relative prompt paths resolve
    /// against `project_root`.
    pub fn load(
        sections: &[TaskSection],
        runners: &BTreeMap<String, RunnerSection>,
        phases: &[Phase],
        project_root: &Path,
    ) -> EngineResult<Self> {
        for (name, runner) in runners {
            check_keys(&format!("Runner '{}'", name), "command", &runner.command, RUNNER_KEYS)?;
        }

        let mut tasks = Vec::with_capacity(sections.len());
        let mut seen = HashSet::new();
        for section in sections {
            let task = Self::normalize(section, runners, phases, project_root)?;
            if !seen.insert(task.name.clone()) {
                return Err(EngineError::config(format!("Duplicate task '{}'", task.name)));
            }
            tasks.push(task);
        }

        let graph = Self { tasks };
        graph.validate_dependencies()?;
        Ok(graph)
    }

    fn normalize(
        section: &TaskSection,
        runners: &BTreeMap<String, RunnerSection>,
        phases: &[Phase],
        project_root: &Path,
    ) -> EngineResult<Task> {
        let name = section.name.trim().to_string();
        if !valid_task_name(&name) {
            return Err(EngineError::config(format!(
                "Invalid task name '{}': use letters, digits, '.', '_' or '-'",
                section.name
            )));
        }
        let owner = format!("Task '{}'", name);

        let Some(phase) = phases.iter().find(|p| p.name == section.phase) else {
            return Err(EngineError::config(format!(
                "{} references unknown phase '{}'",
                owner, section.phase
            )));
        };

        let command = match (&section.command, &section.runner) {
            (Some(_), Some(_)) => {
                return Err(EngineError::config(format!(
                    "{} sets both command and runner",
                    owner
                )));
            }
            (None, None) => {
                return Err(EngineError::config(format!(
                    "{} needs either command or runner",
                    owner
                )));
            }
            (Some(command), None) => {
                if command.trim().is_empty() {
                    return Err(EngineError::config(format!("{} has empty command", owner)));
                }
                WorkerCommand::Shell(command.clone())
            }
            (None, Some(runner)) => {
                let Some(def) = runners.get(runner) else {
                    return Err(EngineError::config(format!(
                        "{} references unknown runner '{}'",
                        owner, runner
                    )));
                };
                let Some(prompt) = &section.prompt else {
                    return Err(EngineError::config(format!(
                        "{} uses runner '{}' but has no prompt",
                        owner, runner
                    )));
                };
                let prompt = if prompt.is_absolute() {
                    prompt.clone()
                } else {
                    project_root.join(prompt)
                };
                WorkerCommand::Runner {
                    runner: runner.clone(),
                    template: def.command.clone(),
                    prompt,
                }
            }
        };

        if section.workspace == WorkspacePolicy::Shared
            && section.on_success != FinalizeAction::Park
        {
            return Err(EngineError::config(format!(
                "{} runs in the shared workspace; only dedicated workspaces can be merged or discarded",
                owner
            )));
        }
        if section.on_success == FinalizeAction::Merge && !phase.privileged {
            return Err(EngineError::config(format!(
                "{} merges into the primary tree, but phase '{}' is not privileged",
                owner, phase.name
            )));
        }

        let branch_template = section
            .branch
            .clone()
            .unwrap_or_else(|| DEFAULT_BRANCH_TEMPLATE.to_string());
        let worktree_template = section
            .worktree
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKTREE_TEMPLATE.to_string());
        let log_template = section
            .log
            .clone()
            .unwrap_or_else(|| DEFAULT_LOG_TEMPLATE.to_string());
        check_keys(&owner, "branch", &branch_template, PATH_KEYS)?;
        check_keys(&owner, "worktree", &worktree_template, PATH_KEYS)?;
        check_keys(&owner, "log", &log_template, PATH_KEYS)?;

        let mut outputs = Vec::with_capacity(section.outputs.len());
        for (out_name, path) in &section.outputs {
            if out_name.trim().is_empty() {
                return Err(EngineError::config(format!("{} has an unnamed output", owner)));
            }
            if path.is_absolute() {
                return Err(EngineError::config(format!(
                    "{} output '{}' must be relative to its workspace",
                    owner, out_name
                )));
            }
            outputs.push(OutputDecl {
                name: out_name.clone(),
                path: path.clone(),
            });
        }
        if section.on_success == FinalizeAction::Discard && !outputs.is_empty() {
            return Err(EngineError::config(format!(
                "{} declares outputs but discards its workspace on success; use park or merge",
                owner
            )));
        }

        Ok(Task {
            name,
            phase: phase.name.clone(),
            command,
            workspace: section.workspace,
            on_success: section.on_success,
            manual: section.manual,
            optional: section.optional,
            depends_on: section.depends_on.clone(),
            requires: section.requires.clone(),
            outputs,
            branch_template,
            worktree_template,
            log_template,
        })
    }

    fn validate_dependencies(&self) -> EngineResult<()> {
        let by_name: HashMap<&str, &Task> =
            self.tasks.iter().map(|t| (t.name.as_str(), t)).collect();

        for task in &self.tasks {
            for dep in &task.depends_on {
                let Some(upstream) = by_name.get(dep.as_str()) else {
                    return Err(EngineError::config(format!(
                        "Task '{}' depends on unknown task '{}'",
                        task.name, dep
                    )));
                };
                if upstream.phase != task.phase {
                    return Err(EngineError::config(format!(
                        "Task '{}' depends on '{}' from phase '{}'; cross-phase ordering comes from phase order",
                        task.name, dep, upstream.phase
                    )));
                }
            }
        }

        // Kahn's algorithm; leftovers sit on a cycle.
        let mut indegree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| {
                let unique: HashSet<&String> = t.depends_on.iter().collect();
                (t.name.as_str(), unique.len())
            })
            .collect();
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;
        while let Some(name) = queue.pop_front() {
            visited += 1;
            for task in self.tasks.iter().filter(|t| t.depends_on.iter().any(|d| d == name)) {
                if let Some(d) = indegree.get_mut(task.name.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(task.name.as_str());
                    }
                }
            }
        }
        if visited != self.tasks.len() {
            let mut cyclic: Vec<&str> = indegree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| n)
                .collect();
            cyclic.sort();
            return Err(EngineError::config(format!(
                "Task dependency cycle involving: {}",
                cyclic.join(", ")
            )));
        }
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn in_phase<'a, 'p>(
        &'a self,
        phase: &'p str,
    ) -> impl Iterator<Item = &'a Task> + use<'a, 'p> {
        self.tasks.iter().filter(move |t| t.phase == phase)
    }

    /// Select the tasks of one phase. Manual tasks are excluded unless
    /// `include_manual`; a selected task depending on an excluded one is a
    /// configuration error.
    pub fn select(&self, phase: &str, include_manual: bool) -> EngineResult<Selection<'_>> {
        let (tasks, pending_manual): (Vec<&Task>, Vec<&Task>) = self
            .in_phase(phase)
            .partition(|t| include_manual || !t.manual);

        for task in &tasks {
            if let Some(dep) = task
                .depends_on
                .iter()
                .find(|d| pending_manual.iter().any(|m| &m.name == *d))
            {
                return Err(EngineError::config(format!(
                    "Task '{}' depends on manual task '{}'; include manual tasks to run it",
                    task.name, dep
                )));
            }
        }

        Ok(Selection {
            phase: phase.to_string(),
            tasks,
            pending_manual,
        })
    }
}
