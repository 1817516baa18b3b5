//! Phase definitions and plan resolution.
//!
//! Phases execute in strict declared order. A phase may depend on earlier
//! phases; requesting a single phase pulls in its transitive dependencies.
//! Two gates exist besides the open default:
//! - `lock_absent`: refuse to start while a privileged run holds the lock
//! - `approval`: pause the run until a named artifact exists and is non-empty

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::{EngineError, EngineResult};
use crate::foreman_config::PhaseSection;

/// Gate kind as written in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    #[default]
    None,
    LockAbsent,
    Approval,
}

/// Precondition checked before a phase starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseGate {
    Open,
    LockAbsent,
    Approval { artifact: String },
}

/// A named stage of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Phase {
    pub name: String,
    /// Mutates the primary tree; holds the run lock while running.
    pub privileged: bool,
    pub gate: PhaseGate,
    pub depends_on: Vec<String>,
}

impl Phase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            privileged: false,
            gate: PhaseGate::Open,
            depends_on: Vec::new(),
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn gated(mut self, gate: PhaseGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Phases used when the configuration does not declare any.
pub fn default_phases() -> Vec<Phase> {
    vec![
        Phase::new("discovery"),
        Phase::new("main").privileged(),
        Phase::new("legacy").gated(PhaseGate::LockAbsent),
        Phase::new("post").gated(PhaseGate::LockAbsent),
    ]
}

/// Build and validate the phase list from configuration sections.
pub fn build_phases(sections: Option<&[PhaseSection]>) -> EngineResult<Vec<Phase>> {
    let Some(sections) = sections else {
        return Ok(default_phases());
    };
    if sections.is_empty() {
        return Err(EngineError::config("phases list is empty"));
    }

    let mut phases = Vec::with_capacity(sections.len());
    let mut seen: HashSet<&str> = HashSet::new();
    for section in sections {
        let name = section.name.trim();
        if name.is_empty() {
            return Err(EngineError::config("Phase with empty name"));
        }
        if !seen.insert(name) {
            return Err(EngineError::config(format!("Duplicate phase '{}'", name)));
        }
        for dep in &section.depends_on {
            if dep == name {
                return Err(EngineError::config(format!(
                    "Phase '{}' depends on itself",
                    name
                )));
            }
            // Execution follows declared order, so dependencies must come first.
            if !phases.iter().any(|p: &Phase| &p.name == dep) {
                return Err(EngineError::config(format!(
                    "Phase '{}' depends on '{}', which is not declared before it",
                    name, dep
                )));
            }
        }
        let gate = match section.gate {
            GateKind::None => PhaseGate::Open,
            GateKind::LockAbsent => PhaseGate::LockAbsent,
            GateKind::Approval => match section.approval.as_deref().map(str::trim) {
                Some(artifact) if !artifact.is_empty() => PhaseGate::Approval {
                    artifact: artifact.to_string(),
                },
                _ => {
                    return Err(EngineError::config(format!(
                        "Phase '{}' has an approval gate but no approval artifact",
                        name
                    )));
                }
            },
        };
        if section.privileged && gate == PhaseGate::LockAbsent {
            return Err(EngineError::config(format!(
                "Phase '{}' cannot be privileged and wait for the lock to be absent",
                name
            )));
        }
        phases.push(Phase {
            name: name.to_string(),
            privileged: section.privileged,
            gate,
            depends_on: section.depends_on.clone(),
        });
    }
    Ok(phases)
}

/// Resolve which phases run, in declared order.
///
/// With a requested phase, the result is that phase plus its transitive
/// dependencies. Without one, every phase runs except those in `skip`.
pub fn resolve_plan<'a>(
    phases: &'a [Phase],
    requested: Option<&str>,
    skip: &[&str],
) -> EngineResult<Vec<&'a Phase>> {
    let Some(requested) = requested else {
        return Ok(phases
            .iter()
            .filter(|p| !skip.contains(&p.name.as_str()))
            .collect());
    };

    if !phases.iter().any(|p| p.name == requested) {
        let known: Vec<&str> = phases.iter().map(|p| p.name.as_str()).collect();
        return Err(EngineError::config(format!(
            "Unknown phase '{}' (known: {})",
            requested,
            known.join(", ")
        )));
    }

    let mut wanted: HashSet<&str> = HashSet::new();
    let mut stack = vec![requested];
    while let Some(name) = stack.pop() {
        if !wanted.insert(name) {
            continue;
        }
        if let Some(phase) = phases.iter().find(|p| p.name == name) {
            stack.extend(phase.depends_on.iter().map(String::as_str));
        }
    }

    Ok(phases
        .iter()
        .filter(|p| wanted.contains(p.name.as_str()))
        .collect())
}
