//! Artifact handoff between phases.
//!
//! A task declares named outputs relative to its workspace. After the task
//! completes, the registry records where each output lives so that later
//! phases can gate on it. Contents are never interpreted; a required artifact
//! only has to exist and be non-empty.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};
use crate::task_graph::OutputDecl;

/// A named file or directory produced by a task, or supplied externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub name: String,
    pub path: PathBuf,
    /// `(phase, task)` of the producer; `None` for external artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer: Option<(String, String)>,
    /// Whether the path held content when it was exposed.
    pub present: bool,
}

/// True when `path` is a non-empty file or a directory with at least one entry.
pub fn has_content(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len() > 0,
        Ok(meta) if meta.is_dir() => std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false),
        _ => false,
    }
}

/// Registry of artifacts visible to the current run.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRegistry {
    external: BTreeMap<String, PathBuf>,
    exposed: Vec<ArtifactRef>,
}

impl ArtifactRegistry {
    pub fn new(external: BTreeMap<String, PathBuf>) -> Self {
        Self {
            external,
            exposed: Vec::new(),
        }
    }

    /// Record the declared outputs of a completed task.
    ///
    /// Outputs resolve against `workspace`. Missing outputs are still
    /// recorded (with `present = false`) so a later `require` names the path
    /// the producer was expected to write.
    pub fn expose(
        &mut self,
        phase: &str,
        task: &str,
        workspace: &Path,
        declared: &[OutputDecl],
    ) -> Vec<ArtifactRef> {
        let mut refs = Vec::with_capacity(declared.len());
        for decl in declared {
            let path = workspace.join(&decl.path);
            let present = has_content(&path);
            if present {
                debug!(artifact = %decl.name, path = %path.display(), "Artifact exposed");
            } else {
                warn!(
                    artifact = %decl.name,
                    task,
                    path = %path.display(),
                    "Declared output missing or empty after task completed"
                );
            }
            let artifact = ArtifactRef {
                name: decl.name.clone(),
                path,
                producer: Some((phase.to_string(), task.to_string())),
                present,
            };
            self.exposed.retain(|a| a.name != artifact.name);
            self.exposed.push(artifact.clone());
            refs.push(artifact);
        }
        refs
    }

    /// Locate an artifact by name. Task outputs take precedence over
    /// external declarations.
    pub fn lookup(&self, name: &str) -> Option<ArtifactRef> {
        if let Some(a) = self.exposed.iter().find(|a| a.name == name) {
            return Some(a.clone());
        }
        self.external.get(name).map(|path| ArtifactRef {
            name: name.to_string(),
            path: path.clone(),
            producer: None,
            present: has_content(path),
        })
    }

    /// Require an artifact for `phase`. It must exist and be non-empty now,
    /// regardless of what was observed at expose time.
    pub fn require(&self, phase: &str, name: &str) -> EngineResult<ArtifactRef> {
        let Some(mut artifact) = self.lookup(name) else {
            return Err(EngineError::ArtifactMissing {
                phase: phase.to_string(),
                name: name.to_string(),
                path: PathBuf::from(format!("<undeclared:{}>", name)),
            });
        };
        artifact.present = has_content(&artifact.path);
        if !artifact.present {
            return Err(EngineError::ArtifactMissing {
                phase: phase.to_string(),
                name: name.to_string(),
                path: artifact.path,
            });
        }
        Ok(artifact)
    }

    pub fn exposed(&self) -> &[ArtifactRef] {
        &self.exposed
    }
}
