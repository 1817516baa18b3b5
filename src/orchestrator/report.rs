//! Run reports: a JSON summary per invocation and the optional publish hook.

use chrono::Local;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::errors::{EngineError, EngineResult};
use crate::orchestrator::manager::RunOutcome;
use crate::util::{render_template, shell_quote};

/// Write `outcome` to `<runs_dir>/<timestamp>_<run_id>.json`.
pub fn write_report(runs_dir: &Path, outcome: &RunOutcome) -> EngineResult<PathBuf> {
    std::fs::create_dir_all(runs_dir).map_err(|e| EngineError::io(runs_dir, e))?;
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let path = runs_dir.join(format!("{}_{}.json", stamp, outcome.run_id));
    let json = serde_json::to_string_pretty(outcome)
        .map_err(|e| EngineError::Other(anyhow::anyhow!("Failed to serialize run report: {}", e)))?;
    std::fs::write(&path, json).map_err(|e| EngineError::io(&path, e))?;
    info!(path = %path.display(), "Run report written");
    Ok(path)
}

/// Whether the publish hook applies to this outcome.
fn should_publish(config: &RunConfig, outcome: &RunOutcome) -> bool {
    if config.report.command.is_none() || config.offline || outcome.report_path.is_none() {
        return false;
    }
    outcome
        .phases
        .iter()
        .any(|p| config.report.phases.iter().any(|name| name == &p.name))
}

/// Run the configured report command. Failures are logged and otherwise
/// ignored; they never change the run's outcome.
pub async fn publish(config: &RunConfig, outcome: &RunOutcome) {
    if !should_publish(config, outcome) {
        return;
    }
    let (Some(template), Some(report)) = (&config.report.command, &outcome.report_path) else {
        return;
    };
    let vars = HashMap::from([
        ("run_id", shell_quote(&outcome.run_id)),
        ("report", shell_quote(&report.display().to_string())),
    ]);
    let command = match render_template(template, &vars) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %format!("{:#}", e), "Report command template invalid; not publishing");
            return;
        }
    };

    let limit = Duration::from_secs(config.report.timeout_secs);
    let output = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(&config.project_root)
        .env("FOREMAN_RUN_ID", &outcome.run_id)
        .env("FOREMAN_REPORT", report)
        .env("FOREMAN_EXIT_CODE", outcome.exit_code().to_string())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(limit, output).await {
        Ok(Ok(output)) if output.status.success() => {
            info!(run_id = %outcome.run_id, "Run report published");
        }
        Ok(Ok(output)) => warn!(
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Report command failed"
        ),
        Ok(Err(e)) => warn!(error = %e, "Report command could not start"),
        Err(_) => warn!(
            timeout_secs = config.report.timeout_secs,
            "Report command timed out; killed"
        ),
    }
}
