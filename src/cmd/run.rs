//! `foreman run`: drive the phase manager and print a summary.

use console::style;

use foreman::orchestrator::manager::{PhaseReport, RunFailure, TaskReport, TaskStatus};
use foreman::{
    EngineError, EngineResult, PhaseManager, RunConfig, RunOutcome, RunRequest, RunStatus,
};

fn task_marker(status: TaskStatus) -> console::StyledObject<&'static str> {
    match status {
        TaskStatus::Completed => style("done").green(),
        TaskStatus::AlreadyCompleted => style("done (earlier)").green().dim(),
        TaskStatus::Failed => style("FAILED").red().bold(),
        TaskStatus::Skipped => style("skipped").yellow(),
        TaskStatus::NotStarted => style("not started").dim(),
        TaskStatus::Planned => style("planned").cyan(),
    }
}

fn print_task(task: &TaskReport) {
    let attempt = task.attempt.map(|a| format!(" #{}", a)).unwrap_or_default();
    println!("    {:<24} {}{}", task.name, task_marker(task.status), attempt);
    if let Some(branch) = &task.branch {
        println!("      branch:    {}", branch);
    }
    if let Some(workspace) = &task.workspace {
        println!("      workspace: {}", workspace.display());
    }
    if let Some(finalized) = &task.finalized {
        println!("      workspace {}", finalized);
    }
    if let Some(cause) = &task.cause {
        println!("      cause:     {}", style(cause).red());
    }
    if let Some(reason) = &task.reason {
        println!("      reason:    {}", reason);
    }
    if let Some(log) = &task.log
        && task.status != TaskStatus::Completed
    {
        println!("      log:       {}", log.display());
    }
}

fn print_phase(phase: &PhaseReport) {
    println!(
        "  {} {}",
        style(format!("[{}]", phase.name)).bold(),
        style(format!("{:?}", phase.status)).dim()
    );
    for task in &phase.tasks {
        print_task(task);
    }
    for name in &phase.pending_manual {
        println!(
            "    {:<24} {}",
            name,
            style("awaiting manual invocation (--include-manual)").yellow()
        );
    }
}

fn print_failure(failure: &RunFailure) {
    println!(
        "{} task '{}' in phase '{}': {}",
        style("Run failed:").red().bold(),
        failure.task,
        failure.phase,
        failure.cause
    );
    if let Some(log) = &failure.log {
        println!("  log: {}", log.display());
    }
}

pub fn print_outcome(outcome: &RunOutcome) {
    println!();
    let resumed = if outcome.resumed { " (resumed)" } else { "" };
    println!(
        "{} {}{}",
        style("Run").bold().cyan(),
        outcome.run_id,
        resumed
    );
    for phase in &outcome.phases {
        print_phase(phase);
    }
    println!();
    match &outcome.status {
        RunStatus::Succeeded => println!("{}", style("Run completed").green().bold()),
        RunStatus::DryRun => println!("{}", style("Dry run: nothing was executed").cyan()),
        RunStatus::Paused {
            phase,
            artifact,
            path,
        } => println!(
            "{} phase '{}' waits for approval '{}' at {}",
            style("Paused:").yellow().bold(),
            phase,
            artifact,
            path.display()
        ),
        RunStatus::Failed(failure) => print_failure(failure),
    }
    if let Some(report) = &outcome.report_path {
        println!("Report: {}", report.display());
    }
}

pub async fn cmd_run(config: RunConfig, request: &RunRequest) -> EngineResult<i32> {
    let manager = PhaseManager::new(config);
    let outcome = manager.run(request).await?;
    print_outcome(&outcome);
    if let RunStatus::Failed(failure) = &outcome.status {
        super::print_error(&EngineError::from(failure));
    }
    Ok(outcome.exit_code())
}
