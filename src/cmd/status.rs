//! Inspection and housekeeping commands: status, ledger, lock, prune.

use console::style;

use foreman::orchestrator::ledger::{ReplayStatus, validate_trace};
use foreman::orchestrator::{Ledger, Replay, RunLock, TaskState};
use foreman::workspace::WorkspacePool;
use foreman::{EngineError, EngineResult, RunConfig};

use super::super::LockCommands;

fn print_lock(lock: &RunLock) {
    match lock.holder() {
        Some(info) => {
            let alive = if foreman::orchestrator::lock::pid_alive(info.pid) {
                style("alive").green()
            } else {
                style("not running (stale?)").yellow()
            };
            println!(
                "Lock: held by run {} (phase '{}', pid {} {}, since {})",
                info.run_id,
                info.phase,
                info.pid,
                alive,
                info.started_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        None if lock.is_held() => println!(
            "Lock: {} exists but is unreadable",
            lock.path().display()
        ),
        None => println!("Lock: free"),
    }
}

fn status_marker(status: ReplayStatus) -> console::StyledObject<&'static str> {
    match status {
        ReplayStatus::Completed => style("completed").green(),
        ReplayStatus::Failed => style("failed").red().bold(),
        ReplayStatus::Skipped => style("skipped").yellow(),
        ReplayStatus::Incomplete => style("incomplete").cyan(),
    }
}

pub fn cmd_status(config: &RunConfig) -> EngineResult<()> {
    println!();
    print_lock(&RunLock::new(&config.lock_path));

    let ledger = Ledger::new(&config.ledger_path);
    let Some(run_id) = ledger.latest_run_id()? else {
        println!("No runs recorded in {}", ledger.path().display());
        println!();
        return Ok(());
    };
    let events = ledger.query(&run_id)?;
    let replay = Replay::from_events(&events);

    println!(
        "Latest run: {} ({} recorded)",
        style(&run_id).bold(),
        ledger.run_ids()?.len()
    );
    println!();
    println!(
        "{:<12} {:<24} {:<12} {:<8} Last update",
        "Phase", "Task", "State", "Attempts"
    );
    println!(
        "{:<12} {:<24} {:<12} {:<8} -----------",
        "-----", "----", "-----", "--------"
    );
    for ((phase, task), record) in replay.records() {
        println!(
            "{:<12} {:<24} {:<12} {:<8} {}",
            phase,
            task,
            status_marker(record.status),
            record.attempts,
            record.last_update.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(cause) = &record.cause {
            println!("{:<12} {:<24} {}", "", "", style(cause).red());
        }
        if record.status != ReplayStatus::Completed
            && let Some(log) = &record.log
        {
            println!("{:<12} {:<24} log: {}", "", "", log.display());
        }
    }

    let violations = validate_trace(&events);
    if !violations.is_empty() {
        println!();
        println!("{}", style("Ledger ordering violations:").red().bold());
        for violation in &violations {
            println!("  {}", violation);
        }
    }
    println!();
    Ok(())
}

fn describe(state: &TaskState) -> String {
    match state {
        TaskState::Started {
            attempt,
            workspace,
            branch,
            ..
        } => {
            let mut text = format!("started #{}", attempt);
            if let Some(branch) = branch {
                text.push_str(&format!(" on {}", branch));
            } else if let Some(workspace) = workspace {
                text.push_str(&format!(" in {}", workspace.display()));
            }
            text
        }
        TaskState::Completed { exit_code } => format!("completed (exit {})", exit_code),
        TaskState::Failed { cause } => format!("failed: {}", cause),
        TaskState::Skipped { reason } => format!("skipped: {}", reason),
    }
}

pub fn cmd_ledger(config: &RunConfig, run_id: Option<&str>, json: bool) -> EngineResult<()> {
    let ledger = Ledger::new(&config.ledger_path);
    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => match ledger.latest_run_id()? {
            Some(id) => id,
            None => {
                if !json {
                    println!("No runs recorded in {}", ledger.path().display());
                }
                return Ok(());
            }
        },
    };
    for event in ledger.query(&run_id)? {
        if json {
            let line = serde_json::to_string(&event)
                .map_err(|e| EngineError::Other(anyhow::anyhow!("Failed to encode event: {}", e)))?;
            println!("{}", line);
        } else {
            println!(
                "{} {:<10} {:<24} {}",
                style(event.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
                event.phase,
                event.task,
                describe(&event.state)
            );
        }
    }
    Ok(())
}

pub fn cmd_lock(config: &RunConfig, command: &LockCommands) -> EngineResult<()> {
    let lock = RunLock::new(&config.lock_path);
    match command {
        LockCommands::Show => print_lock(&lock),
        LockCommands::Clear { force } => match lock.clear(*force)? {
            Some(info) => println!(
                "{} lock held by run {} (pid {})",
                style("Removed").green(),
                info.run_id,
                info.pid
            ),
            None if lock.is_held() => println!("Lock file could not be parsed; left in place"),
            None => println!("Lock: free"),
        },
    }
    Ok(())
}

pub async fn cmd_prune(config: &RunConfig) -> EngineResult<()> {
    let lock = RunLock::new(&config.lock_path);
    lock.ensure_absent("prune")?;
    let pool = WorkspacePool::open(&config.project_root)?;
    let removed = pool.prune_under(&config.workspace_root).await?;
    if removed.is_empty() {
        println!("No worktrees under {}", config.workspace_root.display());
    }
    for path in &removed {
        println!("{} {}", style("Removed").green(), path.display());
    }
    Ok(())
}
