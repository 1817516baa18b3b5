use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use foreman::RunConfig;
use foreman::errors::EXIT_INTERRUPTED;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Phase-gated orchestrator for supervised worker commands")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(
        short,
        long,
        global = true,
        env = "FOREMAN_CONFIG",
        default_value = "foreman.toml"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a phase and the phases it depends on (all phases if omitted)
    Run {
        #[arg(short, long)]
        phase: Option<String>,

        /// Also run tasks flagged manual
        #[arg(long)]
        include_manual: bool,

        /// Continue the latest run, skipping tasks it already completed
        #[arg(long)]
        resume: bool,

        /// Continue this run instead of the latest
        #[arg(long)]
        run_id: Option<String>,

        /// Print the resolved plan without running anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the lock holder and the latest run's task states
    Status,
    /// Print ledger events for a run
    Ledger {
        /// Defaults to the latest run
        #[arg(long)]
        run_id: Option<String>,

        /// One JSON event per line
        #[arg(long)]
        json: bool,
    },
    /// Inspect or clear the run lock
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Remove worktrees under the workspace root and prune git bookkeeping
    Prune,
}

#[derive(Subcommand, Clone)]
pub enum LockCommands {
    /// Show the current holder
    Show,
    /// Remove a stale lock file
    Clear {
        /// Remove even if the recorded pid is alive
        #[arg(long)]
        force: bool,
    },
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

fn exit_with(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match RunConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            let _guard = cmd::init_logging(cli.verbose, None);
            cmd::print_error(&e);
            return exit_with(e.exit_code());
        }
    };
    let _guard = cmd::init_logging(cli.verbose, Some(&config.logs_dir));

    // Dropping the command future on a signal releases the run lock and
    // kills every worker process group still running.
    let code = tokio::select! {
        result = cmd::dispatch(&cli, config) => match result {
            Ok(code) => code,
            Err(e) => {
                cmd::print_error(&e);
                e.exit_code()
            }
        },
        _ = shutdown_signal() => {
            tracing::warn!("Interrupted; stopping workers");
            cmd::print_error(&foreman::EngineError::Interrupted);
            EXIT_INTERRUPTED
        }
    };
    exit_with(code)
}
