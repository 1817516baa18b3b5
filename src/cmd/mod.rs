//! CLI command implementations.
//!
//! | Module   | Commands handled                    |
//! |----------|-------------------------------------|
//! | `run`    | `Run`                               |
//! | `status` | `Status`, `Ledger`, `Lock`, `Prune` |

pub mod run;
pub mod status;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

use foreman::{EngineError, EngineResult, RunConfig};

use super::{Cli, Commands};

pub use run::cmd_run;
pub use status::{cmd_ledger, cmd_lock, cmd_prune, cmd_status};

/// Install the global subscriber: compact lines on stderr, plus JSON lines
/// in `<logs_dir>/foreman.log` when a logs directory is known.
///
/// The returned guard flushes the file writer on drop.
pub fn init_logging(verbose: bool, logs_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default = if verbose { "foreman=debug" } else { "foreman=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let (file_layer, guard) = match logs_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "foreman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .try_init();
    guard
}

pub fn print_error(error: &EngineError) {
    eprintln!("{} {}", console::style("Error:").red().bold(), error);
    if error.is_retryable() {
        eprintln!("{}", console::style("Another run is active; retry once it finishes.").dim());
    }
}

/// Run the selected command and return its exit code.
pub async fn dispatch(cli: &Cli, config: RunConfig) -> EngineResult<i32> {
    match &cli.command {
        Commands::Run {
            phase,
            include_manual,
            resume,
            run_id,
            dry_run,
        } => {
            let request = foreman::RunRequest {
                phase: phase.clone(),
                include_manual: *include_manual,
                resume: *resume,
                run_id: run_id.clone(),
                dry_run: *dry_run,
            };
            cmd_run(config, &request).await
        }
        Commands::Status => cmd_status(&config).map(|_| 0),
        Commands::Ledger { run_id, json } => {
            cmd_ledger(&config, run_id.as_deref(), *json).map(|_| 0)
        }
        Commands::Lock { command } => cmd_lock(&config, command).map(|_| 0),
        Commands::Prune => cmd_prune(&config).await.map(|_| 0),
    }
}
