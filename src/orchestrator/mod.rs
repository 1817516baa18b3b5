pub mod ledger;
pub mod lock;
pub mod manager;
pub mod preflight;
pub mod report;

use chrono::Local;
use uuid::Uuid;

pub use ledger::{FailureCause, Ledger, LedgerEvent, Replay, ReplayStatus, TaskState};
pub use lock::{LockGuard, LockInfo, RunLock};
pub use manager::{PhaseManager, RunOutcome, RunRequest, RunStatus};

/// Fresh run id: local timestamp plus a short random suffix.
pub fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Local::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}
