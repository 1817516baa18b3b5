pub mod artifacts;
pub mod config;
pub mod errors;
pub mod foreman_config;
pub mod orchestrator;
pub mod phase;
pub mod supervisor;
pub mod task_graph;
pub mod util;
pub mod workspace;

pub use config::RunConfig;
pub use errors::{EngineError, EngineResult};
pub use orchestrator::{PhaseManager, RunOutcome, RunRequest, RunStatus};
