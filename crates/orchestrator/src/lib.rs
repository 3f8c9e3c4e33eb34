pub mod config;
pub mod conflict;
pub mod orchestrator;

pub use config::{ConflictPolicy, OrchestratorConfig};
pub use conflict::resolve_conflicts;
pub use orchestrator::StrategyOrchestrator;
