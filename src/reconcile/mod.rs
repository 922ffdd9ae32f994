pub mod context;
pub mod orchestrator;
pub mod resolve;

pub use context::RunContext;
pub use orchestrator::{OrchestratorConfig, ReconciliationOrchestrator};
pub use resolve::ImportResolver;
