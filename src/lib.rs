// Core infrastructure modules
pub mod core;
pub mod model;

// Components, leaves first
pub mod graph;       // Dependency graph validation
pub mod contract;    // Contracts, stubs and dependency bindings
pub mod agent;       // External build/test collaborators
pub mod scheduler;   // Phase planning and concurrent builds
pub mod testing;     // Concurrent test aggregation
pub mod progress;    // State machines, snapshots, persistence
pub mod integration; // Final stub substitution and system test
pub mod orchestrator;

// Re-exports for convenience
pub use crate::core::errors::{OrchestratorError, Result};
pub use crate::core::config::{EscalationDecision, OrchestratorConfig};
pub use model::{BuildPlan, UnitDeclaration, UnitStatus, PhaseStatus};
pub use orchestrator::{Orchestrator, Run, RunOutcome, RunReport, RunState};
