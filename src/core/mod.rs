// Core infrastructure shared by every component

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::{
    EscalationDecision, ExecutionPolicy, OrchestratorConfig, OrchestratorConfigBuilder,
    RetryStrategy,
};
pub use errors::{OrchestratorError, Result};
