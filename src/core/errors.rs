use thiserror::Error;

use crate::graph::Violation;

/// Unified error type for the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed build plan, rejected before graph construction
    #[error("Invalid build plan: {message}")]
    InvalidPlan {
        message: String,
        unit: Option<String>,
    },

    /// Critical violations found by the dependency graph validator
    #[error("Validation found {} critical violation(s)", critical_count(.violations))]
    CriticalViolations { violations: Vec<Violation> },

    /// A frozen contract was re-registered with different content
    #[error("Contract drift for unit {unit}: frozen checksum {expected}, got {actual}")]
    ContractDrift {
        unit: String,
        expected: String,
        actual: String,
    },

    /// A drifted contract left no later phase able to run
    #[error("Run {run_id} aborted: {reason}")]
    RunAborted {
        run_id: String,
        unit: String,
        reason: String,
    },

    /// Lookup of a unit the run does not know about
    #[error("Unknown unit: {unit}")]
    UnknownUnit { unit: String },

    /// A progress transition outside the state machine
    #[error("Invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    /// Operation not allowed in the run's current state
    #[error("Run {run_id} cannot {operation} while {state}")]
    InvalidRunState {
        run_id: String,
        operation: String,
        state: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// External build/test agent errors
    #[error("Agent error for unit {unit}: {message}")]
    Agent { unit: String, message: String },

    /// Snapshot store errors
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl OrchestratorError {
    /// Create an invalid plan error
    pub fn invalid_plan<S: Into<String>>(message: S) -> Self {
        Self::InvalidPlan {
            message: message.into(),
            unit: None,
        }
    }

    /// Create an invalid plan error attributed to a unit
    pub fn invalid_unit<U: Into<String>, S: Into<String>>(unit: U, message: S) -> Self {
        Self::InvalidPlan {
            message: message.into(),
            unit: Some(unit.into()),
        }
    }

    pub fn unknown_unit<S: Into<String>>(unit: S) -> Self {
        Self::UnknownUnit { unit: unit.into() }
    }

    pub fn invalid_transition<S: Into<String>, F: ToString, T: ToString>(
        subject: S,
        from: F,
        to: T,
    ) -> Self {
        Self::InvalidTransition {
            subject: subject.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn invalid_run_state<R: Into<String>, O: Into<String>, S: ToString>(
        run_id: R,
        operation: O,
        state: S,
    ) -> Self {
        Self::InvalidRunState {
            run_id: run_id.into(),
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn agent<U: Into<String>, M: Into<String>>(unit: U, message: M) -> Self {
        Self::Agent {
            unit: unit.into(),
            message: message.into(),
        }
    }

    pub fn run_aborted<R: Into<String>, U: Into<String>, S: Into<String>>(
        run_id: R,
        unit: U,
        reason: S,
    ) -> Self {
        Self::RunAborted {
            run_id: run_id.into(),
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    pub fn database<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Number of blocking violations carried by `CriticalViolations`
    pub fn critical_count(&self) -> usize {
        match self {
            Self::CriticalViolations { violations } => critical_count(violations),
            _ => 0,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidPlan { .. } => "plan",
            Self::CriticalViolations { .. } => "validation",
            Self::ContractDrift { .. } => "contract",
            Self::RunAborted { .. } => "run",
            Self::UnknownUnit { .. } => "unit",
            Self::InvalidTransition { .. } => "progress",
            Self::InvalidRunState { .. } => "run",
            Self::Configuration { .. } => "configuration",
            Self::Agent { .. } => "agent",
            Self::Database { .. } => "database",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

fn critical_count(violations: &[Violation]) -> usize {
    violations.iter().filter(|v| v.is_critical()).count()
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for OrchestratorError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = OrchestratorError::invalid_unit("a", "empty id");
        assert!(matches!(err, OrchestratorError::InvalidPlan { .. }));
        assert_eq!(err.category(), "plan");
    }

    #[test]
    fn test_critical_count_in_message() {
        use crate::graph::{Severity, ViolationKind};

        let violations = vec![
            Violation {
                severity: Severity::Critical,
                kind: ViolationKind::Cycle {
                    path: vec!["a".into(), "b".into(), "a".into()],
                },
                remediation: String::new(),
            },
            Violation {
                severity: Severity::Warning,
                kind: ViolationKind::MultipleResponsibilities {
                    unit: "c".into(),
                    groups: vec!["db".into(), "http".into(), "ui".into()],
                },
                remediation: String::new(),
            },
        ];
        let err = OrchestratorError::CriticalViolations { violations };
        assert_eq!(err.critical_count(), 1);
        assert_eq!(err.to_string(), "Validation found 1 critical violation(s)");
        assert_eq!(OrchestratorError::internal("x").critical_count(), 0);
    }

    #[test]
    fn test_run_aborted() {
        let err = OrchestratorError::run_aborted("r1", "e", "contract drift");
        assert_eq!(err.category(), "run");
        assert_eq!(err.to_string(), "Run r1 aborted: contract drift");
    }

    #[test]
    fn test_display() {
        let err = OrchestratorError::invalid_transition("unit b", "Passed", "Building");
        assert_eq!(
            err.to_string(),
            "Invalid transition for unit b: Passed -> Building"
        );
    }
}
