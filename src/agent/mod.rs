//! Boundary with the external build and test collaborators.
//!
//! The orchestrator never looks inside a unit: it hands a `BuildAgent` the
//! unit and its resolved dependency handles, and asks a `TestAgent` for a
//! pass/fail report.

pub mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::contract::{Contract, DependencyHandle, Provider};
use crate::model::Unit;

pub use command::CommandAgent;

/// Failure reported by a collaborator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    /// The unit's own build or test step errored
    #[error("User error: {0}")]
    User(String),
    /// The collaborator itself could not run
    #[error("System error: {0}")]
    System(String),
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::System(err.to_string())
    }
}

/// Everything a build task receives
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub run_id: String,
    pub unit: Arc<Unit>,
    /// 1-based attempt number
    pub attempt: u32,
    /// One handle per declared dependency, real or stub
    pub dependencies: Vec<DependencyHandle>,
    pub cancel: CancellationToken,
}

impl BuildContext {
    pub fn dependency(&self, provider: &str) -> Option<&DependencyHandle> {
        self.dependencies.iter().find(|h| h.provider() == provider)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Product of a successful build
#[derive(Clone, Default)]
pub struct BuildArtifact {
    pub artifact_ref: String,
    /// Contract the built unit actually exposes, checked against the frozen one
    pub contract: Option<Contract>,
    /// Callable implementation, substituted for stubs at integration
    pub implementation: Option<Arc<dyn Provider>>,
}

impl BuildArtifact {
    pub fn new(artifact_ref: impl Into<String>) -> Self {
        Self {
            artifact_ref: artifact_ref.into(),
            contract: None,
            implementation: None,
        }
    }

    pub fn with_contract(mut self, contract: Contract) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn with_implementation(mut self, provider: Arc<dyn Provider>) -> Self {
        self.implementation = Some(provider);
        self
    }
}

impl fmt::Debug for BuildArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildArtifact")
            .field("artifact_ref", &self.artifact_ref)
            .field("contract", &self.contract.as_ref().map(|c| c.checksum()))
            .field("callable", &self.implementation.is_some())
            .finish()
    }
}

/// Where a test run sits in the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "phase", rename_all = "snake_case")]
pub enum TestScope {
    Phase(usize),
    /// Final whole-system run after stub substitution
    Integration,
}

impl fmt::Display for TestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestScope::Phase(n) => write!(f, "phase-{}", n),
            TestScope::Integration => f.write_str("integration"),
        }
    }
}

/// Everything a test task receives
#[derive(Debug, Clone)]
pub struct TestContext {
    pub run_id: String,
    pub unit: Arc<Unit>,
    pub attempt: u32,
    pub scope: TestScope,
    pub artifact_ref: Option<String>,
    pub dependencies: Vec<DependencyHandle>,
    pub cancel: CancellationToken,
}

impl TestContext {
    pub fn dependency(&self, provider: &str) -> Option<&DependencyHandle> {
        self.dependencies.iter().find(|h| h.provider() == provider)
    }
}

/// Result of one unit's test suite
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: u32,
    pub failed: u32,
    #[serde(default)]
    pub failing_ids: Vec<String>,
    #[serde(default)]
    pub duration: Duration,
}

impl TestReport {
    pub fn passing(passed: u32) -> Self {
        Self {
            passed,
            ..Default::default()
        }
    }

    pub fn failing<I, S>(failing_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let failing_ids: Vec<String> = failing_ids.into_iter().map(Into::into).collect();
        Self {
            failed: failing_ids.len().max(1) as u32,
            failing_ids,
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Zero failing tests
    pub fn is_passed(&self) -> bool {
        self.failed == 0 && self.failing_ids.is_empty()
    }
}

/// Builds one unit
#[async_trait]
pub trait BuildAgent: Send + Sync {
    async fn build(&self, ctx: &BuildContext) -> Result<BuildArtifact, AgentError>;
}

/// Runs one unit's test suite
#[async_trait]
pub trait TestAgent: Send + Sync {
    async fn test(&self, ctx: &TestContext) -> Result<TestReport, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_classification() {
        assert!(TestReport::passing(12).is_passed());
        let failing = TestReport::failing(["checkout::totals"]);
        assert!(!failing.is_passed());
        assert_eq!(failing.failed, 1);
        // a failure count without ids still fails
        assert!(!TestReport {
            failed: 2,
            ..Default::default()
        }
        .is_passed());
    }

    #[test]
    fn test_agent_error_conversion() {
        assert_eq!(
            AgentError::Timeout(Duration::from_secs(1)).to_string(),
            "Timeout after 1s"
        );
        let err: AgentError = anyhow::anyhow!("spawn failed").into();
        assert_eq!(err, AgentError::System("spawn failed".into()));
    }
}
