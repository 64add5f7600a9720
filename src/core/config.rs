use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{OrchestratorError, Result};

/// How many build/test tasks of one phase may run at once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// One task per unit, no cap
    FullParallel,
    /// Capped at the configured concurrency
    Bounded,
    /// Full-parallel for phases up to the threshold, bounded above it
    Auto { small_phase_threshold: usize },
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self::Auto {
            small_phase_threshold: 8,
        }
    }
}

/// Delay inserted before each retry round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// No delay between retries
    Immediate,
    /// Fixed delay
    Linear { delay_ms: u64 },
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Immediate
    }
}

impl RetryStrategy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::Linear { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let exp = retry.saturating_sub(1) as i32;
                let raw = (*initial_ms as f64) * multiplier.powi(exp);
                Duration::from_millis(raw.min(*max_ms as f64) as u64)
            }
        }
    }
}

/// Decision applied when a phase leaves units escalated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationDecision {
    /// Keep going; dependents of escalated units become blocked
    Continue,
    /// Stop scheduling and integrate what passed
    Stop,
}

impl Default for EscalationDecision {
    fn default() -> Self {
        Self::Stop
    }
}

/// Orchestrator run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    // Retry configuration
    /// Re-attempts allowed after a unit's first failed attempt
    pub max_retries: u32,
    /// Delay between retry rounds
    pub retry_strategy: RetryStrategy,

    // Execution configuration
    /// Execution slots for bounded mode (None = CPU count)
    pub concurrency_cap: Option<usize>,
    /// Parallelism policy for build and test tasks
    pub execution_policy: ExecutionPolicy,
    /// Cancel in-flight siblings when a unit fails
    pub fail_fast: bool,
    /// Default per-unit build/test timeout in seconds
    pub unit_timeout_secs: u64,

    // Validation thresholds
    /// Cross-references between unrelated units above which coupling is flagged
    pub coupling_threshold: u32,
    /// Capability groups per unit above which sprawl is flagged
    pub max_capability_groups: usize,

    /// Decision used by the one-shot run entry point
    pub escalation: EscalationDecision,

    /// Sled database for progress snapshots
    pub snapshot_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_strategy: RetryStrategy::default(),
            concurrency_cap: None,
            execution_policy: ExecutionPolicy::default(),
            fail_fast: false,
            unit_timeout_secs: 300, // 5 minutes
            coupling_threshold: 5,
            max_capability_groups: 1,
            escalation: EscalationDecision::default(),
            snapshot_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Create a new builder for OrchestratorConfig
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::new()
    }

    /// Parse a YAML document; absent fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::io(format!("read config {}", path.display()), e)
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(cap) = self.concurrency_cap {
            if cap == 0 {
                return Err(OrchestratorError::configuration_field(
                    "concurrency_cap must be greater than 0",
                    "concurrency_cap",
                ));
            }
        }

        if self.unit_timeout_secs == 0 {
            return Err(OrchestratorError::configuration_field(
                "unit_timeout_secs must be greater than 0",
                "unit_timeout_secs",
            ));
        }
        if self.unit_timeout_secs > 86400 {
            // 24 hours
            return Err(OrchestratorError::configuration_field(
                "unit_timeout_secs cannot exceed 24 hours",
                "unit_timeout_secs",
            ));
        }

        if let ExecutionPolicy::Auto {
            small_phase_threshold,
        } = self.execution_policy
        {
            if small_phase_threshold == 0 {
                return Err(OrchestratorError::configuration_field(
                    "small_phase_threshold must be greater than 0",
                    "execution_policy",
                ));
            }
        }

        if let RetryStrategy::Exponential {
            initial_ms,
            max_ms,
            multiplier,
        } = self.retry_strategy
        {
            if multiplier < 1.0 {
                return Err(OrchestratorError::configuration_field(
                    "retry multiplier must be >= 1.0",
                    "retry_strategy",
                ));
            }
            if initial_ms > max_ms {
                return Err(OrchestratorError::configuration_field(
                    "initial retry delay cannot exceed max delay",
                    "retry_strategy",
                ));
            }
        }

        if self.coupling_threshold == 0 {
            return Err(OrchestratorError::configuration_field(
                "coupling_threshold must be greater than 0",
                "coupling_threshold",
            ));
        }
        if self.max_capability_groups == 0 {
            return Err(OrchestratorError::configuration_field(
                "max_capability_groups must be greater than 0",
                "max_capability_groups",
            ));
        }

        Ok(())
    }

    /// Execution slots available for bounded mode
    pub fn execution_slots(&self) -> usize {
        self.concurrency_cap.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Concurrency limit for a phase of `phase_size` tasks; None means unbounded
    pub fn concurrency_for(&self, phase_size: usize) -> Option<usize> {
        match self.execution_policy {
            ExecutionPolicy::FullParallel => None,
            ExecutionPolicy::Bounded => Some(self.execution_slots()),
            ExecutionPolicy::Auto {
                small_phase_threshold,
            } => {
                if phase_size <= small_phase_threshold {
                    None
                } else {
                    Some(self.execution_slots())
                }
            }
        }
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    /// Create a configuration suited to local development
    pub fn development() -> Self {
        Self {
            max_retries: 1,
            concurrency_cap: Some(4),
            unit_timeout_secs: 60,
            fail_fast: true,
            ..Default::default()
        }
    }

    /// Create a configuration suited to CI/production runs
    pub fn production() -> Self {
        Self {
            concurrency_cap: Some(num_cpus::get() * 2),
            execution_policy: ExecutionPolicy::Bounded,
            retry_strategy: RetryStrategy::Exponential {
                initial_ms: 1_000,
                max_ms: 60_000,
                multiplier: 2.0,
            },
            unit_timeout_secs: 1800,
            ..Default::default()
        }
    }
}

/// Builder for OrchestratorConfig
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl Default for OrchestratorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.retry_strategy = strategy;
        self
    }

    pub fn concurrency_cap(mut self, cap: usize) -> Self {
        self.config.concurrency_cap = Some(cap);
        self
    }

    pub fn execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.config.execution_policy = policy;
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.config.fail_fast = enabled;
        self
    }

    /// Rounded up to whole seconds, so no non-zero timeout becomes 0
    pub fn unit_timeout(mut self, timeout: Duration) -> Self {
        self.config.unit_timeout_secs =
            timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self
    }

    /// Set validator thresholds
    pub fn thresholds(mut self, coupling: u32, capability_groups: usize) -> Self {
        self.config.coupling_threshold = coupling;
        self.config.max_capability_groups = capability_groups;
        self
    }

    pub fn escalation(mut self, decision: EscalationDecision) -> Self {
        self.config.escalation = decision;
        self
    }

    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot_path = Some(path.into());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<OrchestratorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.coupling_threshold, 5);
        assert_eq!(config.max_capability_groups, 1);
    }

    #[test]
    fn test_presets() {
        assert!(OrchestratorConfig::development().validate().is_ok());
        let prod = OrchestratorConfig::production();
        assert!(prod.validate().is_ok());
        assert_eq!(prod.execution_policy, ExecutionPolicy::Bounded);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = OrchestratorConfig::default();

        config.concurrency_cap = Some(0);
        assert!(config.validate().is_err());
        config.concurrency_cap = Some(2);

        config.unit_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.unit_timeout_secs = 100_000;
        assert!(config.validate().is_err());
        config.unit_timeout_secs = 10;

        config.retry_strategy = RetryStrategy::Exponential {
            initial_ms: 10,
            max_ms: 100,
            multiplier: 0.5,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_concurrency_policy() {
        let config = OrchestratorConfig::builder()
            .concurrency_cap(3)
            .execution_policy(ExecutionPolicy::Auto {
                small_phase_threshold: 4,
            })
            .build()
            .unwrap();

        assert_eq!(config.concurrency_for(4), None);
        assert_eq!(config.concurrency_for(5), Some(3));

        let bounded = OrchestratorConfig {
            execution_policy: ExecutionPolicy::Bounded,
            concurrency_cap: Some(2),
            ..Default::default()
        };
        assert_eq!(bounded.concurrency_for(1), Some(2));
    }

    #[test]
    fn test_unit_timeout_rounds_up() {
        let config = OrchestratorConfig::builder()
            .unit_timeout(Duration::from_millis(1900))
            .build()
            .unwrap();
        assert_eq!(config.unit_timeout(), Duration::from_secs(2));

        let config = OrchestratorConfig::builder()
            .unit_timeout(Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(config.unit_timeout_secs, 1);

        let config = OrchestratorConfig::builder()
            .unit_timeout(Duration::from_secs(45))
            .build()
            .unwrap();
        assert_eq!(config.unit_timeout_secs, 45);
    }

    #[test]
    fn test_retry_delays() {
        let strategy = RetryStrategy::Exponential {
            initial_ms: 100,
            max_ms: 350,
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay_for(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_for(2), Duration::from_millis(200));
        assert_eq!(strategy.delay_for(3), Duration::from_millis(350));
        assert_eq!(RetryStrategy::Immediate.delay_for(5), Duration::ZERO);
    }

    #[test]
    fn test_yaml_partial_override() {
        let config = OrchestratorConfig::from_yaml_str(
            "max_retries: 5\nfail_fast: true\nexecution_policy:\n  mode: bounded\n",
        )
        .unwrap();
        assert_eq!(config.max_retries, 5);
        assert!(config.fail_fast);
        assert_eq!(config.execution_policy, ExecutionPolicy::Bounded);
        assert_eq!(config.unit_timeout_secs, 300);
    }
}
