use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentError, BuildAgent, BuildArtifact, BuildContext};
use crate::contract::ContractRegistry;
use crate::core::config::OrchestratorConfig;
use crate::core::errors::OrchestratorError;
use crate::model::{FailureKind, Unit, UnitStatus};
use crate::progress::{ProgressEvent, ProgressTracker};

#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Built(BuildArtifact),
    Failed { kind: FailureKind, error: String },
    /// Stopped by fail-fast before finishing
    Cancelled,
}

/// One unit's build attempt
#[derive(Debug, Clone)]
pub struct UnitBuildResult {
    pub unit: Arc<Unit>,
    pub attempt: u32,
    pub outcome: BuildOutcome,
    pub duration: Duration,
}

impl UnitBuildResult {
    pub fn is_built(&self) -> bool {
        matches!(self.outcome, BuildOutcome::Built(_))
    }

    pub fn artifact(&self) -> Option<&BuildArtifact> {
        match &self.outcome {
            BuildOutcome::Built(artifact) => Some(artifact),
            _ => None,
        }
    }
}

/// Record a transition; the state machine is owned by the tracker, so a
/// rejected transition is logged rather than aborting the task
pub(crate) fn note(tracker: &ProgressTracker, event: ProgressEvent) {
    if let Err(e) = tracker.record(event) {
        error!(run_id = %tracker.run_id(), error = %e, "Failed to record progress");
    }
}

/// Dispatches one concurrent build task per unit
pub struct BuildScheduler {
    run_id: String,
    agent: Arc<dyn BuildAgent>,
    registry: Arc<ContractRegistry>,
    tracker: Arc<ProgressTracker>,
    config: Arc<OrchestratorConfig>,
}

impl BuildScheduler {
    pub fn new(
        agent: Arc<dyn BuildAgent>,
        registry: Arc<ContractRegistry>,
        tracker: Arc<ProgressTracker>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            run_id: registry.run_id().to_string(),
            agent,
            registry,
            tracker,
            config,
        }
    }

    /// Build `units` concurrently as attempt number `attempt`.
    ///
    /// A failed build never aborts its siblings; with `fail_fast` it cancels
    /// `cancel`, and siblings still in flight end `Cancelled`. Results come
    /// back in input order once every task has settled.
    pub async fn execute(
        &self,
        units: &[Arc<Unit>],
        attempt: u32,
        cancel: &CancellationToken,
        fail_fast: bool,
    ) -> Vec<UnitBuildResult> {
        let semaphore = self
            .config
            .concurrency_for(units.len())
            .map(|permits| Arc::new(Semaphore::new(permits)));
        info!(
            run_id = %self.run_id,
            units = units.len(),
            attempt,
            cap = ?semaphore.as_ref().map(|s| s.available_permits()),
            "Dispatching builds"
        );

        let handles: Vec<_> = units
            .iter()
            .map(|unit| {
                let task = BuildTask {
                    run_id: self.run_id.clone(),
                    agent: self.agent.clone(),
                    registry: self.registry.clone(),
                    tracker: self.tracker.clone(),
                    unit: unit.clone(),
                    attempt,
                    limit: unit.timeout.unwrap_or_else(|| self.config.unit_timeout()),
                    cancel: cancel.clone(),
                    fail_fast,
                    semaphore: semaphore.clone(),
                };
                tokio::spawn(task.run())
            })
            .collect();

        let joined = futures::future::join_all(handles).await;
        joined
            .into_iter()
            .zip(units)
            .map(|(joined, unit)| match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(unit = %unit.id, error = %e, "Build task panicked");
                    note(
                        &self.tracker,
                        ProgressEvent::unit_failure(
                            unit.id.clone(),
                            UnitStatus::BuildFailed,
                            attempt,
                            FailureKind::Build,
                            e.to_string(),
                        ),
                    );
                    if fail_fast {
                        cancel.cancel();
                    }
                    UnitBuildResult {
                        unit: unit.clone(),
                        attempt,
                        outcome: BuildOutcome::Failed {
                            kind: FailureKind::Build,
                            error: format!("build task panicked: {}", e),
                        },
                        duration: Duration::ZERO,
                    }
                }
            })
            .collect()
    }
}

struct BuildTask {
    run_id: String,
    agent: Arc<dyn BuildAgent>,
    registry: Arc<ContractRegistry>,
    tracker: Arc<ProgressTracker>,
    unit: Arc<Unit>,
    attempt: u32,
    limit: Duration,
    cancel: CancellationToken,
    fail_fast: bool,
    semaphore: Option<Arc<Semaphore>>,
}

impl BuildTask {
    async fn run(self) -> UnitBuildResult {
        let started = Instant::now();

        let _permit = match &self.semaphore {
            Some(semaphore) => tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(started),
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(e) => return self.failed(started, FailureKind::Build, e.to_string()),
                },
            },
            None => None,
        };
        if self.cancel.is_cancelled() {
            return self.cancelled(started);
        }

        note(
            &self.tracker,
            ProgressEvent::unit(self.unit.id.clone(), UnitStatus::Building, self.attempt),
        );

        let mut dependencies = Vec::with_capacity(self.unit.dependencies.len());
        for dep in &self.unit.dependencies {
            match self.registry.bind(&self.unit.id, &dep.id) {
                Ok(handle) => dependencies.push(handle),
                Err(e) => {
                    return self.failed(
                        started,
                        FailureKind::Build,
                        format!("cannot resolve dependency {}: {}", dep.id, e),
                    )
                }
            }
        }

        let ctx = BuildContext {
            run_id: self.run_id.clone(),
            unit: self.unit.clone(),
            attempt: self.attempt,
            dependencies,
            cancel: self.cancel.clone(),
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            res = tokio::time::timeout(self.limit, self.agent.build(&ctx)) => {
                res.unwrap_or(Err(AgentError::Timeout(self.limit)))
            }
        };

        match result {
            Ok(artifact) => match self.check_contract(&artifact) {
                Ok(()) => {
                    debug!(
                        unit = %self.unit.id,
                        attempt = self.attempt,
                        artifact = %artifact.artifact_ref,
                        "Build succeeded"
                    );
                    UnitBuildResult {
                        unit: self.unit.clone(),
                        attempt: self.attempt,
                        outcome: BuildOutcome::Built(artifact),
                        duration: started.elapsed(),
                    }
                }
                Err(e) => {
                    let kind = match e {
                        OrchestratorError::ContractDrift { .. } => FailureKind::ContractDrift,
                        _ => FailureKind::Build,
                    };
                    self.failed(started, kind, e.to_string())
                }
            },
            Err(AgentError::Cancelled) => self.cancelled(started),
            Err(AgentError::Timeout(limit)) => self.failed(
                started,
                FailureKind::Timeout,
                format!("build timed out after {:?}", limit),
            ),
            Err(e) => self.failed(started, FailureKind::Build, e.to_string()),
        }
    }

    /// The contract a build reports must match the registered one once frozen
    fn check_contract(&self, artifact: &BuildArtifact) -> Result<(), OrchestratorError> {
        let Some(contract) = &artifact.contract else {
            return Ok(());
        };
        if contract.unit != self.unit.id {
            return Err(OrchestratorError::agent(
                self.unit.id.clone(),
                format!("build reported a contract for '{}'", contract.unit),
            ));
        }
        self.registry.register(contract.clone()).map(|_| ())
    }

    fn failed(&self, started: Instant, kind: FailureKind, error: String) -> UnitBuildResult {
        warn!(unit = %self.unit.id, attempt = self.attempt, %kind, error = %error, "Build failed");
        note(
            &self.tracker,
            ProgressEvent::unit_failure(
                self.unit.id.clone(),
                UnitStatus::BuildFailed,
                self.attempt,
                kind,
                error.clone(),
            ),
        );
        if self.fail_fast {
            self.cancel.cancel();
        }
        UnitBuildResult {
            unit: self.unit.clone(),
            attempt: self.attempt,
            outcome: BuildOutcome::Failed { kind, error },
            duration: started.elapsed(),
        }
    }

    fn cancelled(&self, started: Instant) -> UnitBuildResult {
        debug!(unit = %self.unit.id, "Build cancelled");
        note(
            &self.tracker,
            ProgressEvent::unit(self.unit.id.clone(), UnitStatus::Cancelled, self.attempt),
        );
        UnitBuildResult {
            unit: self.unit.clone(),
            attempt: self.attempt,
            outcome: BuildOutcome::Cancelled,
            duration: started.elapsed(),
        }
    }
}
