//! Test Coordinator
//!
//! Runs the test suites of a phase's built units concurrently and
//! aggregates them. A phase passes only when every unit reports zero
//! failing tests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentError, TestAgent, TestContext, TestReport, TestScope};
use crate::contract::{ContractRegistry, RealImplementation};
use crate::core::config::OrchestratorConfig;
use crate::model::{FailureKind, Unit, UnitId, UnitStatus};
use crate::progress::{ProgressEvent, ProgressTracker};
use crate::scheduler::executor::note;
use crate::scheduler::{BuildOutcome, UnitBuildResult};

/// How one unit fared in an aggregated run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitVerdict {
    Passed { report: TestReport },
    /// Tests ran and at least one failed
    Failed { report: TestReport },
    /// Build, timeout, drift or agent error; no usable test report
    Errored { kind: FailureKind, error: String },
    Cancelled,
}

impl UnitVerdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, UnitVerdict::Passed { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, UnitVerdict::Failed { .. } | UnitVerdict::Errored { .. })
    }

    /// Failure classification for retry bookkeeping
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            UnitVerdict::Failed { .. } => Some(FailureKind::Test),
            UnitVerdict::Errored { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitTestResult {
    pub unit: UnitId,
    /// Attempt number (1 = first try)
    pub iteration: u32,
    pub verdict: UnitVerdict,
}

/// Per-unit results of one phase (or of the integration run)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub scope: TestScope,
    pub results: BTreeMap<UnitId, UnitTestResult>,
    pub duration: Duration,
}

impl AggregatedResult {
    fn new(scope: TestScope) -> Self {
        Self {
            scope,
            results: BTreeMap::new(),
            duration: Duration::ZERO,
        }
    }

    /// Every unit reported zero failing tests
    pub fn passed(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(|r| r.verdict.is_passed())
    }

    pub fn failed_units(&self) -> Vec<UnitId> {
        self.filter(UnitVerdict::is_failure)
    }

    /// Failed units another attempt could fix
    pub fn retryable_units(&self) -> Vec<UnitId> {
        self.filter(|v| v.failure_kind().is_some_and(FailureKind::is_retryable))
    }

    pub fn units_failed_with(&self, kind: FailureKind) -> Vec<UnitId> {
        self.filter(|v| v.failure_kind() == Some(kind))
    }

    pub fn passed_units(&self) -> Vec<UnitId> {
        self.filter(UnitVerdict::is_passed)
    }

    pub fn cancelled_units(&self) -> Vec<UnitId> {
        self.filter(|v| matches!(v, UnitVerdict::Cancelled))
    }

    /// Failing test identifiers per failed unit
    pub fn failing_tests(&self) -> BTreeMap<UnitId, Vec<String>> {
        self.results
            .values()
            .filter_map(|r| match &r.verdict {
                UnitVerdict::Failed { report } => Some((r.unit.clone(), report.failing_ids.clone())),
                UnitVerdict::Errored { error, .. } => Some((r.unit.clone(), vec![error.clone()])),
                _ => None,
            })
            .collect()
    }

    pub fn get(&self, unit: &str) -> Option<&UnitTestResult> {
        self.results.get(unit)
    }

    fn filter(&self, pred: impl Fn(&UnitVerdict) -> bool) -> Vec<UnitId> {
        self.results
            .values()
            .filter(|r| pred(&r.verdict))
            .map(|r| r.unit.clone())
            .collect()
    }

    fn insert(&mut self, result: UnitTestResult) {
        self.results.insert(result.unit.clone(), result);
    }
}

/// A unit handed to the test runner, with what its build produced
struct Candidate {
    unit: Arc<Unit>,
    iteration: u32,
    artifact_ref: Option<String>,
    implementation: Option<Arc<dyn crate::contract::Provider>>,
}

/// Runs and aggregates test suites
pub struct TestCoordinator {
    run_id: String,
    agent: Arc<dyn TestAgent>,
    registry: Arc<ContractRegistry>,
    tracker: Arc<ProgressTracker>,
    config: Arc<OrchestratorConfig>,
}

impl TestCoordinator {
    pub fn new(
        agent: Arc<dyn TestAgent>,
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

    /// Test every successfully built unit of `phase` concurrently.
    ///
    /// Units whose build failed or was cancelled are carried into the
    /// aggregate without running tests. A unit that passes is promoted in
    /// the contract registry.
    pub async fn run_phase_tests(
        &self,
        phase: usize,
        builds: Vec<UnitBuildResult>,
        cancel: &CancellationToken,
        fail_fast: bool,
    ) -> AggregatedResult {
        let mut aggregate = AggregatedResult::new(TestScope::Phase(phase));
        let started = Instant::now();

        let mut candidates = Vec::new();
        for build in builds {
            match build.outcome {
                BuildOutcome::Built(artifact) => candidates.push(Candidate {
                    unit: build.unit,
                    iteration: build.attempt,
                    artifact_ref: Some(artifact.artifact_ref),
                    implementation: artifact.implementation,
                }),
                BuildOutcome::Failed { kind, error } => aggregate.insert(UnitTestResult {
                    unit: build.unit.id.clone(),
                    iteration: build.attempt,
                    verdict: UnitVerdict::Errored { kind, error },
                }),
                BuildOutcome::Cancelled => aggregate.insert(UnitTestResult {
                    unit: build.unit.id.clone(),
                    iteration: build.attempt,
                    verdict: UnitVerdict::Cancelled,
                }),
            }
        }

        for result in self
            .run_tests(TestScope::Phase(phase), candidates, cancel, fail_fast, true)
            .await
        {
            aggregate.insert(result);
        }
        aggregate.duration = started.elapsed();

        info!(
            run_id = %self.run_id,
            phase,
            passed = aggregate.passed_units().len(),
            failed = aggregate.failed_units().len(),
            cancelled = aggregate.cancelled_units().len(),
            "Phase tests aggregated"
        );
        aggregate
    }

    /// Re-test only the units of `previous` that failed and were rebuilt,
    /// returning `previous` with their entries replaced
    pub async fn rerun(
        &self,
        previous: &AggregatedResult,
        rebuilt: Vec<UnitBuildResult>,
    ) -> AggregatedResult {
        let TestScope::Phase(phase) = previous.scope else {
            warn!("Rerun requested for an integration result; nothing to do");
            return previous.clone();
        };
        let failed = previous.failed_units();
        let (retry, ignored): (Vec<_>, Vec<_>) = rebuilt
            .into_iter()
            .partition(|b| failed.contains(&b.unit.id));
        for build in ignored {
            warn!(unit = %build.unit.id, "Skipping rerun of a unit that did not fail");
        }

        let fresh = self
            .run_phase_tests(phase, retry, &CancellationToken::new(), false)
            .await;
        let mut merged = previous.clone();
        for (_, result) in fresh.results {
            merged.insert(result);
        }
        merged.duration += fresh.duration;
        merged
    }

    /// Whole-system test of `units` after stub substitution.
    ///
    /// Unit statuses are left untouched: a failure here belongs to
    /// integration, not to the unit.
    pub async fn run_integration_tests(
        &self,
        units: Vec<(Arc<Unit>, Option<String>)>,
    ) -> AggregatedResult {
        let started = Instant::now();
        let candidates = units
            .into_iter()
            .map(|(unit, artifact_ref)| Candidate {
                unit,
                iteration: 1,
                artifact_ref,
                implementation: None,
            })
            .collect();

        let mut aggregate = AggregatedResult::new(TestScope::Integration);
        for result in self
            .run_tests(
                TestScope::Integration,
                candidates,
                &CancellationToken::new(),
                false,
                false,
            )
            .await
        {
            aggregate.insert(result);
        }
        aggregate.duration = started.elapsed();
        aggregate
    }

    async fn run_tests(
        &self,
        scope: TestScope,
        candidates: Vec<Candidate>,
        cancel: &CancellationToken,
        fail_fast: bool,
        track: bool,
    ) -> Vec<UnitTestResult> {
        let semaphore = self
            .config
            .concurrency_for(candidates.len())
            .map(|permits| Arc::new(Semaphore::new(permits)));

        let mut ids = Vec::with_capacity(candidates.len());
        let handles: Vec<_> = candidates
            .into_iter()
            .map(|candidate| {
                ids.push((candidate.unit.id.clone(), candidate.iteration));
                let task = TestTask {
                    run_id: self.run_id.clone(),
                    agent: self.agent.clone(),
                    registry: self.registry.clone(),
                    tracker: track.then(|| self.tracker.clone()),
                    limit: candidate
                        .unit
                        .timeout
                        .unwrap_or_else(|| self.config.unit_timeout()),
                    candidate,
                    scope,
                    cancel: cancel.clone(),
                    fail_fast,
                    semaphore: semaphore.clone(),
                };
                tokio::spawn(task.run())
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .zip(ids)
            .map(|(joined, (unit, iteration))| match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(unit = %unit, error = %e, "Test task panicked");
                    if track {
                        note(
                            &self.tracker,
                            ProgressEvent::unit_failure(
                                unit.clone(),
                                UnitStatus::Failed,
                                iteration,
                                FailureKind::Test,
                                e.to_string(),
                            ),
                        );
                    }
                    if fail_fast {
                        cancel.cancel();
                    }
                    UnitTestResult {
                        unit,
                        iteration,
                        verdict: UnitVerdict::Errored {
                            kind: FailureKind::Test,
                            error: format!("test task panicked: {}", e),
                        },
                    }
                }
            })
            .collect()
    }
}

struct TestTask {
    run_id: String,
    agent: Arc<dyn TestAgent>,
    registry: Arc<ContractRegistry>,
    /// None for integration runs, which never change unit statuses
    tracker: Option<Arc<ProgressTracker>>,
    candidate: Candidate,
    scope: TestScope,
    limit: Duration,
    cancel: CancellationToken,
    fail_fast: bool,
    semaphore: Option<Arc<Semaphore>>,
}

impl TestTask {
    fn unit_id(&self) -> &str {
        &self.candidate.unit.id
    }

    fn record(&self, event: ProgressEvent) {
        if let Some(tracker) = &self.tracker {
            note(tracker, event);
        }
    }

    async fn run(self) -> UnitTestResult {
        let _permit = match &self.semaphore {
            Some(semaphore) => tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(),
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(e) => return self.errored(FailureKind::Test, e.to_string()),
                },
            },
            None => None,
        };
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        self.record(ProgressEvent::unit(
            self.unit_id(),
            UnitStatus::Testing,
            self.candidate.iteration,
        ));

        let mut dependencies = Vec::with_capacity(self.candidate.unit.dependencies.len());
        for dep in &self.candidate.unit.dependencies {
            match self.registry.bind(self.unit_id(), &dep.id) {
                Ok(handle) => dependencies.push(handle),
                Err(e) => {
                    return self.errored(
                        FailureKind::Test,
                        format!("cannot resolve dependency {}: {}", dep.id, e),
                    )
                }
            }
        }

        let ctx = TestContext {
            run_id: self.run_id.clone(),
            unit: self.candidate.unit.clone(),
            attempt: self.candidate.iteration,
            scope: self.scope,
            artifact_ref: self.candidate.artifact_ref.clone(),
            dependencies,
            cancel: self.cancel.clone(),
        };

        let started = Instant::now();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            res = tokio::time::timeout(self.limit, self.agent.test(&ctx)) => {
                res.unwrap_or(Err(AgentError::Timeout(self.limit)))
            }
        };

        match result {
            Ok(mut report) => {
                if report.duration.is_zero() {
                    report.duration = started.elapsed();
                }
                if report.is_passed() {
                    self.passed(report)
                } else {
                    self.failed(report)
                }
            }
            Err(AgentError::Cancelled) => self.cancelled(),
            Err(AgentError::Timeout(limit)) => {
                self.errored(FailureKind::Timeout, format!("tests timed out after {:?}", limit))
            }
            Err(e) => self.errored(FailureKind::Test, e.to_string()),
        }
    }

    fn passed(&self, report: TestReport) -> UnitTestResult {
        debug!(unit = %self.unit_id(), scope = %self.scope, passed = report.passed, "Tests passed");
        if self.tracker.is_some() {
            self.registry.promote(RealImplementation {
                unit: self.unit_id().to_string(),
                artifact_ref: self
                    .candidate
                    .artifact_ref
                    .clone()
                    .unwrap_or_else(|| self.unit_id().to_string()),
                provider: self.candidate.implementation.clone(),
            });
        }
        self.record(ProgressEvent::unit(
            self.unit_id(),
            UnitStatus::Passed,
            self.candidate.iteration,
        ));
        self.result(UnitVerdict::Passed { report })
    }

    fn failed(&self, report: TestReport) -> UnitTestResult {
        warn!(
            unit = %self.unit_id(),
            scope = %self.scope,
            failed = report.failed,
            failing = ?report.failing_ids,
            "Tests failed"
        );
        self.record(ProgressEvent::unit_failure(
            self.unit_id(),
            UnitStatus::Failed,
            self.candidate.iteration,
            FailureKind::Test,
            report.failing_ids.join(", "),
        ));
        if self.fail_fast {
            self.cancel.cancel();
        }
        self.result(UnitVerdict::Failed { report })
    }

    fn errored(&self, kind: FailureKind, error: String) -> UnitTestResult {
        warn!(unit = %self.unit_id(), scope = %self.scope, %kind, error = %error, "Test run errored");
        self.record(ProgressEvent::unit_failure(
            self.unit_id(),
            UnitStatus::Failed,
            self.candidate.iteration,
            kind,
            error.clone(),
        ));
        if self.fail_fast {
            self.cancel.cancel();
        }
        self.result(UnitVerdict::Errored { kind, error })
    }

    fn cancelled(&self) -> UnitTestResult {
        debug!(unit = %self.unit_id(), "Tests cancelled");
        self.record(ProgressEvent::unit(
            self.unit_id(),
            UnitStatus::Cancelled,
            self.candidate.iteration,
        ));
        self.result(UnitVerdict::Cancelled)
    }

    fn result(&self, verdict: UnitVerdict) -> UnitTestResult {
        UnitTestResult {
            unit: self.unit_id().to_string(),
            iteration: self.candidate.iteration,
            verdict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(unit: &str, verdict: UnitVerdict) -> UnitTestResult {
        UnitTestResult {
            unit: unit.into(),
            iteration: 1,
            verdict,
        }
    }

    #[test]
    fn test_aggregation_rule() {
        let mut aggregate = AggregatedResult::new(TestScope::Phase(1));
        assert!(!aggregate.passed());

        aggregate.insert(result("a", UnitVerdict::Passed { report: TestReport::passing(3) }));
        assert!(aggregate.passed());

        aggregate.insert(result(
            "b",
            UnitVerdict::Failed {
                report: TestReport::failing(["b::parse"]),
            },
        ));
        aggregate.insert(result(
            "c",
            UnitVerdict::Errored {
                kind: FailureKind::Build,
                error: "linker".into(),
            },
        ));
        aggregate.insert(result("d", UnitVerdict::Cancelled));

        aggregate.insert(result(
            "e",
            UnitVerdict::Errored {
                kind: FailureKind::ContractDrift,
                error: "checksum changed".into(),
            },
        ));

        assert!(!aggregate.passed());
        assert_eq!(
            aggregate.failed_units(),
            vec!["b".to_string(), "c".to_string(), "e".to_string()]
        );
        assert_eq!(aggregate.retryable_units(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(
            aggregate.units_failed_with(FailureKind::ContractDrift),
            vec!["e".to_string()]
        );
        assert_eq!(aggregate.cancelled_units(), vec!["d".to_string()]);
        assert_eq!(aggregate.failing_tests()["b"], vec!["b::parse".to_string()]);
        assert_eq!(
            aggregate.get("c").unwrap().verdict.failure_kind(),
            Some(FailureKind::Build)
        );
    }
}
