//! Run driver: validate → plan → phases → escalation pause/resume →
//! integration → report.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{BuildAgent, TestAgent};
use crate::contract::ContractRegistry;
use crate::core::config::{EscalationDecision, OrchestratorConfig};
use crate::core::errors::{OrchestratorError, Result};
use crate::graph::{validate, DependencyGraph, Violation};
use crate::integration::{IntegrationCoordinator, IntegrationReport};
use crate::model::{BuildPlan, FailureKind, PhaseStatus, Unit, UnitId, UnitStatus};
use crate::progress::{
    EventSink, ProgressEvent, ProgressSnapshot, ProgressTracker, SledSnapshotStore, SnapshotStore,
};
use crate::scheduler::executor::note;
use crate::scheduler::{plan, BuildScheduler, Phase, PhasePlan};
use crate::testing::{AggregatedResult, TestCoordinator};

/// Where a run stands between calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Ready,
    /// A phase left units escalated; waiting for `resume`
    Paused,
    /// Every phase executed
    PhasesComplete,
    /// Stopped early by an escalation decision
    Stopped,
    Integrated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Ready => "ready",
            RunState::Paused => "paused",
            RunState::PhasesComplete => "phases complete",
            RunState::Stopped => "stopped",
            RunState::Integrated => "integrated",
        };
        f.write_str(label)
    }
}

/// What `execute`/`resume` ended on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Units exhausted their retries in `phase`; an external decision is needed
    Paused { phase: usize, escalated: Vec<UnitId> },
    Completed,
    Stopped,
}

/// Settled state of one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub number: usize,
    pub status: PhaseStatus,
    /// Build + test rounds run (1 = no retries)
    pub rounds: u32,
    pub passed: Vec<UnitId>,
    pub escalated: Vec<UnitId>,
    pub cancelled: Vec<UnitId>,
    pub blocked: Vec<UnitId>,
    pub tests: Option<AggregatedResult>,
}

/// Final account of a run; every unit appears with its terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub plan_name: Option<String>,
    pub state: RunState,
    pub phases: Vec<Phase>,
    pub warnings: Vec<Violation>,
    pub phase_results: Vec<PhaseResult>,
    pub integration: Option<IntegrationReport>,
    pub snapshot: ProgressSnapshot,
}

impl RunReport {
    pub fn unit_status(&self, unit: &str) -> Option<UnitStatus> {
        self.snapshot.status_of(unit)
    }

    pub fn units_in(&self, status: UnitStatus) -> Vec<UnitId> {
        self.snapshot.units_in(status)
    }

    pub fn escalated_units(&self) -> Vec<UnitId> {
        self.units_in(UnitStatus::Escalated)
    }

    pub fn integration_failed(&self) -> bool {
        self.integration.as_ref().is_some_and(|i| !i.passed)
    }

    /// Any escalated unit or a failed integration run
    pub fn needs_attention(&self) -> bool {
        !self.escalated_units().is_empty() || self.integration_failed()
    }

    /// Every unit passed and integration passed
    pub fn succeeded(&self) -> bool {
        self.snapshot.count(UnitStatus::Passed) == self.snapshot.units.len()
            && self.integration.as_ref().is_some_and(|i| i.passed)
    }
}

/// Entry point: owns configuration and the external collaborators
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    builder: Arc<dyn BuildAgent>,
    tester: Arc<dyn TestAgent>,
    store: Option<Arc<dyn SnapshotStore>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Orchestrator {
    /// Validate `config` and open the snapshot store it names, if any
    pub fn new(
        config: OrchestratorConfig,
        builder: Arc<dyn BuildAgent>,
        tester: Arc<dyn TestAgent>,
    ) -> Result<Self> {
        config.validate()?;
        let store: Option<Arc<dyn SnapshotStore>> = match &config.snapshot_path {
            Some(path) => Some(Arc::new(SledSnapshotStore::open(path)?)),
            None => None,
        };
        Ok(Self {
            config: Arc::new(config),
            builder,
            tester,
            store,
            sinks: Vec::new(),
        })
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Ingest and validate a plan without preparing a run
    pub fn validate(&self, plan: BuildPlan) -> Result<(DependencyGraph, Vec<Violation>)> {
        let units = plan.into_units()?;
        Ok(validate(units, &self.config))
    }

    /// Validate, plan and set up a run. Critical violations abort here,
    /// before any build starts.
    pub fn prepare(&self, build_plan: BuildPlan) -> Result<Run> {
        let plan_name = build_plan.name.clone();
        let (graph, violations) = self.validate(build_plan)?;
        if violations.iter().any(Violation::is_critical) {
            let err = OrchestratorError::CriticalViolations { violations };
            error!(critical = err.critical_count(), "Run aborted before scheduling");
            return Err(err);
        }

        let phase_plan = plan(&graph)?;
        let run_id = cuid2::create_id();

        let registry = Arc::new(ContractRegistry::new(run_id.clone()));
        for unit in graph.units() {
            registry.register(unit.contract.clone())?;
        }

        let mut tracker = ProgressTracker::new(run_id.clone(), graph.units().map(|u| u.id.clone()));
        for sink in &self.sinks {
            tracker = tracker.with_sink(sink.clone());
        }
        tracker.initialize(&phase_plan);
        let tracker = Arc::new(tracker);

        let scheduler = BuildScheduler::new(
            self.builder.clone(),
            registry.clone(),
            tracker.clone(),
            self.config.clone(),
        );
        let tests = Arc::new(TestCoordinator::new(
            self.tester.clone(),
            registry.clone(),
            tracker.clone(),
            self.config.clone(),
        ));
        let integration =
            IntegrationCoordinator::new(registry.clone(), tests.clone(), tracker.clone());

        info!(
            run_id = %run_id,
            units = graph.len(),
            phases = phase_plan.len(),
            warnings = violations.len(),
            "Run prepared"
        );

        Ok(Run {
            id: run_id,
            plan_name,
            config: self.config.clone(),
            units: graph.units().map(|u| (u.id.clone(), Arc::new(u.clone()))).collect(),
            graph,
            plan: phase_plan,
            warnings: violations,
            registry,
            tracker,
            scheduler,
            tests,
            integration,
            store: self.store.clone(),
            next_phase: 0,
            state: RunState::Ready,
            phase_results: Vec::new(),
            integration_report: None,
        })
    }

    /// One-shot run: every escalation gets the configured decision, then
    /// integration runs over what passed
    pub async fn run(&self, plan: BuildPlan) -> Result<RunReport> {
        let mut run = self.prepare(plan)?;
        let mut outcome = run.execute().await?;
        while let RunOutcome::Paused { phase, escalated } = &outcome {
            warn!(
                phase,
                escalated = ?escalated,
                decision = ?self.config.escalation,
                "Applying configured escalation decision"
            );
            outcome = run.resume(self.config.escalation).await?;
        }
        run.integrate().await?;
        Ok(run.report())
    }
}

/// A prepared run, driven phase by phase
pub struct Run {
    id: String,
    plan_name: Option<String>,
    config: Arc<OrchestratorConfig>,
    units: BTreeMap<UnitId, Arc<Unit>>,
    graph: DependencyGraph,
    plan: PhasePlan,
    warnings: Vec<Violation>,
    registry: Arc<ContractRegistry>,
    tracker: Arc<ProgressTracker>,
    scheduler: BuildScheduler,
    tests: Arc<TestCoordinator>,
    integration: IntegrationCoordinator,
    store: Option<Arc<dyn SnapshotStore>>,
    next_phase: usize,
    state: RunState,
    phase_results: Vec<PhaseResult>,
    integration_report: Option<IntegrationReport>,
}

impl Run {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    /// Non-blocking findings of validation
    pub fn warnings(&self) -> &[Violation] {
        &self.warnings
    }

    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tracker.snapshot()
    }

    pub fn phase_results(&self) -> &[PhaseResult] {
        &self.phase_results
    }

    /// Execute phases strictly in order until all are done or one
    /// leaves units escalated. Fails with `RunAborted` when a drifted
    /// contract belongs to a unit every remaining phase depends on.
    pub async fn execute(&mut self) -> Result<RunOutcome> {
        if self.state != RunState::Ready {
            return Err(OrchestratorError::invalid_run_state(&self.id, "execute", self.state));
        }

        while let Some(phase) = self.plan.phases().get(self.next_phase).cloned() {
            let result = self.run_phase(&phase).await?;
            self.next_phase += 1;
            let escalated = result.escalated.clone();
            let abort = self.drift_abort(&result);
            self.phase_results.push(result);
            self.persist()?;

            if let Some(err) = abort {
                error!(run_id = %self.id, phase = phase.number, error = %err, "Run aborted");
                self.block_remaining();
                self.state = RunState::Stopped;
                self.persist()?;
                return Err(err);
            }

            if !escalated.is_empty() {
                warn!(
                    run_id = %self.id,
                    phase = phase.number,
                    escalated = ?escalated,
                    "Run paused for escalation"
                );
                self.state = RunState::Paused;
                return Ok(RunOutcome::Paused {
                    phase: phase.number,
                    escalated,
                });
            }
        }

        self.state = RunState::PhasesComplete;
        info!(run_id = %self.id, phases = self.plan.len(), "All phases executed");
        Ok(RunOutcome::Completed)
    }

    /// Apply an external decision to a paused run
    pub async fn resume(&mut self, decision: EscalationDecision) -> Result<RunOutcome> {
        if self.state != RunState::Paused {
            return Err(OrchestratorError::invalid_run_state(&self.id, "resume", self.state));
        }
        info!(run_id = %self.id, ?decision, "Resuming run");

        match decision {
            EscalationDecision::Continue => {
                self.state = RunState::Ready;
                self.execute().await
            }
            EscalationDecision::Stop => {
                self.block_remaining();
                self.state = RunState::Stopped;
                self.persist()?;
                Ok(RunOutcome::Stopped)
            }
        }
    }

    /// Swap stubs for real implementations and run the final aggregated
    /// test over every passed unit
    pub async fn integrate(&mut self) -> Result<IntegrationReport> {
        if !matches!(self.state, RunState::PhasesComplete | RunState::Stopped) {
            return Err(OrchestratorError::invalid_run_state(&self.id, "integrate", self.state));
        }

        let snapshot = self.tracker.snapshot();
        let passed: Vec<(Arc<Unit>, Option<String>)> = snapshot
            .units_in(UnitStatus::Passed)
            .into_iter()
            .filter_map(|id| {
                let unit = self.units.get(&id)?.clone();
                let artifact = self.registry.real(&id).map(|r| r.artifact_ref);
                Some((unit, artifact))
            })
            .collect();

        let report = self.integration.integrate(passed).await;
        if !report.passed {
            warn!(
                run_id = %self.id,
                failing = ?report.failing_units,
                "Integration failed; per-phase results stand"
            );
        }
        self.integration_report = Some(report.clone());
        self.state = RunState::Integrated;
        self.persist()?;
        Ok(report)
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.id.clone(),
            plan_name: self.plan_name.clone(),
            state: self.state,
            phases: self.plan.phases().to_vec(),
            warnings: self.warnings.clone(),
            phase_results: self.phase_results.clone(),
            integration: self.integration_report.clone(),
            snapshot: self.tracker.snapshot(),
        }
    }

    fn block_remaining(&mut self) {
        for phase in &self.plan.phases()[self.next_phase..] {
            for unit in &phase.units {
                note(&self.tracker, ProgressEvent::unit(unit.clone(), UnitStatus::Blocked, 0));
            }
            note(&self.tracker, ProgressEvent::phase(phase.number, PhaseStatus::Blocked));
        }
        self.next_phase = self.plan.len();
    }

    /// A drifted unit aborts the run when every phase still to come
    /// depends on it
    fn drift_abort(&self, result: &PhaseResult) -> Option<OrchestratorError> {
        let remaining = &self.plan.phases()[self.next_phase..];
        if remaining.is_empty() {
            return None;
        }
        let drifted = result.tests.as_ref()?.units_failed_with(FailureKind::ContractDrift);
        drifted.into_iter().find_map(|unit| {
            let dependents = self.graph.dependents(&unit);
            let every_phase = remaining
                .iter()
                .all(|phase| phase.units.iter().any(|u| dependents.contains(u)));
            every_phase.then(|| {
                OrchestratorError::run_aborted(
                    self.id.clone(),
                    unit.clone(),
                    format!(
                        "contract of {} drifted and phases {}..={} depend on it",
                        unit,
                        remaining[0].number,
                        remaining[remaining.len() - 1].number
                    ),
                )
            })
        })
    }

    fn persist(&self) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(&self.tracker.snapshot())?;
        }
        Ok(())
    }

    async fn run_phase(&self, phase: &Phase) -> Result<PhaseResult> {
        let mut blocked = Vec::new();
        let mut targets = Vec::new();
        for id in &phase.units {
            let unit = self
                .units
                .get(id)
                .ok_or_else(|| OrchestratorError::unknown_unit(id.clone()))?;
            let unmet: Vec<&str> = unit
                .hard_dependencies()
                .filter(|d| self.tracker.unit_status(&d.id) != Some(UnitStatus::Passed))
                .map(|d| d.id.as_str())
                .collect();
            if unmet.is_empty() {
                targets.push(unit.clone());
            } else {
                warn!(unit = %id, unmet = ?unmet, "Blocked by dependencies that did not pass");
                self.tracker.record(ProgressEvent::unit(id.clone(), UnitStatus::Blocked, 0))?;
                blocked.push(id.clone());
            }
        }

        if targets.is_empty() {
            self.tracker
                .record(ProgressEvent::phase(phase.number, PhaseStatus::Blocked))?;
            return Ok(PhaseResult {
                number: phase.number,
                status: PhaseStatus::Blocked,
                rounds: 0,
                passed: Vec::new(),
                escalated: Vec::new(),
                cancelled: Vec::new(),
                blocked,
                tests: None,
            });
        }

        self.tracker
            .record(ProgressEvent::phase(phase.number, PhaseStatus::Active))?;
        info!(run_id = %self.id, phase = phase.number, units = targets.len(), "Phase started");

        // fail-fast only covers the first round; retries are scoped per unit
        let cancel = CancellationToken::new();
        let fail_fast = self.config.fail_fast;
        let builds = self.scheduler.execute(&targets, 1, &cancel, fail_fast).await;
        let mut aggregate = self
            .tests
            .run_phase_tests(phase.number, builds, &cancel, fail_fast)
            .await;

        for unit in aggregate.units_failed_with(FailureKind::ContractDrift) {
            warn!(unit = %unit, "Contract drift is not retried");
        }

        let mut rounds = 1;
        for retry in 1..=self.config.max_retries {
            let failed = aggregate.retryable_units();
            if failed.is_empty() {
                break;
            }
            let delay = self.config.retry_strategy.delay_for(retry);
            info!(
                phase = phase.number,
                retry,
                units = ?failed,
                delay_ms = delay.as_millis() as u64,
                "Retrying failed units"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let retry_targets: Vec<Arc<Unit>> = failed
                .iter()
                .filter_map(|id| self.units.get(id).cloned())
                .collect();
            let rebuilt = self
                .scheduler
                .execute(&retry_targets, retry + 1, &CancellationToken::new(), false)
                .await;
            aggregate = self.tests.rerun(&aggregate, rebuilt).await;
            rounds += 1;
        }

        let escalated = aggregate.failed_units();
        for id in &escalated {
            let attempt = aggregate.get(id).map_or(rounds, |r| r.iteration);
            error!(unit = %id, attempts = attempt, "Retries exhausted, escalating");
            self.tracker
                .record(ProgressEvent::unit(id.clone(), UnitStatus::Escalated, attempt))?;
        }

        let passed = aggregate.passed_units();
        let status = if blocked.is_empty() && passed.len() == phase.units.len() {
            PhaseStatus::Complete
        } else {
            PhaseStatus::Blocked
        };
        self.tracker
            .record(ProgressEvent::phase(phase.number, status))?;
        info!(
            run_id = %self.id,
            phase = phase.number,
            %status,
            rounds,
            passed = passed.len(),
            escalated = escalated.len(),
            "Phase settled"
        );

        Ok(PhaseResult {
            number: phase.number,
            status,
            rounds,
            passed,
            escalated,
            cancelled: aggregate.cancelled_units(),
            blocked,
            tests: Some(aggregate),
        })
    }
}
