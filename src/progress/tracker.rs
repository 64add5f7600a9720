use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::events::{EventSink, ProgressEvent, ProgressEventEnvelope};
use crate::core::errors::{OrchestratorError, Result};
use crate::model::{FailureKind, PhaseStatus, UnitId, UnitStatus};
use crate::scheduler::PhasePlan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitProgress {
    pub status: UnitStatus,
    pub phase: Option<usize>,
    /// Latest attempt number that reached `Building`
    pub attempts: u32,
    pub last_failure: Option<FailureKind>,
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub number: usize,
    pub units: Vec<UnitId>,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationProgress {
    pub passed: bool,
    pub failing_units: Vec<UnitId>,
    pub finished_at: DateTime<Utc>,
}

/// Point-in-time view of a run, serializable for external renderers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    /// Number of transitions recorded so far
    pub sequence: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// First phase that has not settled
    pub current_phase: Option<usize>,
    pub phases: Vec<PhaseProgress>,
    pub units: BTreeMap<UnitId, UnitProgress>,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
    pub integration: Option<IntegrationProgress>,
}

impl ProgressSnapshot {
    pub fn status_of(&self, unit: &str) -> Option<UnitStatus> {
        self.units.get(unit).map(|u| u.status)
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.values().filter(|u| u.status == status).count()
    }

    /// Units currently in `status`, in identifier order
    pub fn units_in(&self, status: UnitStatus) -> Vec<UnitId> {
        self.units
            .iter()
            .filter(|(_, u)| u.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Owner of every unit and phase state machine in a run.
///
/// Each record locks only the key it touches, so unrelated units progress
/// independently. Snapshots read the maps without freezing writers.
pub struct ProgressTracker {
    run_id: String,
    started_at: DateTime<Utc>,
    units: DashMap<UnitId, UnitProgress>,
    phases: DashMap<usize, PhaseProgress>,
    integration: RwLock<Option<IntegrationProgress>>,
    sequence: AtomicU64,
    last_transition_ms: AtomicI64,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl ProgressTracker {
    /// Track `units`, all starting `Pending`
    pub fn new(run_id: impl Into<String>, units: impl IntoIterator<Item = UnitId>) -> Self {
        let started_at = Utc::now();
        let units = units
            .into_iter()
            .map(|id| {
                (
                    id,
                    UnitProgress {
                        status: UnitStatus::Pending,
                        phase: None,
                        attempts: 0,
                        last_failure: None,
                        detail: None,
                        updated_at: started_at,
                    },
                )
            })
            .collect();

        Self {
            run_id: run_id.into(),
            started_at,
            units,
            phases: DashMap::new(),
            integration: RwLock::new(None),
            sequence: AtomicU64::new(0),
            last_transition_ms: AtomicI64::new(started_at.timestamp_millis()),
            sinks: Vec::new(),
        }
    }

    /// Override the run start time
    pub fn with_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self.last_transition_ms = AtomicI64::new(at.timestamp_millis());
        for mut unit in self.units.iter_mut() {
            unit.updated_at = at;
        }
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Register the phases of a plan as `Waiting`
    pub fn initialize(&self, plan: &PhasePlan) {
        for phase in plan.phases() {
            for id in &phase.units {
                if let Some(mut unit) = self.units.get_mut(id) {
                    unit.phase = Some(phase.number);
                }
            }
            self.phases.insert(
                phase.number,
                PhaseProgress {
                    number: phase.number,
                    units: phase.units.clone(),
                    status: PhaseStatus::Waiting,
                    started_at: None,
                    finished_at: None,
                },
            );
        }
    }

    pub fn record(&self, event: ProgressEvent) -> Result<()> {
        self.record_at(event, Utc::now())
    }

    /// Apply one transition stamped with `at`
    pub fn record_at(&self, event: ProgressEvent, at: DateTime<Utc>) -> Result<()> {
        let sequence = match &event {
            ProgressEvent::UnitStatusChanged {
                unit,
                status,
                attempt,
                failure,
                detail,
            } => {
                let mut entry = self
                    .units
                    .get_mut(unit)
                    .ok_or_else(|| OrchestratorError::unknown_unit(unit.clone()))?;
                if !entry.status.can_transition_to(*status) {
                    return Err(OrchestratorError::invalid_transition(
                        format!("unit {}", unit),
                        entry.status,
                        status,
                    ));
                }
                entry.status = *status;
                if *status == UnitStatus::Building {
                    entry.attempts = *attempt;
                }
                if failure.is_some() {
                    entry.last_failure = *failure;
                }
                if detail.is_some() {
                    entry.detail = detail.clone();
                }
                entry.updated_at = at;
                self.advance(at)
            }
            ProgressEvent::PhaseStatusChanged { phase, status } => {
                let mut entry = self
                    .phases
                    .get_mut(phase)
                    .ok_or_else(|| OrchestratorError::internal(format!("unknown phase {}", phase)))?;
                if !entry.status.can_transition_to(*status) {
                    return Err(OrchestratorError::invalid_transition(
                        format!("phase {}", phase),
                        entry.status,
                        status,
                    ));
                }
                entry.status = *status;
                if *status == PhaseStatus::Active {
                    entry.started_at = Some(at);
                }
                if status.is_settled() {
                    entry.finished_at = Some(at);
                }
                self.advance(at)
            }
            ProgressEvent::IntegrationFinished {
                passed,
                failing_units,
            } => {
                let mut integration = self.integration.write();
                *integration = Some(IntegrationProgress {
                    passed: *passed,
                    failing_units: failing_units.clone(),
                    finished_at: at,
                });
                self.advance(at)
            }
        };

        trace!(run_id = %self.run_id, sequence, "Recorded {:?}", event);

        if !self.sinks.is_empty() {
            let envelope = ProgressEventEnvelope {
                sequence,
                run_id: self.run_id.clone(),
                timestamp: at,
                event,
            };
            for sink in &self.sinks {
                sink.emit(&envelope);
            }
        }
        Ok(())
    }

    /// Called with the changed entry still locked, so a reader that sees
    /// the change also sees the new sequence
    fn advance(&self, at: DateTime<Utc>) -> u64 {
        self.last_transition_ms
            .fetch_max(at.timestamp_millis(), Ordering::SeqCst);
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn unit_status(&self, unit: &str) -> Option<UnitStatus> {
        self.units.get(unit).map(|u| u.status)
    }

    pub fn phase_status(&self, phase: usize) -> Option<PhaseStatus> {
        self.phases.get(&phase).map(|p| p.status)
    }

    /// Read-only view derived from recorded timestamps only.
    ///
    /// The maps are copied between two reads of the sequence and the copy
    /// is retried until both reads agree, so a snapshot holds exactly the
    /// transitions its sequence counts.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let (sequence, last_ms, units, mut phases, integration) = loop {
            let before = self.sequence.load(Ordering::SeqCst);
            let last_ms = self.last_transition_ms.load(Ordering::SeqCst);
            let units: BTreeMap<UnitId, UnitProgress> = self
                .units
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            let phases: Vec<PhaseProgress> =
                self.phases.iter().map(|entry| entry.value().clone()).collect();
            let integration = self.integration.read().clone();
            if self.sequence.load(Ordering::SeqCst) == before {
                break (before, last_ms, units, phases, integration);
            }
            std::hint::spin_loop();
        };
        phases.sort_by_key(|p| p.number);

        let current_phase = phases
            .iter()
            .find(|p| !p.status.is_settled())
            .map(|p| p.number);

        let elapsed_ms = (last_ms - self.started_at.timestamp_millis()).max(0) as u64;
        let updated_at = if sequence > 0 {
            DateTime::from_timestamp_millis(last_ms)
        } else {
            None
        };

        ProgressSnapshot {
            run_id: self.run_id.clone(),
            sequence,
            started_at: self.started_at,
            updated_at,
            current_phase,
            estimated_remaining_ms: estimate_remaining(&phases),
            phases,
            units,
            elapsed_ms,
            integration,
        }
    }
}

/// Average duration of settled phases times the number still open
fn estimate_remaining(phases: &[PhaseProgress]) -> Option<u64> {
    let durations: Vec<i64> = phases
        .iter()
        .filter_map(|p| match (p.started_at, p.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        })
        .collect();
    if durations.is_empty() {
        return None;
    }
    let average = durations.iter().sum::<i64>() / durations.len() as i64;
    let open = phases.iter().filter(|p| !p.status.is_settled()).count() as i64;
    Some((average * open) as u64)
}
