//! Integration Coordinator
//!
//! Final step of a run: substitute every stub a consumer still holds with
//! the provider's real implementation, then test all passed units together.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::contract::ContractRegistry;
use crate::model::{Unit, UnitId};
use crate::progress::{ProgressEvent, ProgressTracker};
use crate::scheduler::executor::note;
use crate::testing::{AggregatedResult, TestCoordinator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationReport {
    /// (consumer, provider) bindings moved from stub to real
    pub swapped: Vec<(UnitId, UnitId)>,
    /// (consumer, provider) bindings left on a stub; the provider never passed
    pub unresolved: Vec<(UnitId, UnitId)>,
    pub tests: AggregatedResult,
    pub passed: bool,
    /// Units attributed with an integration failure
    pub failing_units: Vec<UnitId>,
}

pub struct IntegrationCoordinator {
    registry: Arc<ContractRegistry>,
    tester: Arc<TestCoordinator>,
    tracker: Arc<ProgressTracker>,
}

impl IntegrationCoordinator {
    pub fn new(
        registry: Arc<ContractRegistry>,
        tester: Arc<TestCoordinator>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            registry,
            tester,
            tracker,
        }
    }

    /// Swap in real implementations and run one aggregated test over
    /// `units` (the passed units with their artifact refs).
    ///
    /// Per-phase results are never revised here.
    pub async fn integrate(&self, units: Vec<(Arc<Unit>, Option<String>)>) -> IntegrationReport {
        let swap = self.registry.swap_in_real().await;
        let tested: BTreeSet<UnitId> = units.iter().map(|(u, _)| u.id.clone()).collect();

        let tests = self.tester.run_integration_tests(units).await;

        let mut failing: BTreeSet<UnitId> = tests.failed_units().into_iter().collect();
        failing.extend(tests.cancelled_units());
        for (consumer, provider) in &swap.unresolved {
            if tested.contains(consumer) {
                warn!(consumer = %consumer, provider = %provider, "Consumer still bound to a stub");
                failing.insert(consumer.clone());
            }
        }

        let failing_units: Vec<UnitId> = failing.into_iter().collect();
        let passed = failing_units.is_empty();
        info!(
            run_id = %self.registry.run_id(),
            swapped = swap.swapped.len(),
            unresolved = swap.unresolved.len(),
            tested = tested.len(),
            passed,
            "Integration finished"
        );

        note(
            &self.tracker,
            ProgressEvent::IntegrationFinished {
                passed,
                failing_units: failing_units.clone(),
            },
        );

        IntegrationReport {
            swapped: swap.swapped,
            unresolved: swap.unresolved,
            tests,
            passed,
            failing_units,
        }
    }
}
