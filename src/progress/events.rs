//! Progress events and the sinks they are forwarded to

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::model::{FailureKind, PhaseStatus, UnitId, UnitStatus};

/// A single state change reported to the tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    UnitStatusChanged {
        unit: UnitId,
        status: UnitStatus,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    PhaseStatusChanged {
        phase: usize,
        status: PhaseStatus,
    },
    IntegrationFinished {
        passed: bool,
        failing_units: Vec<UnitId>,
    },
}

impl ProgressEvent {
    pub fn unit(unit: impl Into<UnitId>, status: UnitStatus, attempt: u32) -> Self {
        Self::UnitStatusChanged {
            unit: unit.into(),
            status,
            attempt,
            failure: None,
            detail: None,
        }
    }

    /// A failed attempt, with its cause
    pub fn unit_failure(
        unit: impl Into<UnitId>,
        status: UnitStatus,
        attempt: u32,
        failure: FailureKind,
        detail: impl Into<String>,
    ) -> Self {
        Self::UnitStatusChanged {
            unit: unit.into(),
            status,
            attempt,
            failure: Some(failure),
            detail: Some(detail.into()),
        }
    }

    pub fn phase(phase: usize, status: PhaseStatus) -> Self {
        Self::PhaseStatusChanged { phase, status }
    }
}

/// Event envelope with run metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEventEnvelope {
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: ProgressEvent,
}

/// Receiver of recorded progress events
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &ProgressEventEnvelope);
}

/// Logs every event at debug level
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &ProgressEventEnvelope) {
        tracing::debug!(
            run_id = %envelope.run_id,
            sequence = envelope.sequence,
            "Event: {:?}",
            envelope.event
        );
    }
}

/// Collects events in memory
#[derive(Clone, Default)]
pub struct BufferingEventSink {
    events: Arc<RwLock<Vec<ProgressEventEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEventEnvelope> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &ProgressEventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}
