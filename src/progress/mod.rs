//! Progress Tracker
//!
//! Per-unit and per-phase state machines, point-in-time snapshots, event
//! sinks and snapshot persistence.

pub mod events;
pub mod store;
pub mod tracker;

pub use events::{
    BufferingEventSink, EventSink, LoggingEventSink, ProgressEvent, ProgressEventEnvelope,
};
pub use store::{MemorySnapshotStore, SledSnapshotStore, SnapshotStore};
pub use tracker::{
    IntegrationProgress, PhaseProgress, ProgressSnapshot, ProgressTracker, UnitProgress,
};
