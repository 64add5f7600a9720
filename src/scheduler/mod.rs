//! Build Scheduler
//!
//! `planner` layers the validated graph into phases; `executor` dispatches
//! the concurrent build tasks of a phase.

pub mod executor;
pub mod planner;

pub use executor::{BuildOutcome, BuildScheduler, UnitBuildResult};
pub use planner::{plan, Phase, PhasePlan, PlannedEdge};
