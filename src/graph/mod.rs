//! Dependency Graph Validator
//!
//! Builds the consumer → provider graph of a plan and checks it for cycles,
//! unserialized shared writes, tight coupling and responsibility sprawl.

pub mod validator;

pub use validator::{validate, DependencyGraph, Severity, Violation, ViolationKind};
