//! Contract Registry
//!
//! Contracts are the frozen interfaces units promise to their consumers.
//! The registry derives one deterministic stub per contract per run, hands
//! consumers per-dependency handles, and swaps stubs for real
//! implementations once providers are promoted.

pub mod registry;
pub mod shape;
pub mod stub;

pub use registry::{
    Binding, BindingSession, ContractRegistry, DependencyHandle, RealImplementation, Resolved,
    SwapSummary,
};
pub use shape::Shape;
pub use stub::Stub;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::model::UnitId;

/// One exported operation of a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationSignature {
    pub name: String,
    #[serde(default)]
    pub input: Shape,
    #[serde(default)]
    pub output: Shape,
    /// Error kinds callers must be prepared to handle
    #[serde(default)]
    pub errors: Vec<String>,
}

impl OperationSignature {
    pub fn new(name: impl Into<String>, input: Shape, output: Shape) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            errors: Vec::new(),
        }
    }

    pub fn with_error(mut self, kind: impl Into<String>) -> Self {
        self.errors.push(kind.into());
        self
    }

    fn feed(&self, hasher: &mut blake3::Hasher) {
        hasher.update(self.name.as_bytes());
        hasher.update(b"{in:");
        self.input.feed(hasher);
        hasher.update(b"out:");
        self.output.feed(hasher);
        hasher.update(b"err:");
        let mut errors: Vec<&String> = self.errors.iter().collect();
        errors.sort();
        for kind in errors {
            hasher.update(kind.as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"}");
    }
}

/// The interface a unit exposes to its consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub unit: UnitId,
    pub operations: Vec<OperationSignature>,
}

impl Contract {
    pub fn new(unit: impl Into<UnitId>, operations: Vec<OperationSignature>) -> Self {
        Self {
            unit: unit.into(),
            operations,
        }
    }

    /// Contract with untyped operations, one per exported capability
    pub fn from_capabilities(unit: impl Into<UnitId>, capabilities: &[String]) -> Self {
        let operations = capabilities
            .iter()
            .map(|name| OperationSignature::new(name.clone(), Shape::Any, Shape::Any))
            .collect();
        Self::new(unit, operations)
    }

    pub fn operation(&self, name: &str) -> Option<&OperationSignature> {
        self.operations.iter().find(|op| op.name == name)
    }

    /// Structural checks: unique operation names, satisfiable shapes
    pub fn check(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for op in &self.operations {
            if op.name.trim().is_empty() {
                return Err("operation with empty name".to_string());
            }
            if !seen.insert(op.name.as_str()) {
                return Err(format!("duplicate operation '{}'", op.name));
            }
            op.input.check(&format!("{}.input", op.name))?;
            op.output.check(&format!("{}.output", op.name))?;
        }
        Ok(())
    }

    /// BLAKE3 checksum over the name-sorted operations; order of
    /// declaration does not matter
    pub fn checksum(&self) -> String {
        let mut ops: Vec<&OperationSignature> = self.operations.iter().collect();
        ops.sort_by(|a, b| a.name.cmp(&b.name));

        let mut hasher = blake3::Hasher::new();
        for op in ops {
            op.feed(&mut hasher);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Failure of a call made through a resolved dependency
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("Unit {unit} exports no operation '{operation}'")]
    UnknownOperation { unit: UnitId, operation: String },

    #[error("Input rejected by '{operation}': {reason}")]
    InputRejected { operation: String, reason: String },

    /// A declared error kind, returned on purpose
    #[error("Operation '{operation}' raised declared error '{kind}'")]
    Declared { operation: String, kind: String },

    #[error("Unit {unit} is unavailable: {reason}")]
    Unavailable { unit: UnitId, reason: String },

    #[error("Invocation failed: {message}")]
    Failed { message: String },
}

/// Something that can serve a contract's operations
#[async_trait]
pub trait Provider: Send + Sync {
    async fn invoke(&self, operation: &str, input: &Value) -> Result<Value, InvocationError>;
}
