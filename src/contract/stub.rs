use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Contract, InvocationError, OperationSignature, Provider, Shape};
use crate::core::errors::{OrchestratorError, Result};
use crate::model::UnitId;

struct StubOperation {
    signature: OperationSignature,
    input_validator: jsonschema::Validator,
}

/// Deterministic, side-effect-free stand-in for a unit's contract.
///
/// Outputs depend only on the contract checksum, the operation name and the
/// call input, so repeated calls with the same input agree. The only state a
/// stub carries is its forced-error toggles and a call counter, both shared
/// by every consumer holding it.
pub struct Stub {
    unit: UnitId,
    checksum: String,
    operations: BTreeMap<String, StubOperation>,
    forced: DashMap<String, String>,
    calls: AtomicU64,
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("unit", &self.unit)
            .field("checksum", &self.checksum)
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .field("calls", &self.call_count())
            .finish()
    }
}

impl Stub {
    /// Derive a stub from a contract
    pub fn derive(contract: &Contract) -> Result<Self> {
        contract
            .check()
            .map_err(|reason| OrchestratorError::invalid_unit(contract.unit.clone(), reason))?;

        let mut operations = BTreeMap::new();
        for signature in &contract.operations {
            let schema = signature.input.to_json_schema();
            let input_validator = jsonschema::validator_for(&schema).map_err(|e| {
                OrchestratorError::internal(format!(
                    "Failed to compile input schema for {}.{}: {}",
                    contract.unit, signature.name, e
                ))
            })?;
            operations.insert(
                signature.name.clone(),
                StubOperation {
                    signature: signature.clone(),
                    input_validator,
                },
            );
        }

        Ok(Self {
            unit: contract.unit.clone(),
            checksum: contract.checksum(),
            operations,
            forced: DashMap::new(),
            calls: AtomicU64::new(0),
        })
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Checksum of the contract this stub was derived from
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Force `operation` to fail with a declared error kind, or clear the
    /// toggle with `None`
    pub fn force_error(
        &self,
        operation: &str,
        kind: Option<&str>,
    ) -> std::result::Result<(), InvocationError> {
        let op = self
            .operations
            .get(operation)
            .ok_or_else(|| InvocationError::UnknownOperation {
                unit: self.unit.clone(),
                operation: operation.to_string(),
            })?;

        match kind {
            Some(kind) => {
                if !op.signature.errors.iter().any(|declared| declared == kind) {
                    return Err(InvocationError::Failed {
                        message: format!(
                            "'{}' is not a declared error kind of {}.{}",
                            kind, self.unit, operation
                        ),
                    });
                }
                self.forced.insert(operation.to_string(), kind.to_string());
            }
            None => {
                self.forced.remove(operation);
            }
        }
        Ok(())
    }

    /// Serve one call
    pub fn call(&self, operation: &str, input: &Value) -> std::result::Result<Value, InvocationError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let op = self
            .operations
            .get(operation)
            .ok_or_else(|| InvocationError::UnknownOperation {
                unit: self.unit.clone(),
                operation: operation.to_string(),
            })?;

        if let Some(kind) = self.forced.get(operation) {
            return Err(InvocationError::Declared {
                operation: operation.to_string(),
                kind: kind.value().clone(),
            });
        }

        if let Err(error) = op.input_validator.validate(input) {
            return Err(InvocationError::InputRejected {
                operation: operation.to_string(),
                reason: error.to_string(),
            });
        }

        let seed = self.seed(operation, input);
        Ok(placeholder(&op.signature.output, &seed, operation))
    }

    fn seed(&self, operation: &str, input: &Value) -> blake3::Hash {
        // serde_json maps are ordered, so the rendering is canonical
        let canonical = input.to_string();
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.checksum.as_bytes());
        hasher.update(&[0]);
        hasher.update(operation.as_bytes());
        hasher.update(&[0]);
        hasher.update(canonical.as_bytes());
        hasher.finalize()
    }
}

#[async_trait]
impl Provider for Stub {
    async fn invoke(&self, operation: &str, input: &Value) -> std::result::Result<Value, InvocationError> {
        self.call(operation, input)
    }
}

/// Placeholder value satisfying `shape`, derived from `seed` and the field path
fn placeholder(shape: &Shape, seed: &blake3::Hash, path: &str) -> Value {
    let digest = blake3::Hasher::new()
        .update(seed.as_bytes())
        .update(path.as_bytes())
        .finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    let n = u64::from_le_bytes(word);

    match shape {
        Shape::Null => Value::Null,
        Shape::Boolean => Value::Bool(n & 1 == 1),
        Shape::Integer => json!((n % 1000) as i64),
        Shape::Number => json!((n % 100_000) as f64 / 100.0),
        Shape::String | Shape::Any => {
            let hex = digest.to_hex();
            Value::String(format!("stub:{}:{}", path, &hex.as_str()[..8]))
        }
        Shape::Enum { values } => match values.len() {
            0 => Value::Null,
            len => Value::String(values[(n % len as u64) as usize].clone()),
        },
        Shape::Array { items } => {
            Value::Array(vec![placeholder(items, seed, &format!("{}[0]", path))])
        }
        Shape::Object { properties } => {
            let mut map = Map::new();
            for (name, prop) in properties {
                map.insert(
                    name.clone(),
                    placeholder(prop, seed, &format!("{}.{}", path, name)),
                );
            }
            Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory_contract() -> Contract {
        Contract::new(
            "inventory",
            vec![
                OperationSignature::new(
                    "reserve",
                    Shape::object([("sku", Shape::String), ("qty", Shape::Integer)]),
                    Shape::object([
                        ("reservation_id", Shape::String),
                        ("confirmed", Shape::Boolean),
                        ("state", Shape::Enum {
                            values: vec!["held".into(), "queued".into()],
                        }),
                        ("lines", Shape::array(Shape::Number)),
                    ]),
                )
                .with_error("out_of_stock"),
                OperationSignature::new("ping", Shape::Any, Shape::Null),
            ],
        )
    }

    #[test]
    fn test_same_input_same_output() {
        let a = Stub::derive(&inventory_contract()).unwrap();
        let b = Stub::derive(&inventory_contract()).unwrap();
        let input = json!({"sku": "X-1", "qty": 2});

        let first = a.call("reserve", &input).unwrap();
        assert_eq!(first, a.call("reserve", &input).unwrap());
        assert_eq!(first, b.call("reserve", &input).unwrap());

        let other = a.call("reserve", &json!({"sku": "X-2", "qty": 2})).unwrap();
        assert_ne!(first["reservation_id"], other["reservation_id"]);
    }

    #[test]
    fn test_output_satisfies_shape() {
        let contract = inventory_contract();
        let stub = Stub::derive(&contract).unwrap();
        let output = stub.call("reserve", &json!({"sku": "A", "qty": 1})).unwrap();

        let schema = contract.operation("reserve").unwrap().output.to_json_schema();
        let validator = jsonschema::validator_for(&schema).unwrap();
        assert!(validator.is_valid(&output));
        assert_eq!(stub.call("ping", &json!("anything")).unwrap(), Value::Null);
    }

    #[test]
    fn test_input_rejected() {
        let stub = Stub::derive(&inventory_contract()).unwrap();
        let err = stub.call("reserve", &json!({"sku": 5})).unwrap_err();
        assert!(matches!(err, InvocationError::InputRejected { .. }));
    }

    #[test]
    fn test_forced_error_toggle() {
        let stub = Stub::derive(&inventory_contract()).unwrap();
        let input = json!({"sku": "A", "qty": 1});

        stub.force_error("reserve", Some("out_of_stock")).unwrap();
        assert_eq!(
            stub.call("reserve", &input).unwrap_err(),
            InvocationError::Declared {
                operation: "reserve".into(),
                kind: "out_of_stock".into()
            }
        );

        // undeclared kinds cannot be forced
        assert!(stub.force_error("reserve", Some("disk_full")).is_err());

        stub.force_error("reserve", None).unwrap();
        assert!(stub.call("reserve", &input).is_ok());
        assert_eq!(stub.call_count(), 2);
    }

    #[test]
    fn test_unknown_operation() {
        let stub = Stub::derive(&inventory_contract()).unwrap();
        assert!(matches!(
            stub.call("restock", &Value::Null),
            Err(InvocationError::UnknownOperation { .. })
        ));
    }
}
