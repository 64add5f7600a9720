use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

use super::{Contract, InvocationError, Provider, Stub};
use crate::core::errors::{OrchestratorError, Result};
use crate::model::UnitId;

struct ContractEntry {
    contract: Contract,
    checksum: String,
    version: u32,
    /// Set once the first stub is derived; later changes are drift
    frozen: bool,
}

/// A provider's completed build, posted when it passes
#[derive(Clone)]
pub struct RealImplementation {
    pub unit: UnitId,
    pub artifact_ref: String,
    pub provider: Option<Arc<dyn Provider>>,
}

impl fmt::Debug for RealImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealImplementation")
            .field("unit", &self.unit)
            .field("artifact_ref", &self.artifact_ref)
            .field("callable", &self.provider.is_some())
            .finish()
    }
}

/// What a dependency currently resolves to
#[derive(Debug, Clone)]
pub enum Resolved {
    Real(RealImplementation),
    Stub(Arc<Stub>),
}

/// Contents of one consumer's dependency slot
#[derive(Debug, Clone)]
pub enum Binding {
    Stub(Arc<Stub>),
    Real(RealImplementation),
}

/// A consumer's reference to one of its dependencies.
///
/// Calls hold a read guard on the slot for their whole duration and swaps
/// take the write guard, so a call is served entirely by the stub or
/// entirely by the real implementation.
#[derive(Debug, Clone)]
pub struct DependencyHandle {
    consumer: UnitId,
    provider: UnitId,
    slot: Arc<RwLock<Binding>>,
}

impl DependencyHandle {
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub async fn invoke(
        &self,
        operation: &str,
        input: &Value,
    ) -> std::result::Result<Value, InvocationError> {
        self.session().await.invoke(operation, input).await
    }

    /// Pin the current binding; a swap waits until the session is dropped
    pub async fn session(&self) -> BindingSession {
        BindingSession {
            binding: self.slot.clone().read_owned().await,
        }
    }

    pub async fn is_stub(&self) -> bool {
        matches!(&*self.slot.read().await, Binding::Stub(_))
    }

    /// The stub behind this handle, if it has not been swapped yet
    pub async fn stub(&self) -> Option<Arc<Stub>> {
        match &*self.slot.read().await {
            Binding::Stub(stub) => Some(stub.clone()),
            Binding::Real(_) => None,
        }
    }

    pub async fn binding(&self) -> Binding {
        self.slot.read().await.clone()
    }
}

/// Calls made through one session all reach the same implementation
pub struct BindingSession {
    binding: OwnedRwLockReadGuard<Binding>,
}

impl BindingSession {
    pub fn is_stub(&self) -> bool {
        matches!(&*self.binding, Binding::Stub(_))
    }

    pub async fn invoke(
        &self,
        operation: &str,
        input: &Value,
    ) -> std::result::Result<Value, InvocationError> {
        match &*self.binding {
            Binding::Stub(stub) => stub.call(operation, input),
            Binding::Real(real) => match &real.provider {
                Some(provider) => provider.invoke(operation, input).await,
                None => Err(InvocationError::Unavailable {
                    unit: real.unit.clone(),
                    reason: format!("artifact {} is not callable", real.artifact_ref),
                }),
            },
        }
    }
}

/// Outcome of swapping pending stubs for real implementations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapSummary {
    /// (consumer, provider) pairs now bound to the real implementation
    pub swapped: Vec<(UnitId, UnitId)>,
    /// (consumer, provider) pairs still on a stub because the provider never passed
    pub unresolved: Vec<(UnitId, UnitId)>,
}

/// Per-run store of contracts, stubs and dependency bindings
pub struct ContractRegistry {
    run_id: String,
    contracts: DashMap<UnitId, ContractEntry>,
    stubs: DashMap<UnitId, Arc<Stub>>,
    promoted: DashMap<UnitId, RealImplementation>,
    bindings: DashMap<(UnitId, UnitId), Arc<RwLock<Binding>>>,
}

impl ContractRegistry {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            contracts: DashMap::new(),
            stubs: DashMap::new(),
            promoted: DashMap::new(),
            bindings: DashMap::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Register or update a unit's contract, returning its version.
    ///
    /// Re-registering identical content is a no-op. Changing a contract
    /// that already backs a stub fails with `ContractDrift`.
    pub fn register(&self, contract: Contract) -> Result<u32> {
        contract
            .check()
            .map_err(|reason| OrchestratorError::invalid_unit(contract.unit.clone(), reason))?;
        let checksum = contract.checksum();

        match self.contracts.entry(contract.unit.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.checksum == checksum {
                    return Ok(entry.version);
                }
                if entry.frozen {
                    warn!(
                        unit = %contract.unit,
                        expected = %entry.checksum,
                        actual = %checksum,
                        "Rejected drifted contract"
                    );
                    return Err(OrchestratorError::ContractDrift {
                        unit: contract.unit,
                        expected: entry.checksum.clone(),
                        actual: checksum,
                    });
                }
                entry.version += 1;
                entry.checksum = checksum;
                entry.contract = contract;
                debug!(unit = %entry.contract.unit, version = entry.version, "Contract updated");
                Ok(entry.version)
            }
            Entry::Vacant(vacant) => {
                debug!(unit = %contract.unit, "Contract registered");
                vacant.insert(ContractEntry {
                    contract,
                    checksum,
                    version: 1,
                    frozen: false,
                });
                Ok(1)
            }
        }
    }

    pub fn contract(&self, unit: &str) -> Option<Contract> {
        self.contracts.get(unit).map(|e| e.contract.clone())
    }

    pub fn checksum(&self, unit: &str) -> Option<String> {
        self.contracts.get(unit).map(|e| e.checksum.clone())
    }

    pub fn version(&self, unit: &str) -> Option<u32> {
        self.contracts.get(unit).map(|e| e.version)
    }

    pub fn is_frozen(&self, unit: &str) -> bool {
        self.contracts.get(unit).map(|e| e.frozen).unwrap_or(false)
    }

    /// The run's single stub for `unit`, deriving it and freezing the
    /// contract on first use
    pub fn generate_stub(&self, unit: &str) -> Result<Arc<Stub>> {
        if let Some(stub) = self.stubs.get(unit) {
            return Ok(stub.clone());
        }

        let mut entry = self
            .contracts
            .get_mut(unit)
            .ok_or_else(|| OrchestratorError::unknown_unit(unit))?;
        entry.frozen = true;

        let stub = self
            .stubs
            .entry(unit.to_string())
            .or_try_insert_with(|| Stub::derive(&entry.contract).map(Arc::new))?
            .clone();
        debug!(unit = %unit, checksum = %stub.checksum(), "Stub available");
        Ok(stub)
    }

    /// Real implementation when promoted, the run's stub otherwise
    pub fn resolve(&self, unit: &str) -> Result<Resolved> {
        if let Some(real) = self.promoted.get(unit) {
            return Ok(Resolved::Real(real.clone()));
        }
        Ok(Resolved::Stub(self.generate_stub(unit)?))
    }

    /// Handle for `consumer`'s dependency on `provider`; repeated calls
    /// return the same slot
    pub fn bind(&self, consumer: &str, provider: &str) -> Result<DependencyHandle> {
        let key = (consumer.to_string(), provider.to_string());
        if let Some(slot) = self.bindings.get(&key) {
            return Ok(DependencyHandle {
                consumer: key.0,
                provider: key.1,
                slot: slot.clone(),
            });
        }

        let initial = match self.resolve(provider)? {
            Resolved::Real(real) => Binding::Real(real),
            Resolved::Stub(stub) => Binding::Stub(stub),
        };
        let slot = self
            .bindings
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(initial)))
            .clone();

        Ok(DependencyHandle {
            consumer: key.0,
            provider: key.1,
            slot,
        })
    }

    /// Post a passed unit's real implementation; later resolutions return it
    pub fn promote(&self, real: RealImplementation) {
        info!(unit = %real.unit, artifact = %real.artifact_ref, "Promoted real implementation");
        self.promoted.insert(real.unit.clone(), real);
    }

    pub fn is_promoted(&self, unit: &str) -> bool {
        self.promoted.contains_key(unit)
    }

    pub fn real(&self, unit: &str) -> Option<RealImplementation> {
        self.promoted.get(unit).map(|r| r.clone())
    }

    pub fn stub_count(&self) -> usize {
        self.stubs.len()
    }

    /// Swap every stub-bound slot whose provider has been promoted and
    /// discard stubs no longer referenced by any slot
    pub async fn swap_in_real(&self) -> SwapSummary {
        let slots: Vec<((UnitId, UnitId), Arc<RwLock<Binding>>)> = self
            .bindings
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut summary = SwapSummary::default();
        for ((consumer, provider), slot) in slots {
            let mut binding = slot.write().await;
            if let Binding::Stub(_) = &*binding {
                match self.promoted.get(&provider) {
                    Some(real) => {
                        *binding = Binding::Real(real.clone());
                        summary.swapped.push((consumer, provider));
                    }
                    None => summary.unresolved.push((consumer, provider)),
                }
            }
        }

        self.stubs.retain(|unit, _| !self.promoted.contains_key(unit));
        summary.swapped.sort();
        summary.unresolved.sort();

        info!(
            run_id = %self.run_id,
            swapped = summary.swapped.len(),
            unresolved = summary.unresolved.len(),
            "Stub substitution finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{OperationSignature, Shape};
    use async_trait::async_trait;
    use serde_json::json;

    fn contract(unit: &str, output: Shape) -> Contract {
        Contract::new(unit, vec![OperationSignature::new("get", Shape::Any, output)])
    }

    struct Echo;

    #[async_trait]
    impl Provider for Echo {
        async fn invoke(
            &self,
            _operation: &str,
            input: &Value,
        ) -> std::result::Result<Value, InvocationError> {
            Ok(json!({ "echo": input }))
        }
    }

    #[test]
    fn test_register_versions_until_frozen() {
        let registry = ContractRegistry::new("run");
        assert_eq!(registry.register(contract("e", Shape::String)).unwrap(), 1);
        assert_eq!(registry.register(contract("e", Shape::String)).unwrap(), 1);
        assert_eq!(registry.register(contract("e", Shape::Integer)).unwrap(), 2);

        registry.generate_stub("e").unwrap();
        assert!(registry.is_frozen("e"));

        // identical content is still accepted after freeze
        assert_eq!(registry.register(contract("e", Shape::Integer)).unwrap(), 2);
        let err = registry.register(contract("e", Shape::Boolean)).unwrap_err();
        assert!(matches!(err, OrchestratorError::ContractDrift { .. }));
    }

    #[test]
    fn test_one_stub_per_contract() {
        let registry = ContractRegistry::new("run");
        registry.register(contract("e", Shape::String)).unwrap();

        let a = registry.generate_stub("e").unwrap();
        let b = registry.generate_stub("e").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.stub_count(), 1);
        assert!(registry.generate_stub("missing").is_err());
    }

    #[tokio::test]
    async fn test_consumers_share_stub_state() {
        let registry = ContractRegistry::new("run");
        registry.register(contract("e", Shape::String)).unwrap();

        let d = registry.bind("d", "e").unwrap();
        let f = registry.bind("f", "e").unwrap();
        d.invoke("get", &json!(1)).await.unwrap();
        f.invoke("get", &json!(1)).await.unwrap();

        let stub = d.stub().await.unwrap();
        assert!(Arc::ptr_eq(&stub, &f.stub().await.unwrap()));
        assert_eq!(stub.call_count(), 2);
    }

    #[tokio::test]
    async fn test_resolve_after_promotion() {
        let registry = ContractRegistry::new("run");
        registry.register(contract("e", Shape::String)).unwrap();
        assert!(matches!(registry.resolve("e").unwrap(), Resolved::Stub(_)));

        registry.promote(RealImplementation {
            unit: "e".into(),
            artifact_ref: "e@1".into(),
            provider: Some(Arc::new(Echo)),
        });
        assert!(matches!(registry.resolve("e").unwrap(), Resolved::Real(_)));

        // new bindings go straight to the real implementation
        let handle = registry.bind("late", "e").unwrap();
        assert!(!handle.is_stub().await);
    }

    #[tokio::test]
    async fn test_swap_in_real() {
        let registry = ContractRegistry::new("run");
        registry.register(contract("e", Shape::String)).unwrap();
        registry.register(contract("g", Shape::String)).unwrap();

        let d_e = registry.bind("d", "e").unwrap();
        let d_g = registry.bind("d", "g").unwrap();
        registry.promote(RealImplementation {
            unit: "e".into(),
            artifact_ref: "e@1".into(),
            provider: Some(Arc::new(Echo)),
        });

        // promotion alone leaves existing slots untouched
        assert!(d_e.is_stub().await);

        let summary = registry.swap_in_real().await;
        assert_eq!(summary.swapped, vec![("d".to_string(), "e".to_string())]);
        assert_eq!(summary.unresolved, vec![("d".to_string(), "g".to_string())]);
        assert!(!d_e.is_stub().await);
        assert!(d_g.is_stub().await);
        assert_eq!(
            d_e.invoke("get", &json!(7)).await.unwrap(),
            json!({ "echo": 7 })
        );
        assert_eq!(registry.stub_count(), 1);
    }

    #[tokio::test]
    async fn test_real_without_provider_is_unavailable() {
        let registry = ContractRegistry::new("run");
        registry.register(contract("e", Shape::String)).unwrap();
        registry.promote(RealImplementation {
            unit: "e".into(),
            artifact_ref: "dist/e.tar".into(),
            provider: None,
        });
        let handle = registry.bind("d", "e").unwrap();
        assert!(matches!(
            handle.invoke("get", &json!(null)).await,
            Err(InvocationError::Unavailable { .. })
        ));
    }
}
