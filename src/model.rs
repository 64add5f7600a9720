//! Build plan declarations and the validated unit model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::contract::{Contract, OperationSignature};
use crate::core::errors::{OrchestratorError, Result};

// Type aliases
pub type UnitId = String;

/// A dependency as written in a plan: a bare id, or an id with its own
/// stub eligibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyDecl {
    Id(UnitId),
    Detailed {
        id: UnitId,
        stub_eligible: bool,
    },
}

impl DependencyDecl {
    pub fn id(&self) -> &str {
        match self {
            DependencyDecl::Id(id) => id,
            DependencyDecl::Detailed { id, .. } => id,
        }
    }
}

/// Named external resources a unit reads or writes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceAccess {
    #[serde(default)]
    pub reads: BTreeSet<String>,
    #[serde(default)]
    pub writes: BTreeSet<String>,
}

/// One unit as declared by the planning collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitDeclaration {
    pub id: UnitId,
    #[serde(default)]
    pub dependencies: Vec<DependencyDecl>,
    #[serde(default)]
    pub exported_capabilities: Vec<String>,
    /// Default eligibility for dependencies that don't set their own
    #[serde(default)]
    pub stub_eligible: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub resources: ResourceAccess,
    /// Cross-references into other units, by count
    #[serde(default)]
    pub references: BTreeMap<UnitId, u32>,
    /// Explicit operation signatures; derived from capabilities when absent
    #[serde(default)]
    pub contract: Option<Vec<OperationSignature>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Opaque data for build/test collaborators
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl UnitDeclaration {
    pub fn new(id: impl Into<UnitId>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            exported_capabilities: Vec::new(),
            stub_eligible: false,
            priority: 0,
            resources: ResourceAccess::default(),
            references: BTreeMap::new(),
            contract: None,
            timeout_secs: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<UnitId>) -> Self {
        self.dependencies.push(DependencyDecl::Id(id.into()));
        self
    }

    pub fn stub_eligible(mut self, eligible: bool) -> Self {
        self.stub_eligible = eligible;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn exports(mut self, capability: impl Into<String>) -> Self {
        self.exported_capabilities.push(capability.into());
        self
    }

    pub fn writes(mut self, resource: impl Into<String>) -> Self {
        self.resources.writes.insert(resource.into());
        self
    }

    pub fn references(mut self, unit: impl Into<UnitId>, count: u32) -> Self {
        self.references.insert(unit.into(), count);
        self
    }
}

/// The build plan submitted for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildPlan {
    #[serde(default)]
    pub name: Option<String>,
    pub units: Vec<UnitDeclaration>,
}

impl BuildPlan {
    pub fn new(units: Vec<UnitDeclaration>) -> Self {
        Self { name: None, units }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a plan, choosing the format by extension (`.json`, else YAML)
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::io(format!("read plan {}", path.display()), e))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    /// Check the plan and convert it into validated units
    pub fn into_units(self) -> Result<Vec<Unit>> {
        if self.units.is_empty() {
            return Err(OrchestratorError::invalid_plan("plan declares no units"));
        }

        let mut ids = BTreeSet::new();
        for decl in &self.units {
            if decl.id.trim().is_empty() {
                return Err(OrchestratorError::invalid_plan("unit with empty id"));
            }
            if !ids.insert(decl.id.as_str()) {
                return Err(OrchestratorError::invalid_unit(
                    decl.id.clone(),
                    format!("duplicate unit id '{}'", decl.id),
                ));
            }
        }

        for decl in &self.units {
            let mut seen = BTreeSet::new();
            for dep in &decl.dependencies {
                if !ids.contains(dep.id()) {
                    return Err(OrchestratorError::invalid_unit(
                        decl.id.clone(),
                        format!("depends on unknown unit '{}'", dep.id()),
                    ));
                }
                if !seen.insert(dep.id()) {
                    return Err(OrchestratorError::invalid_unit(
                        decl.id.clone(),
                        format!("declares dependency '{}' twice", dep.id()),
                    ));
                }
            }
            for target in decl.references.keys() {
                if !ids.contains(target.as_str()) {
                    return Err(OrchestratorError::invalid_unit(
                        decl.id.clone(),
                        format!("references unknown unit '{}'", target),
                    ));
                }
            }
            if decl.timeout_secs == Some(0) {
                return Err(OrchestratorError::invalid_unit(
                    decl.id.clone(),
                    "timeout_secs must be greater than 0",
                ));
            }
        }

        self.units.into_iter().map(Unit::from_declaration).collect()
    }
}

/// A resolved dependency edge from a unit to its provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: UnitId,
    pub stub_eligible: bool,
}

/// A validated unit
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub id: UnitId,
    pub dependencies: Vec<Dependency>,
    pub capabilities: Vec<String>,
    pub priority: i32,
    pub resources: ResourceAccess,
    pub references: BTreeMap<UnitId, u32>,
    pub contract: Contract,
    pub timeout: Option<Duration>,
    pub metadata: BTreeMap<String, Value>,
}

impl Unit {
    fn from_declaration(decl: UnitDeclaration) -> Result<Self> {
        let contract = match decl.contract {
            Some(operations) => Contract::new(decl.id.clone(), operations),
            None => Contract::from_capabilities(decl.id.clone(), &decl.exported_capabilities),
        };
        contract
            .check()
            .map_err(|reason| OrchestratorError::invalid_unit(decl.id.clone(), reason))?;

        let default_eligible = decl.stub_eligible;
        let dependencies = decl
            .dependencies
            .into_iter()
            .map(|dep| match dep {
                DependencyDecl::Id(id) => Dependency {
                    id,
                    stub_eligible: default_eligible,
                },
                DependencyDecl::Detailed { id, stub_eligible } => Dependency { id, stub_eligible },
            })
            .collect();

        let mut capabilities = decl.exported_capabilities;
        for op in &contract.operations {
            if !capabilities.contains(&op.name) {
                capabilities.push(op.name.clone());
            }
        }

        Ok(Self {
            id: decl.id,
            dependencies,
            capabilities,
            priority: decl.priority,
            resources: decl.resources,
            references: decl.references,
            contract,
            timeout: decl.timeout_secs.map(Duration::from_secs),
            metadata: decl.metadata,
        })
    }

    pub fn hard_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| !d.stub_eligible)
    }

    pub fn depends_on(&self, other: &str) -> bool {
        self.dependencies.iter().any(|d| d.id == other)
    }
}

/// Why a unit's attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Build,
    Test,
    Timeout,
    ContractDrift,
}

impl FailureKind {
    /// Drift is deterministic: rebuilding reports the same contract
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::ContractDrift)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Build => "build failure",
            FailureKind::Test => "test failure",
            FailureKind::Timeout => "timeout",
            FailureKind::ContractDrift => "contract drift",
        };
        f.write_str(label)
    }
}

/// Per-unit lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Building,
    /// The unit's own build step failed
    BuildFailed,
    Testing,
    Failed,
    Passed,
    /// Retries exhausted; waiting on an external decision
    Escalated,
    /// Stopped by fail-fast before it could finish
    Cancelled,
    /// Never ran because a hard dependency did not pass
    Blocked,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitStatus::Passed | UnitStatus::Escalated | UnitStatus::Cancelled | UnitStatus::Blocked
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, UnitStatus::BuildFailed | UnitStatus::Failed)
    }

    /// Allowed edges of the unit state machine
    pub fn can_transition_to(self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (Pending, Building)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (Building, Testing)
                | (Building, BuildFailed)
                | (Building, Cancelled)
                | (Testing, Passed)
                | (Testing, Failed)
                | (Testing, Cancelled)
                | (BuildFailed, Building)
                | (BuildFailed, Escalated)
                | (Failed, Building)
                | (Failed, Escalated)
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-phase lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Waiting,
    Active,
    Complete,
    Blocked,
}

impl PhaseStatus {
    pub fn can_transition_to(self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (Waiting, Active) | (Waiting, Blocked) | (Active, Complete) | (Active, Blocked)
        )
    }

    pub fn is_settled(self) -> bool {
        matches!(self, PhaseStatus::Complete | PhaseStatus::Blocked)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PLAN: &str = r#"
name: shop
units:
  - id: db
    exported_capabilities: [db.query]
    resources: { writes: [orders_table] }
  - id: api
    dependencies:
      - db
      - { id: auth, stub_eligible: true }
    priority: 2
    timeout_secs: 30
    contract:
      - name: create_order
        input: { type: object, properties: { sku: { type: string } } }
        output: { type: integer }
        errors: [invalid_sku]
  - id: auth
    exported_capabilities: [auth.login]
"#;

    #[test]
    fn test_yaml_plan_ingestion() {
        let units = BuildPlan::from_yaml_str(PLAN).unwrap().into_units().unwrap();
        assert_eq!(units.len(), 3);

        let api = &units[1];
        assert_eq!(
            api.dependencies,
            vec![
                Dependency { id: "db".into(), stub_eligible: false },
                Dependency { id: "auth".into(), stub_eligible: true },
            ]
        );
        assert_eq!(api.timeout, Some(Duration::from_secs(30)));
        assert_eq!(api.capabilities, vec!["create_order".to_string()]);
        assert_eq!(api.hard_dependencies().count(), 1);

        let db = &units[0];
        assert!(db.resources.writes.contains("orders_table"));
        assert!(db.contract.operation("db.query").is_some());
    }

    #[test]
    fn test_json_plan_ingestion() {
        let plan = BuildPlan::from_json_str(
            r#"{"units": [{"id": "a"}, {"id": "b", "dependencies": ["a"], "stub_eligible": true}]}"#,
        )
        .unwrap();
        let units = plan.into_units().unwrap();
        assert!(units[1].dependencies[0].stub_eligible);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = BuildPlan::from_yaml_str("units:\n  - id: a\n    color: blue\n").unwrap_err();
        assert_eq!(err.category(), "serialization");
    }

    #[test]
    fn test_malformed_plans_rejected() {
        let cases = vec![
            BuildPlan::new(vec![]),
            BuildPlan::new(vec![UnitDeclaration::new(" ")]),
            BuildPlan::new(vec![UnitDeclaration::new("a"), UnitDeclaration::new("a")]),
            BuildPlan::new(vec![UnitDeclaration::new("a").depends_on("ghost")]),
            BuildPlan::new(vec![
                UnitDeclaration::new("a"),
                UnitDeclaration::new("b").depends_on("a").depends_on("a"),
            ]),
            BuildPlan::new(vec![UnitDeclaration::new("a").references("ghost", 3)]),
        ];
        for plan in cases {
            let err = plan.into_units().unwrap_err();
            assert!(matches!(err, OrchestratorError::InvalidPlan { .. }), "{err}");
        }
    }

    #[test]
    fn test_self_dependency_left_to_validator() {
        let units = BuildPlan::new(vec![UnitDeclaration::new("a").depends_on("a")])
            .into_units()
            .unwrap();
        assert!(units[0].depends_on("a"));
    }

    #[test]
    fn test_unit_state_machine() {
        use UnitStatus::*;
        assert!(Pending.can_transition_to(Building));
        assert!(Failed.can_transition_to(Building));
        assert!(BuildFailed.can_transition_to(Escalated));
        assert!(!Passed.can_transition_to(Building));
        assert!(!Escalated.can_transition_to(Building));
        assert!(!Testing.can_transition_to(Building));
        assert!(Cancelled.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn test_phase_state_machine() {
        use PhaseStatus::*;
        assert!(Waiting.can_transition_to(Active));
        assert!(Active.can_transition_to(Blocked));
        assert!(!Complete.can_transition_to(Active));
    }
}
