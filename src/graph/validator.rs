use petgraph::algo::{has_path_connecting, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef, Reversed};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{error, info, warn};

use crate::core::config::OrchestratorConfig;
use crate::core::errors::{OrchestratorError, Result};
use crate::model::{Dependency, Unit, UnitId};

/// Whether a violation blocks scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    /// Directed cycle; `path` starts and ends on the same unit
    Cycle { path: Vec<UnitId> },
    /// Two unrelated units write the same resource
    SharedMutableState {
        resource: String,
        units: Vec<UnitId>,
    },
    TightCoupling {
        units: Vec<UnitId>,
        references: u32,
        threshold: u32,
    },
    MultipleResponsibilities {
        unit: UnitId,
        groups: Vec<String>,
    },
}

/// A finding of the validator, with advisory remediation text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: ViolationKind,
    pub remediation: String,
}

impl Violation {
    fn critical(kind: ViolationKind, remediation: String) -> Self {
        Self {
            severity: Severity::Critical,
            kind,
            remediation,
        }
    }

    fn warning(kind: ViolationKind, remediation: String) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            remediation,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// The validated consumer → provider graph of a plan
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<UnitId, Dependency>,
    index: HashMap<UnitId, NodeIndex>,
    units: BTreeMap<UnitId, Unit>,
}

impl DependencyGraph {
    /// Build the graph; dependencies must name known units
    pub fn build(units: Vec<Unit>) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let units: BTreeMap<UnitId, Unit> = units.into_iter().map(|u| (u.id.clone(), u)).collect();

        for id in units.keys() {
            let idx = graph.add_node(id.clone());
            index.insert(id.clone(), idx);
        }
        for unit in units.values() {
            let consumer = index[&unit.id];
            for dep in &unit.dependencies {
                if let Some(&provider) = index.get(&dep.id) {
                    graph.add_edge(consumer, provider, dep.clone());
                }
            }
        }

        Self {
            graph,
            index,
            units,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.get(id)
    }

    /// Units in identifier order
    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Units that depend directly on `id`
    pub fn consumers(&self, id: &str) -> Vec<UnitId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut consumers: Vec<UnitId> = self
            .graph
            .edges_directed(idx, petgraph::Direction::Incoming)
            .map(|e| self.graph[e.source()].clone())
            .collect();
        consumers.sort();
        consumers
    }

    /// Units that depend on `id` directly or transitively
    pub fn dependents(&self, id: &str) -> BTreeSet<UnitId> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut dependents = BTreeSet::new();
        while let Some(idx) = bfs.next(reversed) {
            if idx != start {
                dependents.insert(self.graph[idx].clone());
            }
        }
        dependents
    }

    /// True when `consumer` depends on `provider`, directly or transitively
    pub fn reaches(&self, consumer: &str, provider: &str) -> bool {
        match (self.index.get(consumer), self.index.get(provider)) {
            (Some(&from), Some(&to)) if from != to => {
                has_path_connecting(&self.graph, from, to, None)
            }
            _ => false,
        }
    }

    /// Either unit depends on the other
    pub fn related(&self, a: &str, b: &str) -> bool {
        self.reaches(a, b) || self.reaches(b, a)
    }

    /// Units ordered so every provider precedes its consumers
    pub fn provider_order(&self) -> Result<Vec<&Unit>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            OrchestratorError::invalid_unit(
                self.graph[cycle.node_id()].clone(),
                "unit is part of a dependency cycle",
            )
        })?;
        Ok(order
            .into_iter()
            .rev()
            .filter_map(|idx| self.units.get(&self.graph[idx]))
            .collect())
    }

    fn cycles(&self) -> Vec<Vec<UnitId>> {
        let mut cycles = Vec::new();
        for scc in tarjan_scc(&self.graph) {
            let is_cycle = scc.len() > 1
                || scc
                    .first()
                    .map(|&n| self.graph.find_edge(n, n).is_some())
                    .unwrap_or(false);
            if is_cycle {
                cycles.push(self.cycle_path(&scc));
            }
        }
        cycles.sort();
        cycles
    }

    /// Walk one concrete cycle through a strongly connected component,
    /// starting from its smallest identifier
    fn cycle_path(&self, scc: &[NodeIndex]) -> Vec<UnitId> {
        let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
        let Some(&start) = scc.iter().min_by(|a, b| self.graph[**a].cmp(&self.graph[**b])) else {
            return Vec::new();
        };

        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut closing = None;

        while let Some(node) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors(node)
                .filter(|n| members.contains(n))
                .collect();
            next.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

            if next.contains(&start) {
                closing = Some(node);
                break;
            }
            for n in next {
                if n != start && !parent.contains_key(&n) {
                    parent.insert(n, node);
                    queue.push_back(n);
                }
            }
        }

        let mut path = Vec::new();
        let mut cursor = closing.unwrap_or(start);
        path.push(self.graph[cursor].clone());
        while cursor != start {
            match parent.get(&cursor) {
                Some(&p) => {
                    cursor = p;
                    path.push(self.graph[cursor].clone());
                }
                None => break,
            }
        }
        path.reverse();
        path.push(self.graph[start].clone());
        path
    }
}

/// Capability group of a name: the prefix before `.`, `::` or `/`
fn capability_group<'a>(unit: &'a str, capability: &'a str) -> &'a str {
    let cut = [".", "::", "/"]
        .iter()
        .filter_map(|sep| capability.find(sep))
        .min();
    match cut {
        Some(pos) if pos > 0 => &capability[..pos],
        _ => unit,
    }
}

/// Validate a set of units, returning the graph and every violation found.
///
/// The graph is only fit for scheduling when no violation is critical.
pub fn validate(units: Vec<Unit>, config: &OrchestratorConfig) -> (DependencyGraph, Vec<Violation>) {
    let graph = DependencyGraph::build(units);
    let mut violations = Vec::new();

    let cycles = graph.cycles();
    for path in &cycles {
        let remediation = format!(
            "Break the cycle {}: extract the shared part into a new unit or depend on an interface instead",
            path.join(" -> ")
        );
        violations.push(Violation::critical(
            ViolationKind::Cycle { path: path.clone() },
            remediation,
        ));
    }

    // Reachability is meaningless inside cycles, so the remaining checks
    // only run on acyclic graphs
    if cycles.is_empty() {
        check_shared_writes(&graph, &mut violations);
        check_coupling(&graph, config.coupling_threshold, &mut violations);
    }
    check_responsibilities(&graph, config.max_capability_groups, &mut violations);

    for v in &violations {
        match v.severity {
            Severity::Critical => error!(violation = ?v.kind, "Critical violation"),
            Severity::Warning => warn!(violation = ?v.kind, "Validation warning"),
        }
    }
    info!(
        units = graph.len(),
        edges = graph.edge_count(),
        critical = violations.iter().filter(|v| v.is_critical()).count(),
        warnings = violations.iter().filter(|v| !v.is_critical()).count(),
        "Dependency graph validated"
    );

    (graph, violations)
}

fn check_shared_writes(graph: &DependencyGraph, violations: &mut Vec<Violation>) {
    let mut writers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for unit in graph.units() {
        for resource in &unit.resources.writes {
            writers.entry(resource.as_str()).or_default().push(unit.id.as_str());
        }
    }

    for (resource, units) in writers {
        for (i, a) in units.iter().enumerate() {
            for b in &units[i + 1..] {
                if !graph.related(a, b) {
                    violations.push(Violation::critical(
                        ViolationKind::SharedMutableState {
                            resource: resource.to_string(),
                            units: vec![a.to_string(), b.to_string()],
                        },
                        format!(
                            "Give '{}' a single owner: move writes behind one unit's interface or make {} depend on {}",
                            resource, b, a
                        ),
                    ));
                }
            }
        }
    }
}

fn check_coupling(graph: &DependencyGraph, threshold: u32, violations: &mut Vec<Violation>) {
    let mut pairs: BTreeMap<(&str, &str), u32> = BTreeMap::new();
    for unit in graph.units() {
        for (target, count) in &unit.references {
            if target == &unit.id {
                continue;
            }
            let key = if unit.id.as_str() < target.as_str() {
                (unit.id.as_str(), target.as_str())
            } else {
                (target.as_str(), unit.id.as_str())
            };
            *pairs.entry(key).or_default() += count;
        }
    }

    for ((a, b), references) in pairs {
        if references > threshold && !graph.related(a, b) {
            violations.push(Violation::warning(
                ViolationKind::TightCoupling {
                    units: vec![a.to_string(), b.to_string()],
                    references,
                    threshold,
                },
                format!(
                    "Inject an interface between {} and {} or declare the dependency explicitly",
                    a, b
                ),
            ));
        }
    }
}

fn check_responsibilities(graph: &DependencyGraph, max_groups: usize, violations: &mut Vec<Violation>) {
    for unit in graph.units() {
        let groups: BTreeSet<&str> = unit
            .capabilities
            .iter()
            .map(|cap| capability_group(&unit.id, cap))
            .collect();
        if groups.len() > max_groups {
            violations.push(Violation::warning(
                ViolationKind::MultipleResponsibilities {
                    unit: unit.id.clone(),
                    groups: groups.iter().map(|g| g.to_string()).collect(),
                },
                format!(
                    "Split {} into one unit per capability group ({} found)",
                    unit.id,
                    groups.len()
                ),
            ));
        }
    }
}
