use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use tracing::{debug, info};

use crate::core::errors::Result;
use crate::graph::DependencyGraph;
use crate::model::UnitId;

/// One wavefront of units that can build together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// 1-based position in the plan
    pub number: usize,
    /// Units in dispatch order: priority descending, then identifier
    pub units: Vec<UnitId>,
}

/// A dependency edge as drawn in the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedEdge {
    pub consumer: UnitId,
    pub provider: UnitId,
    /// Provider is not guaranteed to have passed when the consumer builds
    pub via_stub: bool,
}

/// Ordered phases covering every unit exactly once
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlan {
    phases: Vec<Phase>,
    edges: Vec<PlannedEdge>,
}

impl PhasePlan {
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase(&self, number: usize) -> Option<&Phase> {
        number.checked_sub(1).and_then(|i| self.phases.get(i))
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Phase number a unit was placed in
    pub fn phase_of(&self, unit: &str) -> Option<usize> {
        self.phases
            .iter()
            .find(|p| p.units.iter().any(|u| u == unit))
            .map(|p| p.number)
    }

    pub fn edges(&self) -> &[PlannedEdge] {
        &self.edges
    }

    /// (consumer, provider) pairs expected to build against a stub
    pub fn stubbed_dependencies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges
            .iter()
            .filter(|e| e.via_stub)
            .map(|e| (e.consumer.as_str(), e.provider.as_str()))
    }

    /// Render the plan as a Graphviz digraph, one cluster per phase.
    /// Edges point from provider to consumer; stub-satisfied edges are dashed.
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph BuildPlan {\n");
        dot.push_str("  graph [rankdir=LR, nodesep=0.5, ranksep=1.0];\n");
        dot.push_str("  node [shape=box, style=rounded, fontname=\"Helvetica\"];\n");
        dot.push_str("  edge [fontsize=10, color=gray];\n\n");

        for phase in &self.phases {
            let _ = writeln!(dot, "  subgraph cluster_phase_{} {{", phase.number);
            let _ = writeln!(dot, "    label=\"Phase {}\";", phase.number);
            dot.push_str("    style=dashed;\n");
            for unit in &phase.units {
                let _ = writeln!(dot, "    \"{}\";", escape(unit));
            }
            dot.push_str("  }\n\n");
        }

        for edge in &self.edges {
            let style = if edge.via_stub {
                " [style=dashed, label=\"stub\"]"
            } else {
                ""
            };
            let _ = writeln!(
                dot,
                "  \"{}\" -> \"{}\"{};",
                escape(&edge.provider),
                escape(&edge.consumer),
                style
            );
        }

        dot.push_str("}\n");
        dot
    }
}

fn escape(id: &str) -> String {
    id.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Layer the graph into phases.
///
/// A unit's phase is one past the latest phase of its hard dependencies;
/// stub-eligible dependencies never delay it. The graph must be acyclic.
pub fn plan(graph: &DependencyGraph) -> Result<PhasePlan> {
    let order = graph.provider_order()?;

    let mut levels: HashMap<&str, usize> = HashMap::with_capacity(order.len());
    for unit in &order {
        let level = unit
            .hard_dependencies()
            .filter_map(|dep| levels.get(dep.id.as_str()))
            .max()
            .map_or(1, |deepest| deepest + 1);
        levels.insert(unit.id.as_str(), level);
    }

    let mut layers: BTreeMap<usize, Vec<(i32, &str)>> = BTreeMap::new();
    for unit in &order {
        layers
            .entry(levels[unit.id.as_str()])
            .or_default()
            .push((unit.priority, unit.id.as_str()));
    }

    let phases: Vec<Phase> = layers
        .into_values()
        .enumerate()
        .map(|(i, mut members)| {
            members.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
            Phase {
                number: i + 1,
                units: members.into_iter().map(|(_, id)| id.to_string()).collect(),
            }
        })
        .collect();

    let mut edges = Vec::new();
    for unit in graph.units() {
        let own = levels[unit.id.as_str()];
        for dep in &unit.dependencies {
            let via_stub = dep.stub_eligible && levels[dep.id.as_str()] >= own;
            edges.push(PlannedEdge {
                consumer: unit.id.clone(),
                provider: dep.id.clone(),
                via_stub,
            });
        }
    }

    for phase in &phases {
        debug!(phase = phase.number, units = ?phase.units, "Planned phase");
    }
    info!(
        phases = phases.len(),
        units = graph.len(),
        stubbed = edges.iter().filter(|e| e.via_stub).count(),
        "Phase plan computed"
    );

    Ok(PhasePlan { phases, edges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildPlan, DependencyDecl, UnitDeclaration};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn graph(decls: Vec<UnitDeclaration>) -> DependencyGraph {
        DependencyGraph::build(BuildPlan::new(decls).into_units().unwrap())
    }

    fn ids(phase: &Phase) -> Vec<&str> {
        phase.units.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_hard_dependencies_wait() {
        let plan = plan(&graph(vec![
            UnitDeclaration::new("C").depends_on("A").depends_on("B"),
            UnitDeclaration::new("A"),
            UnitDeclaration::new("B"),
        ]))
        .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(ids(&plan.phases()[0]), vec!["A", "B"]);
        assert_eq!(ids(&plan.phases()[1]), vec!["C"]);
        assert_eq!(plan.phase_of("C"), Some(2));
        assert_eq!(plan.stubbed_dependencies().count(), 0);
    }

    #[test]
    fn test_stub_eligible_dependency_runs_alongside() {
        let plan = plan(&graph(vec![
            UnitDeclaration::new("D").depends_on("E").stub_eligible(true),
            UnitDeclaration::new("E"),
        ]))
        .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(ids(&plan.phases()[0]), vec!["D", "E"]);
        assert_eq!(plan.stubbed_dependencies().collect::<Vec<_>>(), vec![("D", "E")]);
    }

    #[test]
    fn test_priority_then_identifier() {
        let plan = plan(&graph(vec![
            UnitDeclaration::new("b"),
            UnitDeclaration::new("a"),
            UnitDeclaration::new("z").priority(10),
            UnitDeclaration::new("c").priority(-1),
        ]))
        .unwrap();
        assert_eq!(ids(&plan.phases()[0]), vec!["z", "a", "b", "c"]);
    }

    #[test]
    fn test_mixed_dependency_kinds() {
        let mut api = UnitDeclaration::new("api").depends_on("db");
        api.dependencies.push(DependencyDecl::Detailed {
            id: "auth".into(),
            stub_eligible: true,
        });
        let plan = plan(&graph(vec![
            api,
            UnitDeclaration::new("db"),
            UnitDeclaration::new("auth").depends_on("db"),
            UnitDeclaration::new("web").depends_on("api"),
        ]))
        .unwrap();

        // api waits for db but not for auth, which lands in the same phase
        assert_eq!(ids(&plan.phases()[0]), vec!["db"]);
        assert_eq!(ids(&plan.phases()[1]), vec!["api", "auth"]);
        assert_eq!(ids(&plan.phases()[2]), vec!["web"]);
    }

    #[test]
    fn test_union_covers_every_unit_once() {
        let mut decls = Vec::new();
        for i in 0..30 {
            let mut decl = UnitDeclaration::new(format!("u{:02}", i));
            if i >= 3 {
                decl = decl.depends_on(format!("u{:02}", i / 3));
            }
            if i % 4 == 0 && i > 0 {
                decl = decl.depends_on(format!("u{:02}", i - 1));
            }
            decls.push(decl);
        }
        let graph = graph(decls);
        let plan = plan(&graph).unwrap();

        let mut seen = BTreeSet::new();
        for phase in plan.phases() {
            for unit in &phase.units {
                assert!(seen.insert(unit.clone()), "{unit} planned twice");
            }
        }
        assert_eq!(seen.len(), 30);

        for unit in graph.units() {
            let own = plan.phase_of(&unit.id).unwrap();
            for dep in unit.hard_dependencies() {
                assert!(plan.phase_of(&dep.id).unwrap() < own);
            }
        }
    }

    #[test]
    fn test_cyclic_graph_cannot_be_planned() {
        let graph = graph(vec![
            UnitDeclaration::new("F").depends_on("G"),
            UnitDeclaration::new("G").depends_on("F"),
        ]);
        assert!(plan(&graph).is_err());
    }

    #[test]
    fn test_dot_export() {
        let plan = plan(&graph(vec![
            UnitDeclaration::new("D").depends_on("E").stub_eligible(true),
            UnitDeclaration::new("E"),
            UnitDeclaration::new("F").depends_on("E"),
        ]))
        .unwrap();
        let dot = plan.to_dot();
        assert!(dot.starts_with("digraph BuildPlan {"));
        assert!(dot.contains("subgraph cluster_phase_2"));
        assert!(dot.contains("\"E\" -> \"D\" [style=dashed, label=\"stub\"];"));
        assert!(dot.contains("\"E\" -> \"F\";"));
    }
}
