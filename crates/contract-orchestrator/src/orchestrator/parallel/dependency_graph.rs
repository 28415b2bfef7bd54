//! Static dependency declaration of the pipeline units.
//!
//! The graph is validated and staged once at construction: a declaration
//! with a cycle or an undeclared dependency never produces a graph, so
//! stage computation cannot fail mid-run.

use super::resource_ledger::ResourceRequirements;
use crate::agent::UnitKind;
use crate::orchestrator::error::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// Static configuration of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub unit: UnitKind,
    /// Units whose output this unit consumes.
    pub depends_on: BTreeSet<UnitKind>,
    /// Explicit parallel-compatibility allowlist.
    pub parallel_with: BTreeSet<UnitKind>,
    /// Higher runs first within a stage.
    pub priority: i32,
    pub requirements: ResourceRequirements,
}

impl UnitSpec {
    /// Creates a spec with no dependencies, priority 0 and zero requirements.
    pub fn new(unit: UnitKind) -> Self {
        Self {
            unit,
            depends_on: BTreeSet::new(),
            parallel_with: BTreeSet::new(),
            priority: 0,
            requirements: ResourceRequirements::default(),
        }
    }

    pub fn depends_on(mut self, units: impl IntoIterator<Item = UnitKind>) -> Self {
        self.depends_on.extend(units);
        self
    }

    pub fn parallel_with(mut self, units: impl IntoIterator<Item = UnitKind>) -> Self {
        self.parallel_with.extend(units);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// The contract pipeline: analyze → {risk, precedent} → negotiate → communicate.
pub fn default_unit_specs() -> Vec<UnitSpec> {
    use UnitKind::*;

    vec![
        UnitSpec::new(Analyzer)
            .with_priority(10)
            .with_requirements(ResourceRequirements::new(512, 25.0, 8_000, 0.40)),
        UnitSpec::new(RiskAssessor)
            .depends_on([Analyzer])
            .parallel_with([PrecedentResearcher])
            .with_priority(8)
            .with_requirements(ResourceRequirements::new(384, 20.0, 6_000, 0.30)),
        UnitSpec::new(PrecedentResearcher)
            .depends_on([Analyzer])
            .parallel_with([RiskAssessor])
            .with_priority(6)
            .with_requirements(ResourceRequirements::new(384, 15.0, 6_000, 0.30)),
        UnitSpec::new(Negotiator)
            .depends_on([Analyzer, RiskAssessor, PrecedentResearcher])
            .with_priority(4)
            .with_requirements(ResourceRequirements::new(256, 15.0, 5_000, 0.25)),
        UnitSpec::new(Communicator)
            .depends_on([Analyzer, RiskAssessor, Negotiator])
            .with_priority(2)
            .with_requirements(ResourceRequirements::new(256, 10.0, 3_000, 0.15)),
    ]
}

/// Validated unit dependency graph with precomputed execution stages.
///
/// # Examples
///
/// ```ignore
/// use contract_orchestrator::orchestrator::parallel::{DependencyGraph, default_unit_specs};
///
/// let graph = DependencyGraph::new(default_unit_specs())?;
/// assert_eq!(graph.get_execution_order().len(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    specs: BTreeMap<UnitKind, UnitSpec>,
    /// Reverse edges: unit -> units that depend on it
    reverse_edges: BTreeMap<UnitKind, BTreeSet<UnitKind>>,
    stages: Vec<Vec<UnitKind>>,
}

impl DependencyGraph {
    /// Validates `specs` and computes the execution stages.
    ///
    /// Fails on duplicate units, self-dependencies, dependencies on
    /// undeclared units and cycles.
    pub fn new(specs: Vec<UnitSpec>) -> Result<Self, OrchestratorError> {
        let mut by_unit = BTreeMap::new();
        for spec in specs {
            if spec.depends_on.contains(&spec.unit) {
                return Err(OrchestratorError::InvalidUnit(format!(
                    "{} depends on itself",
                    spec.unit
                )));
            }
            let unit = spec.unit;
            if by_unit.insert(unit, spec).is_some() {
                return Err(OrchestratorError::InvalidUnit(format!(
                    "{unit} is declared more than once"
                )));
            }
        }

        let mut reverse_edges: BTreeMap<UnitKind, BTreeSet<UnitKind>> =
            by_unit.keys().map(|unit| (*unit, BTreeSet::new())).collect();
        for spec in by_unit.values() {
            for dependency in &spec.depends_on {
                reverse_edges
                    .get_mut(dependency)
                    .ok_or(OrchestratorError::UnknownDependency {
                        unit: spec.unit,
                        dependency: *dependency,
                    })?
                    .insert(spec.unit);
            }
        }

        let stages = Self::topological_stages(&by_unit, &reverse_edges)?;

        Ok(Self {
            specs: by_unit,
            reverse_edges,
            stages,
        })
    }

    /// Kahn's algorithm, one stage per wave of zero in-degree units.
    fn topological_stages(
        specs: &BTreeMap<UnitKind, UnitSpec>,
        reverse_edges: &BTreeMap<UnitKind, BTreeSet<UnitKind>>,
    ) -> Result<Vec<Vec<UnitKind>>, OrchestratorError> {
        let mut in_degree: BTreeMap<UnitKind, usize> = specs
            .iter()
            .map(|(unit, spec)| (*unit, spec.depends_on.len()))
            .collect();
        let mut stages = Vec::new();
        let mut placed = 0usize;

        loop {
            let mut stage: Vec<UnitKind> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(unit, _)| *unit)
                .collect();
            if stage.is_empty() {
                break;
            }

            // Stable: equal priorities keep canonical order.
            stage.sort_by_key(|unit| Reverse(specs[unit].priority));

            for unit in &stage {
                in_degree.remove(unit);
                for dependent in &reverse_edges[unit] {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                    }
                }
            }
            placed += stage.len();
            stages.push(stage);
        }

        if placed < specs.len() {
            return Err(OrchestratorError::DependencyCycle(
                in_degree.keys().copied().collect(),
            ));
        }
        Ok(stages)
    }

    /// The execution stages, each sorted by descending priority.
    pub fn get_execution_order(&self) -> &[Vec<UnitKind>] {
        &self.stages
    }

    /// Index of the stage containing `unit`.
    pub fn stage_index(&self, unit: UnitKind) -> Option<usize> {
        self.stages.iter().position(|stage| stage.contains(&unit))
    }

    /// Declared units in canonical order.
    pub fn units(&self) -> impl Iterator<Item = UnitKind> + '_ {
        self.specs.keys().copied()
    }

    /// Number of declared units.
    pub fn node_count(&self) -> usize {
        self.specs.len()
    }

    /// The static spec of `unit`.
    pub fn spec(&self, unit: UnitKind) -> Option<&UnitSpec> {
        self.specs.get(&unit)
    }

    /// Units `unit` directly depends on.
    pub fn get_dependencies(&self, unit: UnitKind) -> BTreeSet<UnitKind> {
        self.specs
            .get(&unit)
            .map(|spec| spec.depends_on.clone())
            .unwrap_or_default()
    }

    /// Units directly depending on `unit`.
    pub fn get_dependents(&self, unit: UnitKind) -> BTreeSet<UnitKind> {
        self.reverse_edges.get(&unit).cloned().unwrap_or_default()
    }

    /// Returns true if `unit` depends on `other` directly or transitively.
    pub fn depends_on(&self, unit: UnitKind, other: UnitKind) -> bool {
        let mut stack: Vec<UnitKind> = self.get_dependencies(unit).into_iter().collect();
        let mut seen = BTreeSet::new();
        while let Some(next) = stack.pop() {
            if next == other {
                return true;
            }
            if seen.insert(next) {
                stack.extend(self.get_dependencies(next));
            }
        }
        false
    }

    /// Returns true if `a` and `b` may execute concurrently.
    ///
    /// An explicit `parallel_with` entry on either side is sufficient;
    /// otherwise the two must not depend on each other.
    pub fn can_run_parallel(&self, a: UnitKind, b: UnitKind) -> bool {
        if a == b {
            return false;
        }
        let explicit = self
            .specs
            .get(&a)
            .is_some_and(|spec| spec.parallel_with.contains(&b))
            || self
                .specs
                .get(&b)
                .is_some_and(|spec| spec.parallel_with.contains(&a));

        explicit || (!self.depends_on(a, b) && !self.depends_on(b, a))
    }

    /// Greedily packs `stage_units` into groups of mutually parallel units.
    ///
    /// Groups hold at most `max_parallel` units (at least one) and keep the
    /// input order of their members.
    pub fn get_parallel_groups(
        &self,
        stage_units: &[UnitKind],
        max_parallel: usize,
    ) -> Vec<Vec<UnitKind>> {
        self.get_parallel_groups_with(stage_units, max_parallel, |_, _| true)
    }

    /// Like [`get_parallel_groups`](Self::get_parallel_groups) with an extra
    /// admission check, e.g. whether the group's combined resource
    /// requirements still fit the budget.
    pub fn get_parallel_groups_with<F>(
        &self,
        stage_units: &[UnitKind],
        max_parallel: usize,
        admits: F,
    ) -> Vec<Vec<UnitKind>>
    where
        F: Fn(&[UnitKind], UnitKind) -> bool,
    {
        let max_parallel = max_parallel.max(1);
        let mut remaining: Vec<UnitKind> = stage_units.to_vec();
        let mut groups = Vec::new();

        while !remaining.is_empty() {
            let mut group = vec![remaining.remove(0)];
            let mut index = 0;
            while index < remaining.len() && group.len() < max_parallel {
                let candidate = remaining[index];
                let compatible = group
                    .iter()
                    .all(|member| self.can_run_parallel(*member, candidate));
                if compatible && admits(&group, candidate) {
                    group.push(remaining.remove(index));
                } else {
                    index += 1;
                }
            }
            groups.push(group);
        }

        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UnitKind::*;

    fn default_graph() -> DependencyGraph {
        DependencyGraph::new(default_unit_specs()).unwrap()
    }

    #[test]
    fn test_default_pipeline_stages() {
        let graph = default_graph();
        assert_eq!(
            graph.get_execution_order(),
            &[
                vec![Analyzer],
                vec![RiskAssessor, PrecedentResearcher],
                vec![Negotiator],
                vec![Communicator],
            ]
        );
        assert_eq!(graph.node_count(), 5);
    }

    #[test]
    fn test_priority_orders_units_within_stage() {
        let specs = vec![
            UnitSpec::new(Analyzer).with_priority(1),
            UnitSpec::new(RiskAssessor).with_priority(5),
            UnitSpec::new(PrecedentResearcher).with_priority(5),
        ];
        let graph = DependencyGraph::new(specs).unwrap();

        assert_eq!(
            graph.get_execution_order(),
            &[vec![RiskAssessor, PrecedentResearcher, Analyzer]]
        );
    }

    #[test]
    fn test_cycle_is_rejected_at_construction() {
        let specs = vec![
            UnitSpec::new(Analyzer).depends_on([Communicator]),
            UnitSpec::new(RiskAssessor).depends_on([Analyzer]),
            UnitSpec::new(Communicator).depends_on([RiskAssessor]),
            UnitSpec::new(Negotiator),
        ];

        match DependencyGraph::new(specs) {
            Err(OrchestratorError::DependencyCycle(units)) => {
                assert_eq!(units, vec![Analyzer, RiskAssessor, Communicator]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_undeclared_dependency_is_rejected() {
        let specs = vec![UnitSpec::new(Negotiator).depends_on([RiskAssessor])];
        assert!(matches!(
            DependencyGraph::new(specs),
            Err(OrchestratorError::UnknownDependency {
                unit: Negotiator,
                dependency: RiskAssessor
            })
        ));
    }

    #[test]
    fn test_self_and_duplicate_declarations_are_rejected() {
        let self_dep = vec![UnitSpec::new(Analyzer).depends_on([Analyzer])];
        assert!(matches!(
            DependencyGraph::new(self_dep),
            Err(OrchestratorError::InvalidUnit(_))
        ));

        let duplicate = vec![UnitSpec::new(Analyzer), UnitSpec::new(Analyzer)];
        assert!(matches!(
            DependencyGraph::new(duplicate),
            Err(OrchestratorError::InvalidUnit(_))
        ));
    }

    #[test]
    fn test_can_run_parallel() {
        let graph = default_graph();
        assert!(graph.can_run_parallel(RiskAssessor, PrecedentResearcher));
        assert!(!graph.can_run_parallel(Analyzer, RiskAssessor));
        assert!(!graph.can_run_parallel(Analyzer, Communicator));
        assert!(!graph.can_run_parallel(Negotiator, Negotiator));
    }

    #[test]
    fn test_explicit_allowlist_overrides_dependency() {
        let specs = vec![
            UnitSpec::new(Analyzer),
            UnitSpec::new(RiskAssessor)
                .depends_on([Analyzer])
                .parallel_with([Analyzer]),
        ];
        let graph = DependencyGraph::new(specs).unwrap();
        assert!(graph.can_run_parallel(Analyzer, RiskAssessor));
    }

    #[test]
    fn test_parallel_groups_respect_max_parallel() {
        let graph = default_graph();
        let stage = [RiskAssessor, PrecedentResearcher];

        assert_eq!(
            graph.get_parallel_groups(&stage, 5),
            vec![vec![RiskAssessor, PrecedentResearcher]]
        );
        assert_eq!(
            graph.get_parallel_groups(&stage, 1),
            vec![vec![RiskAssessor], vec![PrecedentResearcher]]
        );
        assert_eq!(
            graph.get_parallel_groups(&stage, 0),
            vec![vec![RiskAssessor], vec![PrecedentResearcher]]
        );
    }

    #[test]
    fn test_parallel_groups_split_dependent_units() {
        let graph = default_graph();
        let groups = graph.get_parallel_groups(&[Analyzer, RiskAssessor, PrecedentResearcher], 3);
        assert_eq!(groups, vec![vec![Analyzer], vec![RiskAssessor, PrecedentResearcher]]);
    }

    #[test]
    fn test_parallel_groups_with_admission_check() {
        let graph = default_graph();
        let groups = graph.get_parallel_groups_with(
            &[RiskAssessor, PrecedentResearcher],
            5,
            |_, candidate| candidate != PrecedentResearcher,
        );
        assert_eq!(groups, vec![vec![RiskAssessor], vec![PrecedentResearcher]]);
    }

    #[test]
    fn test_transitive_dependency() {
        let graph = default_graph();
        assert!(graph.depends_on(Communicator, PrecedentResearcher));
        assert!(!graph.depends_on(PrecedentResearcher, RiskAssessor));
        assert_eq!(graph.stage_index(Communicator), Some(3));
        assert_eq!(graph.get_dependents(Analyzer).len(), 4);
    }
}
