//! Property tests for stage ordering and resource accounting.

use contract_orchestrator::agent::UnitKind;
use contract_orchestrator::orchestrator::{
    DependencyGraph, GrantKey, ResourceLedger, ResourceLimits, ResourceRequirements, UnitSpec,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

const EPSILON: f64 = 1e-9;

/// A random acyclic configuration: a unit order plus, for each unit, a
/// bitmask of dependencies among the units before it.
fn acyclic_specs() -> impl Strategy<Value = Vec<UnitSpec>> {
    (
        Just(UnitKind::ALL.to_vec()).prop_shuffle(),
        prop::collection::vec(any::<u8>(), 5),
        prop::collection::vec(-5i32..15, 5),
    )
        .prop_map(|(order, masks, priorities)| {
            order
                .iter()
                .enumerate()
                .map(|(index, unit)| {
                    let dependencies = (0..index)
                        .filter(|earlier| masks[index] & (1 << earlier) != 0)
                        .map(|earlier| order[earlier]);
                    UnitSpec::new(*unit)
                        .depends_on(dependencies)
                        .with_priority(priorities[index])
                })
                .collect()
        })
}

fn requirements() -> impl Strategy<Value = ResourceRequirements> {
    (0u64..1_024, 0.0f64..40.0, 0u64..20_000, 0.0f64..1.0)
        .prop_map(|(memory, cpu, tokens, cost)| {
            ResourceRequirements::new(memory, cpu, tokens, cost)
        })
}

fn limits() -> impl Strategy<Value = ResourceLimits> {
    (1usize..6, 256u64..4_096, 20.0f64..100.0, 5_000u64..60_000, 0.5f64..3.0).prop_map(
        |(agents, memory, cpu, tokens, cost)| ResourceLimits {
            max_concurrent_agents: agents,
            max_memory_mb: memory,
            max_cpu_percent: cpu,
            max_tokens_per_minute: tokens,
            max_cost_per_minute: cost,
        },
    )
}

#[derive(Debug, Clone)]
enum LedgerOp {
    Allocate(usize),
    Release(usize),
}

fn ledger_ops() -> impl Strategy<Value = Vec<LedgerOp>> {
    prop::collection::vec(
        prop_oneof![
            (0usize..5).prop_map(LedgerOp::Allocate),
            (0usize..5).prop_map(LedgerOp::Release),
        ],
        1..60,
    )
}

fn assert_within(ledger: &ResourceLedger, limits: &ResourceLimits) {
    let usage = ledger.current_usage();
    assert!(usage.concurrent_agents <= limits.max_concurrent_agents);
    assert!(usage.memory_mb <= limits.max_memory_mb);
    assert!(usage.cpu_percent <= limits.max_cpu_percent + EPSILON);
    assert!(usage.tokens_per_minute <= limits.max_tokens_per_minute);
    assert!(usage.cost_per_minute <= limits.max_cost_per_minute + EPSILON);
    assert!(usage.cpu_percent >= -EPSILON);
    assert!(usage.cost_per_minute >= -EPSILON);
}

proptest! {
    #[test]
    fn prop_dependencies_precede_dependents(specs in acyclic_specs()) {
        let graph = DependencyGraph::new(specs.clone()).unwrap();
        let stages = graph.get_execution_order();

        let mut seen = HashSet::new();
        for stage in stages {
            prop_assert!(!stage.is_empty());
            for unit in stage {
                for dependency in graph.get_dependencies(*unit) {
                    prop_assert!(
                        seen.contains(&dependency),
                        "{} scheduled before its dependency {}", unit, dependency
                    );
                }
            }
            for unit in stage {
                prop_assert!(seen.insert(*unit), "{} scheduled twice", unit);
            }
        }
        prop_assert_eq!(seen.len(), specs.len());
    }

    #[test]
    fn prop_stages_are_sorted_by_priority(specs in acyclic_specs()) {
        let graph = DependencyGraph::new(specs).unwrap();
        for stage in graph.get_execution_order() {
            let priorities: Vec<i32> = stage
                .iter()
                .map(|unit| graph.spec(*unit).unwrap().priority)
                .collect();
            prop_assert!(priorities.windows(2).all(|pair| pair[0] >= pair[1]));
        }
    }

    #[test]
    fn prop_parallel_groups_partition_the_stage(specs in acyclic_specs(), max in 1usize..6) {
        let graph = DependencyGraph::new(specs).unwrap();
        for stage in graph.get_execution_order() {
            let groups = graph.get_parallel_groups(stage, max);
            let flattened: Vec<UnitKind> = groups.iter().flatten().copied().collect();
            prop_assert_eq!(flattened.len(), stage.len());
            for group in &groups {
                prop_assert!(!group.is_empty() && group.len() <= max);
            }
        }
    }

    #[test]
    fn prop_ledger_never_exceeds_limits(
        limits in limits(),
        unit_requirements in prop::collection::vec(requirements(), 5),
        ops in ledger_ops(),
    ) {
        let ledger = ResourceLedger::new(limits);
        let run_id = Uuid::new_v4();

        for op in ops {
            match op {
                LedgerOp::Allocate(index) => {
                    let key = GrantKey::new(run_id, UnitKind::ALL[index]);
                    let fits = ledger.can_allocate(&unit_requirements[index]);
                    let granted = ledger.allocate(key, unit_requirements[index]);
                    prop_assert!(!granted || fits);
                }
                LedgerOp::Release(index) => {
                    ledger.release(GrantKey::new(run_id, UnitKind::ALL[index]));
                }
            }
            assert_within(&ledger, &limits);
        }

        for unit in UnitKind::ALL {
            ledger.release(GrantKey::new(run_id, unit));
            ledger.release(GrantKey::new(run_id, unit));
        }
        let usage = ledger.current_usage();
        prop_assert_eq!(usage.concurrent_agents, 0);
        prop_assert_eq!(usage.memory_mb, 0);
        prop_assert_eq!(usage.tokens_per_minute, 0);
        prop_assert!(usage.cpu_percent.abs() < 1e-6);
        prop_assert!(usage.cost_per_minute.abs() < 1e-6);
    }
}

#[test]
fn test_ledger_limits_hold_under_parallel_groups() {
    let limits = ResourceLimits {
        max_concurrent_agents: 2,
        ..ResourceLimits::default()
    };
    let ledger = Arc::new(ResourceLedger::new(limits));
    let requirement = ResourceRequirements::new(384, 20.0, 6_000, 0.3);

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                let run_id = Uuid::new_v4();
                for _ in 0..200 {
                    for unit in [UnitKind::RiskAssessor, UnitKind::PrecedentResearcher] {
                        let key = GrantKey::new(run_id, unit);
                        if ledger.allocate(key, requirement) {
                            assert!(ledger.current_usage().concurrent_agents <= 2);
                            ledger.release(key);
                            ledger.release(key);
                        }
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(ledger.current_usage().concurrent_agents, 0);
    assert_eq!(ledger.current_usage().memory_mb, 0);
}
