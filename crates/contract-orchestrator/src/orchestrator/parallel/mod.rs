//! Scheduling primitives for staged, resource-gated execution.
//!
//! The dependency graph turns the unit declarations into topological stages
//! and parallel groups, the resource ledger gates each group against the
//! shared budget, and the execution state tracks a run as it moves through
//! those stages.

pub mod dependency_graph;
pub mod execution_state;
pub mod resource_ledger;

pub use dependency_graph::{DependencyGraph, UnitSpec, default_unit_specs};
pub use execution_state::{ExecutionStrategy, RunStatus, UnitOutcome, UnitStatus, WorkflowRun};
pub use resource_ledger::{
    GrantKey, ResourceGrant, ResourceLedger, ResourceLimits, ResourceRequirements,
    ResourceUsage, ResourceUtilization, UsageRecord,
};
