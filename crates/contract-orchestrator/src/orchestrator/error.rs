//! Error types for orchestrator operations.
//!
//! These never cross the `run` boundary: unit-level failures are absorbed by
//! the executor and orchestration-level failures are turned into a degraded
//! or failed `WorkflowResult`. They do surface from construction
//! (configuration errors) and from internal helpers.

use crate::agent::{AgentError, UnitKind};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A unit agent failed.
    #[error("Agent error: {0}")]
    AgentError(#[from] AgentError),

    /// The declared unit dependencies contain a cycle.
    #[error("Dependency cycle detected among units: {}", format_units(.0))]
    DependencyCycle(Vec<UnitKind>),

    /// A unit depends on a unit that is not declared.
    #[error("Unit {unit} depends on undeclared unit {dependency}")]
    UnknownDependency { unit: UnitKind, dependency: UnitKind },

    /// A unit is declared more than once or depends on itself.
    #[error("Invalid unit declaration: {0}")]
    InvalidUnit(String),

    /// No unit could be initialized at startup.
    #[error("No usable units at startup: {0}")]
    NoHealthyUnits(String),

    /// A configuration value could not be parsed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A unit invocation exceeded its timeout.
    #[error("Unit {unit} timed out after {timeout:?}")]
    UnitTimeout { unit: UnitKind, timeout: Duration },

    /// The whole run exceeded its time budget.
    #[error("Workflow exceeded its execution budget of {0:?}")]
    RunTimeout(Duration),

    /// The run was cancelled.
    #[error("Workflow run was cancelled")]
    Cancelled,

    /// An unexpected state during stage execution.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// JSON error while building outputs.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Returns true for errors raised while validating configuration.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::DependencyCycle(_)
                | OrchestratorError::UnknownDependency { .. }
                | OrchestratorError::InvalidUnit(_)
                | OrchestratorError::NoHealthyUnits(_)
                | OrchestratorError::InvalidConfig(_)
        )
    }
}

fn format_units(units: &[UnitKind]) -> String {
    units
        .iter()
        .map(UnitKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_units() {
        let err =
            OrchestratorError::DependencyCycle(vec![UnitKind::Analyzer, UnitKind::Communicator]);
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected among units: analyzer, communicator"
        );
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_runtime_errors_are_not_configuration_errors() {
        assert!(!OrchestratorError::Cancelled.is_configuration_error());
        assert!(!OrchestratorError::RunTimeout(Duration::from_secs(1)).is_configuration_error());
    }
}
