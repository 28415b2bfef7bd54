//! Aggregation of unit outcomes into the result returned to the caller.

use crate::agent::{UnitKind, UnitOutput};
use crate::orchestrator::journal::RecoveryAction;
use crate::orchestrator::parallel::{
    ExecutionStrategy, ResourceUtilization, RunStatus, UnitOutcome, UnitStatus, WorkflowRun,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use uuid::Uuid;

const BASE_QUALITY: f64 = 0.8;
const FALLBACK_DISCOUNT: f64 = 0.6;

/// Outcome of one `run` call.
///
/// Callers tell full success, degradation and failure apart through
/// `status`, `fallback_used` and the unit lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub success: bool,
    pub status: RunStatus,
    pub strategy: Option<ExecutionStrategy>,
    pub outputs: BTreeMap<UnitKind, UnitOutput>,
    pub completed_units: Vec<UnitKind>,
    pub failed_units: Vec<UnitKind>,
    pub degraded_units: Vec<UnitKind>,
    pub execution_stages: Vec<Vec<UnitKind>>,
    pub quality_score: f64,
    pub fallback_used: bool,
    pub recovery_actions: Vec<RecoveryAction>,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    pub resource_utilization: Option<ResourceUtilization>,
}

impl WorkflowResult {
    /// A structured failure carrying whatever is known about the run.
    pub fn failure(run: &WorkflowRun, error: impl Into<String>) -> Self {
        Self {
            run_id: run.id,
            success: false,
            status: RunStatus::Failed,
            strategy: run.strategy,
            outputs: BTreeMap::new(),
            completed_units: run.completed_units.clone(),
            failed_units: run.failed_units.clone(),
            degraded_units: run.degraded_units.clone(),
            execution_stages: run.execution_stages.clone(),
            quality_score: 0.0,
            fallback_used: false,
            recovery_actions: run.recovery_actions.clone(),
            execution_time_ms: elapsed_ms(run),
            error: Some(error.into()),
            resource_utilization: run.resource_utilization.clone(),
        }
    }

    /// Output of `unit`, if it produced one.
    pub fn output(&self, unit: UnitKind) -> Option<&UnitOutput> {
        self.outputs.get(&unit)
    }

    /// Outputs keyed by their result names (`analysis_results`, `risk_results`, ...).
    pub fn results_json(&self) -> Map<String, JsonValue> {
        self.outputs
            .iter()
            .map(|(unit, output)| (unit.output_key().to_string(), output.to_value()))
            .collect()
    }
}

/// Terminal status for a run that reached aggregation.
///
/// `Completed` only if every planned unit completed without fallback.
pub fn overall_status(units: &[UnitKind], outcomes: &BTreeMap<UnitKind, UnitOutcome>) -> RunStatus {
    let all_clean = units.iter().all(|unit| {
        outcomes
            .get(unit)
            .is_some_and(|o| o.status == UnitStatus::Completed && !o.used_fallback())
    });
    if all_clean {
        RunStatus::Completed
    } else {
        RunStatus::Degraded
    }
}

/// Contribution of one unit to the quality score.
///
/// `0.8`, discounted to 60% for fallback output and scaled by the unit's
/// confidence when it reports one. Unsuccessful output scores zero.
pub fn unit_quality(output: Option<&UnitOutput>) -> f64 {
    match output {
        Some(output) if output.success => {
            let discount = if output.fallback_used { FALLBACK_DISCOUNT } else { 1.0 };
            BASE_QUALITY * discount * output.confidence_score.unwrap_or(1.0)
        }
        _ => 0.0,
    }
}

/// Mean unit quality over `units`.
pub fn quality_score(units: &[UnitKind], outputs: &BTreeMap<UnitKind, UnitOutput>) -> f64 {
    if units.is_empty() {
        return 0.0;
    }
    units.iter().map(|unit| unit_quality(outputs.get(unit))).sum::<f64>() / units.len() as f64
}

/// Merges a finished run and its unit outcomes into one result.
pub fn compile_results(
    run: &WorkflowRun,
    outcomes: &BTreeMap<UnitKind, UnitOutcome>,
) -> WorkflowResult {
    let units: Vec<UnitKind> = run.execution_stages.iter().flatten().copied().collect();
    let outputs: BTreeMap<UnitKind, UnitOutput> = outcomes
        .iter()
        .map(|(unit, outcome)| (*unit, outcome.output.clone()))
        .collect();
    let fallback_used = outputs.values().any(|output| output.fallback_used);

    let error = match run.status {
        RunStatus::Cancelled => Some("workflow run was cancelled".to_string()),
        _ => None,
    };

    WorkflowResult {
        run_id: run.id,
        success: matches!(run.status, RunStatus::Completed | RunStatus::Degraded),
        status: run.status,
        strategy: run.strategy,
        quality_score: quality_score(&units, &outputs),
        outputs,
        completed_units: run.completed_units.clone(),
        failed_units: run.failed_units.clone(),
        degraded_units: run.degraded_units.clone(),
        execution_stages: run.execution_stages.clone(),
        fallback_used,
        recovery_actions: run.recovery_actions.clone(),
        execution_time_ms: elapsed_ms(run),
        error,
        resource_utilization: run.resource_utilization.clone(),
    }
}

fn elapsed_ms(run: &WorkflowRun) -> u64 {
    run.elapsed().num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::config::ExecutionMode;

    fn outcome(unit: UnitKind, status: UnitStatus, output: UnitOutput) -> (UnitKind, UnitOutcome) {
        (unit, UnitOutcome::new(unit, status, output))
    }

    #[test]
    fn test_unit_quality() {
        assert_eq!(unit_quality(None), 0.0);
        assert_eq!(unit_quality(Some(&UnitOutput::failure("x"))), 0.0);
        assert!((unit_quality(Some(&UnitOutput::success())) - 0.8).abs() < 1e-9);

        let fallback = UnitOutput::success().with_confidence(0.5).as_fallback();
        assert!((unit_quality(Some(&fallback)) - 0.8 * 0.6 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_quality_score_counts_missing_units_as_zero() {
        let outputs = BTreeMap::from([(UnitKind::Analyzer, UnitOutput::success())]);
        let score = quality_score(&[UnitKind::Analyzer, UnitKind::Negotiator], &outputs);
        assert!((score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_overall_status() {
        let units = [UnitKind::Analyzer, UnitKind::RiskAssessor];
        let clean = BTreeMap::from([
            outcome(UnitKind::Analyzer, UnitStatus::Completed, UnitOutput::success()),
            outcome(UnitKind::RiskAssessor, UnitStatus::Completed, UnitOutput::success()),
        ]);
        assert_eq!(overall_status(&units, &clean), RunStatus::Completed);

        let mut with_fallback = clean.clone();
        with_fallback.insert(
            UnitKind::RiskAssessor,
            UnitOutcome::new(
                UnitKind::RiskAssessor,
                UnitStatus::Failed,
                UnitOutput::success().as_fallback(),
            ),
        );
        assert_eq!(overall_status(&units, &with_fallback), RunStatus::Degraded);

        let missing = BTreeMap::from([outcome(
            UnitKind::Analyzer,
            UnitStatus::Completed,
            UnitOutput::success(),
        )]);
        assert_eq!(overall_status(&units, &missing), RunStatus::Degraded);
    }

    #[test]
    fn test_compile_results_copies_run_state() {
        let mut run = WorkflowRun::new(Uuid::new_v4(), "msa.txt", ExecutionMode::Adaptive);
        run.start(
            ExecutionStrategy::FullParallel,
            vec![vec![UnitKind::Analyzer], vec![UnitKind::RiskAssessor]],
        );
        run.unit_finished(UnitKind::Analyzer, UnitStatus::Completed);
        run.unit_finished(UnitKind::RiskAssessor, UnitStatus::Failed);
        run.finish(RunStatus::Degraded);

        let outcomes = BTreeMap::from([
            outcome(UnitKind::Analyzer, UnitStatus::Completed, UnitOutput::success()),
            outcome(
                UnitKind::RiskAssessor,
                UnitStatus::Failed,
                UnitOutput::success().with_confidence(0.5).as_fallback(),
            ),
        ]);
        let result = compile_results(&run, &outcomes);

        assert!(result.success);
        assert_eq!(result.status, RunStatus::Degraded);
        assert!(result.fallback_used);
        assert_eq!(result.failed_units, vec![UnitKind::RiskAssessor]);
        assert!((result.quality_score - (0.8 + 0.24) / 2.0).abs() < 1e-9);
        assert!(result.results_json().contains_key("risk_results"));
    }

    #[test]
    fn test_failure_result_is_unsuccessful() {
        let run = WorkflowRun::new(Uuid::new_v4(), "msa.txt", ExecutionMode::Sequential);
        let result = WorkflowResult::failure(&run, "degradation failed");
        assert!(!result.success);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("degradation failed"));
    }
}
