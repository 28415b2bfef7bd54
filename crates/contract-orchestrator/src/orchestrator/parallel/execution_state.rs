//! Execution state of a workflow run.
//!
//! A [`WorkflowRun`] moves `Initialized -> Running -> {Completed | Failed |
//! Degraded | Cancelled}`. Once a terminal status is reached the run is
//! frozen: every mutator becomes a no-op and reports `false`.

use crate::agent::{UnitKind, UnitOutput};
use crate::orchestrator::config::ExecutionMode;
use crate::orchestrator::journal::RecoveryAction;
use crate::orchestrator::parallel::ResourceUtilization;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    Running,
    Completed,
    Failed,
    Degraded,
    Cancelled,
}

impl RunStatus {
    /// Returns true for statuses that can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Degraded | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Initialized => "initialized",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Degraded => "degraded",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy a run actually used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Every stage split into parallel groups.
    FullParallel,
    /// Healthy units run in parallel groups, the rest one at a time.
    Selective,
    /// One unit at a time in stage order.
    Sequential,
    /// One unit at a time, and units that are not healthy go straight to fallback.
    FallbackFirst,
}

/// Classification of one unit invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// The unit ran and reported success.
    Completed,
    /// The unit was skipped for fallback, or reported `success: false`.
    Degraded,
    /// The unit errored or timed out; its output came from fallback.
    Failed,
}

/// Result of executing one unit, including the output downstream units see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit: UnitKind,
    pub status: UnitStatus,
    pub output: UnitOutput,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl UnitOutcome {
    pub fn new(unit: UnitKind, status: UnitStatus, output: UnitOutput) -> Self {
        Self {
            unit,
            status,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn used_fallback(&self) -> bool {
        self.output.fallback_used
    }
}

/// State of one top-level invocation, retained for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub filename: String,
    pub status: RunStatus,
    pub execution_mode: ExecutionMode,
    pub strategy: Option<ExecutionStrategy>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub completed_units: Vec<UnitKind>,
    pub failed_units: Vec<UnitKind>,
    pub degraded_units: Vec<UnitKind>,
    pub running_units: Vec<UnitKind>,
    pub execution_stages: Vec<Vec<UnitKind>>,
    pub recovery_actions: Vec<RecoveryAction>,
    pub resource_utilization: Option<ResourceUtilization>,
}

impl WorkflowRun {
    pub fn new(id: Uuid, filename: impl Into<String>, execution_mode: ExecutionMode) -> Self {
        Self {
            id,
            filename: filename.into(),
            status: RunStatus::Initialized,
            execution_mode,
            strategy: None,
            start_time: Utc::now(),
            end_time: None,
            completed_units: Vec::new(),
            failed_units: Vec::new(),
            degraded_units: Vec::new(),
            running_units: Vec::new(),
            execution_stages: Vec::new(),
            recovery_actions: Vec::new(),
            resource_utilization: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the run to `Running` with the chosen plan.
    pub fn start(&mut self, strategy: ExecutionStrategy, stages: Vec<Vec<UnitKind>>) -> bool {
        if self.status != RunStatus::Initialized {
            return false;
        }
        self.status = RunStatus::Running;
        self.strategy = Some(strategy);
        self.execution_stages = stages;
        true
    }

    /// Marks a unit as in flight.
    pub fn unit_started(&mut self, unit: UnitKind) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.remove_unit(unit);
        self.running_units.push(unit);
        true
    }

    /// Records a unit's classification, keeping the unit lists disjoint.
    pub fn unit_finished(&mut self, unit: UnitKind, status: UnitStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.remove_unit(unit);
        match status {
            UnitStatus::Completed => self.completed_units.push(unit),
            UnitStatus::Degraded => self.degraded_units.push(unit),
            UnitStatus::Failed => self.failed_units.push(unit),
        }
        true
    }

    /// Appends an audit entry.
    pub fn record_recovery(&mut self, action: RecoveryAction) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.recovery_actions.push(action);
        true
    }

    pub fn set_resource_utilization(&mut self, utilization: ResourceUtilization) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.resource_utilization = Some(utilization);
        true
    }

    /// Moves the run to a terminal status. Only the first call has effect.
    pub fn finish(&mut self, status: RunStatus) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.running_units.clear();
        self.status = status;
        self.end_time = Some(Utc::now());
        true
    }

    /// Wall-clock duration so far, or in total once finished.
    pub fn elapsed(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }

    /// Status of a unit within this run, if it has finished.
    pub fn unit_status(&self, unit: UnitKind) -> Option<UnitStatus> {
        if self.completed_units.contains(&unit) {
            Some(UnitStatus::Completed)
        } else if self.degraded_units.contains(&unit) {
            Some(UnitStatus::Degraded)
        } else if self.failed_units.contains(&unit) {
            Some(UnitStatus::Failed)
        } else {
            None
        }
    }

    fn remove_unit(&mut self, unit: UnitKind) {
        for list in [
            &mut self.completed_units,
            &mut self.failed_units,
            &mut self.degraded_units,
            &mut self.running_units,
        ] {
            list.retain(|u| *u != unit);
        }
    }
}
