use crate::agent::UnitKind;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// What kind of recovery the orchestrator performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// A unit's output was substituted by its fallback rule.
    UnitFallback,
    /// A parallel group proceeded after the resource wait ran out.
    ResourceWaitTimeout,
    /// A group member did not finish before the group deadline.
    GroupTimeout,
    /// The caller's config map was malformed and defaults were used.
    ConfigDefaults,
    /// The whole pipeline failed and the minimal fallback pipeline ran.
    GracefulDegradation,
    /// The run was cancelled and remaining units were filled by fallback.
    Cancellation,
}

/// Audit entry for a fallback or degradation event within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub kind: RecoveryKind,
    pub unit: Option<UnitKind>,
    pub reason: String,
    pub recorded_at_ms: u64,
}

impl RecoveryAction {
    /// Builds an entry stamped with the current time.
    pub fn new(kind: RecoveryKind, unit: Option<UnitKind>, reason: impl Into<String>) -> Self {
        Self::with_timestamp(kind, unit, reason, current_timestamp_ms())
    }

    /// Same as `new` but with explicit timestamp control (useful for deterministic tests).
    pub fn with_timestamp(
        kind: RecoveryKind,
        unit: Option<UnitKind>,
        reason: impl Into<String>,
        recorded_at_ms: u64,
    ) -> Self {
        Self {
            kind,
            unit,
            reason: reason.into(),
            recorded_at_ms,
        }
    }

    /// Entry for a unit that fell back.
    pub fn unit_fallback(unit: UnitKind, reason: impl Into<String>) -> Self {
        Self::new(RecoveryKind::UnitFallback, Some(unit), reason)
    }
}

/// Returns the current system time in milliseconds since UNIX_EPOCH.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
