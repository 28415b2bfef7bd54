//! Per-unit health tracking and circuit breakers.
//!
//! Every unit has a [`HealthRecord`] with rolling metrics and a derived
//! [`HealthStatus`], plus a [`CircuitBreaker`] gating execution. Both live
//! behind one lock so a success or failure updates them together.
//!
//! A unit is available iff its status is not `Offline` and its breaker is not
//! `Open`. `Offline` is only assigned at startup and only
//! [`HealthRegistry::force_recover`] clears it.

use crate::agent::UnitKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive failures at which a unit is considered unhealthy.
const UNHEALTHY_AFTER_FAILURES: u32 = 3;
/// Successful calls slower than this leave the unit degraded.
const SLOW_RESPONSE: Duration = Duration::from_secs(30);
/// Weight of the newest sample in the running success rate.
const SUCCESS_RATE_ALPHA: f64 = 0.1;

/// Derived health of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures at which a closed breaker opens.
    pub failure_threshold: u32,
    /// Time after the last failure before an open breaker allows a half-open attempt.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Failure gate for one unit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    fn recovery_elapsed(&self, config: &CircuitBreakerConfig, now: Instant) -> bool {
        self.last_failure_at
            .is_none_or(|at| now.saturating_duration_since(at) >= config.recovery_timeout)
    }

    /// Moves `Open` to `HalfOpen` once the recovery timeout has elapsed.
    fn poll(&mut self, config: &CircuitBreakerConfig, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open && self.recovery_elapsed(config, now) {
            self.state = CircuitState::HalfOpen;
        }
        self.state
    }

    fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen | CircuitState::Closed => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
            }
            // A call admitted before the breaker opened; the open window still applies.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= config.failure_threshold {
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => self.state = CircuitState::Open,
            CircuitState::Open => {
                self.poll(config, now);
            }
        }
        self.last_failure_at = Some(now);
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Rolling health metrics for one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub avg_response_time: Duration,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            success_rate: 1.0,
            avg_response_time: Duration::ZERO,
            success_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            last_error: None,
            last_health_check: None,
        }
    }
}

impl HealthRecord {
    fn derive_status(&mut self, last_latency: Option<Duration>) {
        if self.status == HealthStatus::Offline {
            return;
        }
        self.status = if self.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            HealthStatus::Unhealthy
        } else if self.consecutive_failures >= 1 {
            HealthStatus::Degraded
        } else if last_latency.is_some_and(|latency| latency > SLOW_RESPONSE) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
    }
}

/// Health view of one unit as reported by `get_health_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitHealthSnapshot {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub avg_response_time_ms: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub circuit_breaker_state: CircuitState,
    pub last_error: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct UnitHealth {
    record: HealthRecord,
    breaker: CircuitBreaker,
}

#[derive(Debug)]
struct RegistryState {
    config: CircuitBreakerConfig,
    units: BTreeMap<UnitKind, UnitHealth>,
}

/// Thread-safe health and circuit breaker state for every unit.
#[derive(Debug)]
pub struct HealthRegistry {
    state: Mutex<RegistryState>,
}

impl HealthRegistry {
    /// Creates a registry with every unit healthy and every breaker closed.
    pub fn new(units: impl IntoIterator<Item = UnitKind>, config: CircuitBreakerConfig) -> Self {
        let units = units
            .into_iter()
            .map(|unit| (unit, UnitHealth::default()))
            .collect();
        Self {
            state: Mutex::new(RegistryState { config, units }),
        }
    }

    /// Current breaker configuration.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        self.state.lock().config.clone()
    }

    /// Replaces the breaker configuration for every unit.
    ///
    /// Existing failure counts are kept and judged against the new threshold
    /// on the next failure.
    pub fn update_breaker_config(&self, config: CircuitBreakerConfig) {
        let mut state = self.state.lock();
        if state.config != config {
            debug!(
                threshold = config.failure_threshold,
                recovery_timeout = ?config.recovery_timeout,
                "Circuit breaker configuration updated"
            );
            state.config = config;
        }
    }

    /// Marks a unit offline. Used at startup for units that failed to initialize.
    pub fn mark_offline(&self, unit: UnitKind, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        if let Some(health) = state.units.get_mut(&unit) {
            warn!(unit = %unit, reason = %reason, "Unit marked offline");
            health.record.status = HealthStatus::Offline;
            health.record.last_error = Some(reason);
            health.record.last_health_check = Some(Utc::now());
        }
    }

    /// Records a successful invocation.
    pub fn record_success(&self, unit: UnitKind, latency: Duration) {
        let mut state = self.state.lock();
        let Some(health) = state.units.get_mut(&unit) else {
            return;
        };

        let record = &mut health.record;
        record.consecutive_failures = 0;
        record.success_count += 1;
        record.success_rate =
            record.success_rate * (1.0 - SUCCESS_RATE_ALPHA) + SUCCESS_RATE_ALPHA;
        record.avg_response_time = if record.success_count == 1 {
            latency
        } else {
            (record.avg_response_time + latency) / 2
        };
        record.last_health_check = Some(Utc::now());
        record.derive_status(Some(latency));

        let previous = health.breaker.state();
        health.breaker.record_success();
        if previous == CircuitState::HalfOpen {
            info!(unit = %unit, "Circuit breaker closed after successful half-open call");
        }
    }

    /// Records a failed invocation.
    pub fn record_failure(&self, unit: UnitKind, error: &str) {
        self.record_failure_at(unit, error, Instant::now());
    }

    fn record_failure_at(&self, unit: UnitKind, error: &str, now: Instant) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(health) = state.units.get_mut(&unit) else {
            return;
        };

        let record = &mut health.record;
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.error_count += 1;
        record.success_rate *= 1.0 - SUCCESS_RATE_ALPHA;
        record.last_error = Some(error.to_string());
        record.last_health_check = Some(Utc::now());
        record.derive_status(None);

        let previous = health.breaker.state();
        health.breaker.record_failure(&state.config, now);
        if previous != CircuitState::Open && health.breaker.state() == CircuitState::Open {
            warn!(
                unit = %unit,
                failures = health.breaker.failure_count(),
                "Circuit breaker opened"
            );
        }
    }

    /// Returns true if the unit may be executed now.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// here, which admits the next call.
    pub fn is_available(&self, unit: UnitKind) -> bool {
        self.is_available_at(unit, Instant::now())
    }

    fn is_available_at(&self, unit: UnitKind, now: Instant) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(health) = state.units.get_mut(&unit) else {
            return false;
        };
        if health.record.status == HealthStatus::Offline {
            return false;
        }

        let previous = health.breaker.state();
        let current = health.breaker.poll(&state.config, now);
        if previous == CircuitState::Open && current == CircuitState::HalfOpen {
            info!(unit = %unit, "Circuit breaker half-open, allowing a trial call");
        }
        current != CircuitState::Open
    }

    /// Applies the result of a background health probe.
    ///
    /// A passing probe closes a half-open breaker. A failing probe reopens it.
    /// Neither changes an offline unit.
    pub fn record_probe(&self, unit: UnitKind, result: Result<(), String>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(health) = state.units.get_mut(&unit) else {
            return;
        };
        health.record.last_health_check = Some(Utc::now());
        if health.record.status == HealthStatus::Offline {
            return;
        }

        let now = Instant::now();
        health.breaker.poll(&state.config, now);
        match result {
            Ok(()) => {
                if health.breaker.state() == CircuitState::HalfOpen {
                    health.breaker.record_success();
                    info!(unit = %unit, "Circuit breaker closed after successful health probe");
                }
            }
            Err(error) => {
                debug!(unit = %unit, error = %error, "Health probe failed");
                if health.breaker.state() == CircuitState::HalfOpen {
                    health.breaker.record_failure(&state.config, now);
                }
                health.record.last_error = Some(error);
            }
        }
    }

    /// Administrative reset: breaker closed with zero failures, status healthy.
    ///
    /// Does not verify the unit actually works.
    pub fn force_recover(&self, unit: UnitKind) -> bool {
        let mut state = self.state.lock();
        let Some(health) = state.units.get_mut(&unit) else {
            return false;
        };
        health.breaker.reset();
        health.record.status = HealthStatus::Healthy;
        health.record.consecutive_failures = 0;
        info!(unit = %unit, "Unit force-recovered");
        true
    }

    pub fn status(&self, unit: UnitKind) -> Option<HealthStatus> {
        self.state.lock().units.get(&unit).map(|h| h.record.status)
    }

    pub fn breaker_state(&self, unit: UnitKind) -> Option<CircuitState> {
        self.state.lock().units.get(&unit).map(|h| h.breaker.state())
    }

    pub fn record(&self, unit: UnitKind) -> Option<HealthRecord> {
        self.state.lock().units.get(&unit).map(|h| h.record.clone())
    }

    /// Units whose status is currently `Healthy`.
    pub fn healthy_units(&self) -> Vec<UnitKind> {
        self.state
            .lock()
            .units
            .iter()
            .filter(|(_, h)| h.record.status == HealthStatus::Healthy)
            .map(|(unit, _)| *unit)
            .collect()
    }

    /// Units that are not offline.
    pub fn usable_units(&self) -> Vec<UnitKind> {
        self.state
            .lock()
            .units
            .iter()
            .filter(|(_, h)| h.record.status != HealthStatus::Offline)
            .map(|(unit, _)| *unit)
            .collect()
    }

    /// Units whose breaker is half-open, or open with an elapsed recovery timeout.
    pub fn recovering_units(&self) -> Vec<UnitKind> {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .units
            .iter()
            .filter(|(_, h)| h.record.status != HealthStatus::Offline)
            .filter(|(_, h)| h.breaker.clone().poll(&state.config, now) == CircuitState::HalfOpen)
            .map(|(unit, _)| *unit)
            .collect()
    }

    /// Per-unit health snapshot.
    pub fn snapshot(&self) -> BTreeMap<UnitKind, UnitHealthSnapshot> {
        self.state
            .lock()
            .units
            .iter()
            .map(|(unit, h)| {
                (
                    *unit,
                    UnitHealthSnapshot {
                        status: h.record.status,
                        success_rate: h.record.success_rate,
                        avg_response_time_ms: h.record.avg_response_time.as_millis() as u64,
                        error_count: h.record.error_count,
                        consecutive_failures: h.record.consecutive_failures,
                        circuit_breaker_state: h.breaker.state(),
                        last_error: h.record.last_error.clone(),
                        last_health_check: h.record.last_health_check,
                    },
                )
            })
            .collect()
    }
}
