//! Configuration for the orchestrator and for individual workflow runs.
//!
//! [`OrchestratorConfig`] is fixed at construction time (resource budget,
//! breaker defaults, store sizes, maintenance cadence). [`RunConfig`] is
//! supplied per invocation as a JSON map and controls strategy, timeouts and
//! retries for that run only.

use super::error::OrchestratorError;
use super::health::CircuitBreakerConfig;
use super::parallel::ResourceLimits;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;

/// How a run schedules its units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One unit at a time in dependency order.
    Sequential,
    /// Every stage split into parallel groups.
    Parallel,
    /// Chosen per run from the current health snapshot.
    #[default]
    Adaptive,
}

/// Per-run options, deserialized from the caller's config map.
///
/// Every field has a default, and unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub execution_mode: ExecutionMode,
    /// Budget for the whole pipeline. Exceeding it triggers graceful degradation.
    pub max_execution_time_seconds: u64,
    /// Retry retryable unit errors before falling back.
    pub retry_failed_tasks: bool,
    /// Retries on top of the first attempt when `retry_failed_tasks` is set.
    pub max_retries: u32,
    /// Consecutive failures that open a unit's circuit breaker.
    ///
    /// Unset keeps the orchestrator's breaker configuration.
    pub circuit_breaker_threshold: Option<u32>,
    /// Seconds an open breaker waits before allowing a half-open attempt.
    ///
    /// Unset keeps the orchestrator's breaker configuration.
    pub fallback_timeout_seconds: Option<u64>,
    /// Timeout for a single unit invocation.
    pub unit_timeout_seconds: u64,
    /// Serve and store results through the result cache.
    pub use_cache: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Adaptive,
            max_execution_time_seconds: 180,
            retry_failed_tasks: false,
            max_retries: 2,
            circuit_breaker_threshold: None,
            fallback_timeout_seconds: None,
            unit_timeout_seconds: 60,
            use_cache: true,
        }
    }
}

impl RunConfig {
    /// Parses a caller-supplied config map.
    pub fn from_map(map: &Map<String, JsonValue>) -> Result<Self, OrchestratorError> {
        serde_json::from_value(JsonValue::Object(map.clone()))
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))
    }

    /// Sets the execution mode.
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Sets the per-unit timeout.
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout_seconds = timeout.as_secs().max(1);
        self
    }

    /// Enables retries with the given retry budget.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry_failed_tasks = true;
        self.max_retries = max_retries;
        self
    }

    /// Per-unit timeout as a duration.
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_seconds)
    }

    /// Whole-run budget as a duration.
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_seconds)
    }

    /// Retries the executor may use for this run.
    pub fn effective_retries(&self) -> u32 {
        if self.retry_failed_tasks {
            self.max_retries
        } else {
            0
        }
    }

    /// Overrides the breaker threshold and recovery timeout for this run.
    pub fn with_circuit_breaker(mut self, threshold: u32, recovery_timeout: Duration) -> Self {
        self.circuit_breaker_threshold = Some(threshold);
        self.fallback_timeout_seconds = Some(recovery_timeout.as_secs());
        self
    }

    /// Breaker settings for this run: `base` with this run's overrides applied.
    pub fn breaker_config(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self
                .circuit_breaker_threshold
                .unwrap_or(base.failure_threshold)
                .max(1),
            recovery_timeout: self
                .fallback_timeout_seconds
                .map_or(base.recovery_timeout, Duration::from_secs),
        }
    }
}

/// Construction-time configuration for the orchestrator.
///
/// # Examples
///
/// ```ignore
/// use contract_orchestrator::orchestrator::OrchestratorConfig;
/// use std::time::Duration;
///
/// let config = OrchestratorConfig::new()
///     .with_max_concurrent_agents(2)
///     .with_resource_wait(Duration::from_secs(30), Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Shared budget every run allocates from.
    pub resource_limits: ResourceLimits,

    /// Breaker settings for runs that do not override them.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Longest a parallel group waits for resources before proceeding best effort.
    ///
    /// **Default:** 300 s
    pub max_resource_wait: Duration,

    /// Poll interval while waiting for resources.
    ///
    /// **Default:** 5 s
    pub resource_poll_interval: Duration,

    /// Grants older than this are force-released by the cleanup sweep.
    ///
    /// **Default:** 10 min
    pub max_grant_age: Duration,

    /// Interval of the background maintenance loop started by `start()`.
    ///
    /// **Default:** 60 s
    pub maintenance_interval: Duration,

    /// Time-to-live of cached results.
    ///
    /// **Default:** 30 min
    pub cache_ttl: Duration,

    /// Maximum number of cached results.
    pub cache_capacity: u64,

    /// Maximum number of runs retained for status queries.
    pub run_store_capacity: u64,

    /// How long finished runs remain queryable.
    pub run_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            resource_limits: ResourceLimits::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            max_resource_wait: Duration::from_secs(300),
            resource_poll_interval: Duration::from_secs(5),
            max_grant_age: Duration::from_secs(10 * 60),
            maintenance_interval: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(30 * 60),
            cache_capacity: 256,
            run_store_capacity: 1_000,
            run_retention: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Replaces the resource limits.
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    /// Sets only the concurrent-unit limit.
    pub fn with_max_concurrent_agents(mut self, max: usize) -> Self {
        self.resource_limits.max_concurrent_agents = max;
        self
    }

    /// Sets the default circuit breaker configuration.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Sets the resource wait bound and poll interval.
    pub fn with_resource_wait(mut self, max_wait: Duration, poll_interval: Duration) -> Self {
        self.max_resource_wait = max_wait;
        self.resource_poll_interval = poll_interval;
        self
    }

    /// Sets the maximum grant age used by the cleanup sweep.
    pub fn with_max_grant_age(mut self, age: Duration) -> Self {
        self.max_grant_age = age;
        self
    }

    /// Sets the maintenance loop interval.
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Sets the result cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.execution_mode, ExecutionMode::Adaptive);
        assert_eq!(config.max_execution_time_seconds, 180);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.circuit_breaker_threshold, None);
        assert_eq!(config.fallback_timeout_seconds, None);
        assert_eq!(config.effective_retries(), 0);
    }

    #[test]
    fn test_run_config_from_partial_map() {
        let map = json!({
            "execution_mode": "sequential",
            "retry_failed_tasks": true,
            "unrelated_option": "ignored",
        });
        let config = RunConfig::from_map(map.as_object().unwrap()).unwrap();

        assert_eq!(config.execution_mode, ExecutionMode::Sequential);
        assert_eq!(config.effective_retries(), 2);
        assert_eq!(config.unit_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_run_config_rejects_bad_mode() {
        let map = json!({"execution_mode": "turbo"});
        let err = RunConfig::from_map(map.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
    }

    #[test]
    fn test_breaker_config_never_has_zero_threshold() {
        let config = RunConfig {
            circuit_breaker_threshold: Some(0),
            ..Default::default()
        };
        let base = CircuitBreakerConfig::default();
        assert_eq!(config.breaker_config(&base).failure_threshold, 1);
    }

    #[test]
    fn test_breaker_config_keeps_base_unless_overridden() {
        let base = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(600),
        };
        assert_eq!(RunConfig::default().breaker_config(&base), base);

        let map = json!({"circuit_breaker_threshold": 5});
        let config = RunConfig::from_map(map.as_object().unwrap()).unwrap();
        let merged = config.breaker_config(&base);
        assert_eq!(merged.failure_threshold, 5);
        assert_eq!(merged.recovery_timeout, Duration::from_secs(600));

        let config = RunConfig::default().with_circuit_breaker(2, Duration::from_secs(10));
        assert_eq!(
            config.breaker_config(&base),
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(10),
            }
        );
    }

    #[test]
    fn test_orchestrator_config_builder_chain() {
        let config = OrchestratorConfig::new()
            .with_max_concurrent_agents(1)
            .with_resource_wait(Duration::from_secs(2), Duration::from_millis(10))
            .with_cache_ttl(Duration::from_secs(60));

        assert_eq!(config.resource_limits.max_concurrent_agents, 1);
        assert_eq!(config.max_resource_wait, Duration::from_secs(2));
        assert_eq!(config.resource_poll_interval, Duration::from_millis(10));
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.max_grant_age, Duration::from_secs(600));
    }
}
