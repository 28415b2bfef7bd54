//! Execution of a single unit.
//!
//! [`UnitExecutor::execute`] never fails: every path ends in a
//! [`UnitOutcome`] whose output downstream units can consume. Health is
//! recorded exactly once per invocation, including when retries are used.

use crate::agent::retry::retry_execution;
use crate::agent::{AgentError, AgentRegistry, SharedAgent, UnitInput, UnitKind, UnitOutput};
use crate::orchestrator::fallback::FallbackEngine;
use crate::orchestrator::health::HealthRegistry;
use crate::orchestrator::parallel::{UnitOutcome, UnitStatus};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-invocation limits, derived from the run's config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionOptions {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 0,
        }
    }
}

/// Runs units through their agents with timeout, health tracking and fallback.
#[derive(Debug, Clone)]
pub struct UnitExecutor {
    agents: Arc<AgentRegistry>,
    health: Arc<HealthRegistry>,
    fallback: FallbackEngine,
}

impl UnitExecutor {
    pub fn new(
        agents: Arc<AgentRegistry>,
        health: Arc<HealthRegistry>,
        fallback: FallbackEngine,
    ) -> Self {
        Self {
            agents,
            health,
            fallback,
        }
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn fallback_engine(&self) -> &FallbackEngine {
        &self.fallback
    }

    /// Executes `unit` with `input`.
    ///
    /// - unavailable unit: fallback output, `Degraded`, no health update
    /// - success: `Completed`, or `Degraded` if the output reports `success: false`
    /// - error, timeout or panic: failure recorded, fallback output, `Failed`
    pub async fn execute(
        &self,
        unit: UnitKind,
        input: UnitInput,
        options: ExecutionOptions,
    ) -> UnitOutcome {
        let agent = match self.agents.get(unit) {
            Some(agent) if self.health.is_available(unit) => Arc::clone(agent),
            _ => {
                debug!(unit = %unit, "Unit not available, using fallback");
                return self.fallback_outcome(
                    unit,
                    &input,
                    UnitStatus::Degraded,
                    "unit not available",
                );
            }
        };

        let started = Instant::now();
        let result = if options.max_retries > 0 {
            retry_execution(options.max_retries, &input, |input| {
                invoke_once(Arc::clone(&agent), input.clone(), options.timeout)
            })
            .await
        } else {
            invoke_once(agent, input.clone(), options.timeout).await
        };
        let elapsed = started.elapsed();

        match result {
            Ok(output) => {
                self.health.record_success(unit, elapsed);
                let status = if output.success {
                    UnitStatus::Completed
                } else {
                    UnitStatus::Degraded
                };
                let error = output.error.clone();
                let outcome = UnitOutcome::new(unit, status, output)
                    .with_duration_ms(elapsed.as_millis() as u64);
                match error {
                    Some(error) => outcome.with_error(error),
                    None => outcome,
                }
            }
            Err(e) => {
                let error = e.to_string();
                warn!(unit = %unit, error = %error, "Unit failed, using fallback");
                self.health.record_failure(unit, &error);
                self.fallback_outcome(unit, &input, UnitStatus::Failed, error)
                    .with_duration_ms(elapsed.as_millis() as u64)
            }
        }
    }

    /// Builds an outcome from the unit's fallback rule without invoking the unit.
    pub fn fallback_outcome(
        &self,
        unit: UnitKind,
        input: &UnitInput,
        status: UnitStatus,
        reason: impl Into<String>,
    ) -> UnitOutcome {
        let output = self.fallback.fallback(unit, input);
        UnitOutcome::new(unit, status, output).with_error(reason)
    }
}

async fn invoke_once(
    agent: SharedAgent,
    input: UnitInput,
    timeout: Duration,
) -> Result<UnitOutput, AgentError> {
    let call = AssertUnwindSafe(agent.execute(input)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(AgentError::ExecutionFailed("unit panicked".to_string())),
        Err(_) => Err(AgentError::ExecutionFailed(format!("timed out after {timeout:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::orchestrator::health::{CircuitBreakerConfig, CircuitState, HealthStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behavior {
        Succeed,
        DeclareFailure,
        Error(fn() -> AgentError),
        Hang,
        Panic,
    }

    struct ScriptedAgent {
        unit: UnitKind,
        behavior: Behavior,
        calls: AtomicU32,
    }

    impl ScriptedAgent {
        fn shared(unit: UnitKind, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                unit,
                behavior,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn unit(&self) -> UnitKind {
            self.unit
        }

        fn expertise(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _input: UnitInput) -> Result<UnitOutput, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeed => Ok(UnitOutput::success().with_confidence(0.9)),
                Behavior::DeclareFailure => Ok(UnitOutput::failure("could not parse contract")),
                Behavior::Error(make) => Err(make()),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(UnitOutput::success())
                }
                Behavior::Panic => panic!("agent bug"),
            }
        }
    }

    fn executor_with(agent: Arc<ScriptedAgent>) -> UnitExecutor {
        let agents = AgentRegistry::new().with(agent);
        let health = HealthRegistry::new(UnitKind::ALL, CircuitBreakerConfig::default());
        UnitExecutor::new(Arc::new(agents), Arc::new(health), FallbackEngine::new())
    }

    fn options() -> ExecutionOptions {
        ExecutionOptions {
            timeout: Duration::from_millis(200),
            max_retries: 0,
        }
    }

    #[tokio::test]
    async fn test_success_is_completed() {
        let executor = executor_with(ScriptedAgent::shared(UnitKind::Analyzer, Behavior::Succeed));
        let outcome = executor.execute(UnitKind::Analyzer, UnitInput::new(), options()).await;

        assert_eq!(outcome.status, UnitStatus::Completed);
        assert!(!outcome.used_fallback());
        assert_eq!(executor.health().record(UnitKind::Analyzer).unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_declared_failure_is_degraded_and_counts_as_success() {
        let executor = executor_with(ScriptedAgent::shared(
            UnitKind::Analyzer,
            Behavior::DeclareFailure,
        ));
        let outcome = executor.execute(UnitKind::Analyzer, UnitInput::new(), options()).await;

        assert_eq!(outcome.status, UnitStatus::Degraded);
        assert!(!outcome.output.success);
        assert_eq!(outcome.error.as_deref(), Some("could not parse contract"));
        assert_eq!(executor.health().status(UnitKind::Analyzer), Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_error_records_failure_once_and_falls_back() {
        let executor = executor_with(ScriptedAgent::shared(
            UnitKind::Analyzer,
            Behavior::Error(|| AgentError::ExecutionFailed("boom".into())),
        ));
        let outcome = executor
            .execute(
                UnitKind::Analyzer,
                UnitInput::document("Liability is capped.", "a.txt"),
                options(),
            )
            .await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        assert!(outcome.used_fallback());
        assert_eq!(outcome.output.field("clauses").unwrap()[0]["clause_type"], "liability");
        let record = executor.health().record(UnitKind::Analyzer).unwrap();
        assert_eq!(record.error_count, 1);
        assert_eq!(record.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let executor = executor_with(ScriptedAgent::shared(UnitKind::Negotiator, Behavior::Hang));
        let outcome = executor.execute(UnitKind::Negotiator, UnitInput::new(), options()).await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert!(outcome.output.field("redlines").is_some());
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let executor =
            executor_with(ScriptedAgent::shared(UnitKind::Communicator, Behavior::Panic));
        let outcome = executor.execute(UnitKind::Communicator, UnitInput::new(), options()).await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        assert!(outcome.used_fallback());
    }

    #[tokio::test]
    async fn test_open_breaker_skips_invocation() {
        let agent = ScriptedAgent::shared(UnitKind::RiskAssessor, Behavior::Succeed);
        let executor = executor_with(agent.clone());
        for _ in 0..3 {
            executor.health().record_failure(UnitKind::RiskAssessor, "down");
        }
        assert_eq!(
            executor.health().breaker_state(UnitKind::RiskAssessor),
            Some(CircuitState::Open)
        );

        let outcome = executor.execute(UnitKind::RiskAssessor, UnitInput::new(), options()).await;

        assert_eq!(outcome.status, UnitStatus::Degraded);
        assert!(outcome.used_fallback());
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
        assert_eq!(executor.health().record(UnitKind::RiskAssessor).unwrap().error_count, 3);
    }

    #[tokio::test]
    async fn test_missing_agent_uses_fallback() {
        let executor = executor_with(ScriptedAgent::shared(UnitKind::Analyzer, Behavior::Succeed));
        let outcome = executor
            .execute(UnitKind::PrecedentResearcher, UnitInput::new(), options())
            .await;
        assert_eq!(outcome.status, UnitStatus::Degraded);
        assert_eq!(outcome.output.field("precedents").unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retries_record_health_once() {
        let agent = ScriptedAgent::shared(
            UnitKind::Analyzer,
            Behavior::Error(|| AgentError::BackendError("503".into())),
        );
        let executor = executor_with(agent.clone());
        let options = ExecutionOptions {
            timeout: Duration::from_secs(5),
            max_retries: 1,
        };

        let outcome = executor.execute(UnitKind::Analyzer, UnitInput::new(), options).await;

        assert_eq!(outcome.status, UnitStatus::Failed);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.health().record(UnitKind::Analyzer).unwrap().error_count, 1);
    }
}
