//! Orchestration of the contract-analysis pipeline.
//!
//! The [`WorkflowOrchestrator`] runs five units (analyzer, risk assessor,
//! precedent researcher, negotiator, communicator) in dependency stages,
//! packs independent units into parallel groups under a shared resource
//! budget, tracks unit health behind circuit breakers and substitutes
//! rule-based fallback output whenever a unit cannot deliver.
//!
//! # Example
//!
//! ```rust,ignore
//! use contract_orchestrator::agent::impls::default_registry;
//! use contract_orchestrator::orchestrator::{OrchestratorBuilder, OrchestratorConfig};
//! use serde_json::Map;
//!
//! let orchestrator = OrchestratorBuilder::new()
//!     .with_config(OrchestratorConfig::new().with_max_concurrent_agents(3))
//!     .with_agents(default_registry(backend))
//!     .build()
//!     .await?;
//!
//! let result = orchestrator.run(&contract_text, "msa.txt", &Map::new()).await;
//! println!("{} (quality {:.2})", result.status, result.quality_score);
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod health;
pub mod journal;
pub mod parallel;
pub mod progress;
pub mod workflow_orchestrator;

pub use aggregate::{WorkflowResult, compile_results, overall_status, quality_score, unit_quality};
pub use cache::{CacheStats, ResultCache};
pub use config::{ExecutionMode, OrchestratorConfig, RunConfig};
pub use error::OrchestratorError;
pub use executor::{ExecutionOptions, UnitExecutor};
pub use fallback::FallbackEngine;
pub use health::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, HealthRecord, HealthRegistry, HealthStatus,
    UnitHealthSnapshot,
};
pub use journal::{RecoveryAction, RecoveryKind};
pub use parallel::{
    DependencyGraph, ExecutionStrategy, GrantKey, ResourceLedger, ResourceLimits,
    ResourceRequirements, ResourceUtilization, RunStatus, UnitOutcome, UnitSpec, UnitStatus,
    WorkflowRun, default_unit_specs,
};
pub use progress::{
    BroadcastProgressSink, NoopProgressSink, ProgressEvent, ProgressKind, ProgressSink,
};
pub use workflow_orchestrator::{OrchestratorBuilder, PerformanceStatistics, WorkflowOrchestrator};
