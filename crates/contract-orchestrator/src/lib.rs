//! 'contract-orchestrator' - Multi-agent workflow orchestration for contract analysis.
//!
//! This crate coordinates five analysis units over a contract document:
//! clause extraction, risk assessment, precedent research, negotiation
//! strategy and stakeholder communication. Units run in dependency stages,
//! independent units run concurrently under a shared resource budget, and
//! every unit is guarded by a health tracker with a circuit breaker. When a
//! unit cannot deliver, a deterministic rule-based fallback takes its place,
//! so a run always produces a result and callers can tell full success from
//! degradation.
//!
//! The units themselves are opaque [`Agent`]s. The built-in implementations
//! in [`agent::impls`] render a prompt, call a pluggable completion backend
//! and parse the JSON reply; tests and offline deployments can register any
//! other implementation.

pub mod agent;
pub mod observability;
pub mod orchestrator;

pub use agent::{Agent, AgentError, AgentRegistry, UnitInput, UnitKind, UnitOutput};
pub use orchestrator::{
    OrchestratorBuilder, OrchestratorConfig, OrchestratorError, RunConfig, RunStatus,
    WorkflowOrchestrator, WorkflowResult,
};
