//! Unit agent API.
//!
//! Each of the five pipeline units is backed by an [`Agent`]: an opaque async
//! capability that turns a [`UnitInput`] into a [`UnitOutput`]. The
//! orchestrator never looks inside an agent; it only relies on this contract:
//!
//! - `execute` may fail, time out, or return `success: false`. All three are
//!   handled by the executor and never abort the pipeline.
//! - `health_probe` is cheap and side-effect free. It is called once at
//!   startup and periodically by the maintenance loop.
//!
//! # Custom agents
//!
//! ```rust,ignore
//! use contract_orchestrator::agent::{Agent, AgentError, UnitInput, UnitKind, UnitOutput};
//!
//! struct KeywordAnalyzer;
//!
//! #[async_trait::async_trait]
//! impl Agent for KeywordAnalyzer {
//!     fn unit(&self) -> UnitKind {
//!         UnitKind::Analyzer
//!     }
//!
//!     fn expertise(&self) -> &str {
//!         "Extract clauses from contract text"
//!     }
//!
//!     async fn execute(&self, input: UnitInput) -> Result<UnitOutput, AgentError> {
//!         let text = input
//!             .document_text()
//!             .ok_or_else(|| AgentError::InvalidInput("document_text".into()))?;
//!         Ok(UnitOutput::success().with_field("clauses", serde_json::json!([text])))
//!     }
//! }
//! ```
//!
//! The LLM-backed implementations in [`impls`] follow the same shape on top of
//! a [`impls::CompletionBackend`].

pub mod error;
pub mod impls;
pub mod payload;
pub mod retry;
pub mod unit;

pub use error::AgentError;
pub use payload::{DOCUMENT_TEXT_KEY, FILENAME_KEY, UnitInput, UnitOutput};
pub use unit::{UnitKind, UnknownUnit};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The capability each pipeline unit exposes to the orchestrator.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The pipeline unit this agent implements.
    fn unit(&self) -> UnitKind;

    /// Returns a natural language description of what this agent does.
    fn expertise(&self) -> &str;

    /// Executes the unit on a prepared input.
    async fn execute(&self, input: UnitInput) -> Result<UnitOutput, AgentError>;

    /// Checks that the agent's backend is reachable.
    ///
    /// By default this always returns `Ok(())`.
    async fn health_probe(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Returns the name of this agent, the type name by default.
    fn name(&self) -> String {
        std::any::type_name::<Self>()
            .split("::")
            .last()
            .unwrap_or("UnknownAgent")
            .to_string()
    }
}

/// Shared handle to a unit agent.
pub type SharedAgent = Arc<dyn Agent>;

/// Maps each unit to the agent that implements it.
///
/// Built once at construction; a unit without an agent is reported offline.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<UnitKind, SharedAgent>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `agent` under the unit it reports via [`Agent::unit`].
    ///
    /// Replaces any agent previously registered for that unit.
    pub fn register(&mut self, agent: SharedAgent) -> Option<SharedAgent> {
        self.agents.insert(agent.unit(), agent)
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(mut self, agent: SharedAgent) -> Self {
        self.register(agent);
        self
    }

    /// Looks up the agent for a unit.
    pub fn get(&self, unit: UnitKind) -> Option<&SharedAgent> {
        self.agents.get(&unit)
    }

    /// Returns true if an agent is registered for `unit`.
    pub fn contains(&self, unit: UnitKind) -> bool {
        self.agents.contains_key(&unit)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Returns true if no agents are registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Iterates registered agents in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (UnitKind, &SharedAgent)> {
        self.agents.iter().map(|(unit, agent)| (*unit, agent))
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.agents.iter().map(|(unit, agent)| (unit, agent.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAgent(UnitKind);

    #[async_trait]
    impl Agent for EchoAgent {
        fn unit(&self) -> UnitKind {
            self.0
        }

        fn expertise(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _input: UnitInput) -> Result<UnitOutput, AgentError> {
            Ok(UnitOutput::success())
        }
    }

    #[test]
    fn test_registry_keys_agents_by_unit() {
        let registry = AgentRegistry::new()
            .with(Arc::new(EchoAgent(UnitKind::Analyzer)))
            .with(Arc::new(EchoAgent(UnitKind::Negotiator)));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(UnitKind::Analyzer));
        assert!(!registry.contains(UnitKind::Communicator));
        let units: Vec<_> = registry.iter().map(|(unit, _)| unit).collect();
        assert_eq!(units, vec![UnitKind::Analyzer, UnitKind::Negotiator]);
    }

    #[test]
    fn test_register_replaces_existing_agent() {
        let mut registry = AgentRegistry::new();
        assert!(registry.register(Arc::new(EchoAgent(UnitKind::Analyzer))).is_none());
        assert!(registry.register(Arc::new(EchoAgent(UnitKind::Analyzer))).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_default_health_probe_is_ok() {
        let agent = EchoAgent(UnitKind::Communicator);
        assert!(agent.health_probe().await.is_ok());
        assert_eq!(agent.name(), "EchoAgent");
    }
}
