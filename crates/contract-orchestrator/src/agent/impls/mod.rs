//! Built-in LLM-backed unit agents.
//!
//! The five agents share one shape: render a minijinja prompt from the unit
//! input, send it to a [`CompletionBackend`], pull the JSON object out of the
//! reply and parse it into a [`UnitOutput`](crate::agent::UnitOutput). The
//! backend is the only piece that talks to a model provider.

pub mod contract_agents;
pub mod prompted;

pub use contract_agents::{
    AnalyzerAgent, CommunicatorAgent, NegotiatorAgent, PrecedentResearcherAgent,
    RiskAssessorAgent, default_registry,
};
pub use prompted::{PromptedAgent, extract_json};

use super::AgentError;
use async_trait::async_trait;

/// Opaque text-completion capability backing the built-in agents.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Sends `prompt` to the model and returns the raw reply text.
    async fn complete(&self, prompt: String) -> Result<String, AgentError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), AgentError> {
        Ok(())
    }
}
