//! The five contract-analysis unit agents.
//!
//! Each agent is a thin typed wrapper over [`PromptedAgent`] with its own
//! prompt and required reply fields.

use super::{CompletionBackend, PromptedAgent};
use crate::agent::{Agent, AgentError, AgentRegistry, UnitInput, UnitKind, UnitOutput};
use async_trait::async_trait;
use std::sync::Arc;

const ANALYZER_PROMPT: &str = r#"You are a contract analyst. Read the contract below and list its clauses.

Filename: {{ filename }}

Contract:
{{ document_text }}

Reply with a single JSON object:
{"clauses": [{"clause_type": "...", "text": "...", "confidence": 0.0}],
 "document_structure": {"document_type": "...", "sections": 0},
 "confidence_score": 0.0}"#;

const RISK_PROMPT: &str = r#"You are a contract risk assessor. Score each clause below from 0 to 10.

Analysis:
{{ analysis_results }}

Reply with a single JSON object:
{"risky_clauses": [{"clause_type": "...", "text": "...", "risk_score": 0.0, "reason": "..."}],
 "overall_risk_score": 0.0,
 "confidence_score": 0.0}"#;

const PRECEDENT_PROMPT: &str = r#"You are a legal researcher. Find precedents relevant to these clauses.

Analysis:
{{ analysis_results }}

Reply with a single JSON object:
{"precedents": [{"category": "...", "title": "...", "summary": "...", "relevance": 0.0}],
 "confidence_score": 0.0}"#;

const NEGOTIATOR_PROMPT: &str = r#"You are a contract negotiator. Propose redlines for the risky clauses.

Analysis:
{{ analysis_results }}

Risk assessment:
{{ risk_results }}

Precedents:
{{ precedent_results }}

Reply with a single JSON object:
{"redlines": [{"clause_type": "...", "original_text": "...", "suggested_change": "...", "rationale": "..."}],
 "negotiation_strategy": "...",
 "confidence_score": 0.0}"#;

const COMMUNICATOR_PROMPT: &str = r#"You draft client communication for a contract review.

Analysis:
{{ analysis_results }}

Risk assessment:
{{ risk_results }}

Negotiation position:
{{ negotiation_results }}

Reply with a single JSON object:
{"email_draft": {"subject": "...", "body": "..."},
 "next_steps": ["..."],
 "confidence_score": 0.0}"#;

macro_rules! unit_agent {
    ($(#[$doc:meta])* $name:ident, $unit:expr, $expertise:expr, $prompt:expr, $fields:expr) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            inner: PromptedAgent,
        }

        impl $name {
            /// Creates the agent on top of `backend`.
            pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
                Self {
                    inner: PromptedAgent::new($unit, $expertise, $prompt, $fields, backend),
                }
            }
        }

        #[async_trait]
        impl Agent for $name {
            fn unit(&self) -> UnitKind {
                $unit
            }

            fn expertise(&self) -> &str {
                $expertise
            }

            async fn execute(&self, input: UnitInput) -> Result<UnitOutput, AgentError> {
                self.inner.execute(input).await
            }

            async fn health_probe(&self) -> Result<(), AgentError> {
                self.inner.health_probe().await
            }

            fn name(&self) -> String {
                stringify!($name).to_string()
            }
        }
    };
}

unit_agent!(
    /// Extracts clauses and a document-structure summary from contract text.
    AnalyzerAgent,
    UnitKind::Analyzer,
    "Extract clauses and document structure from contract text",
    ANALYZER_PROMPT,
    &["clauses"]
);

unit_agent!(
    /// Scores analyzed clauses for legal and commercial risk.
    RiskAssessorAgent,
    UnitKind::RiskAssessor,
    "Score contract clauses for legal and commercial risk",
    RISK_PROMPT,
    &["risky_clauses", "overall_risk_score"]
);

unit_agent!(
    /// Finds precedents comparable to the analyzed clauses.
    PrecedentResearcherAgent,
    UnitKind::PrecedentResearcher,
    "Research precedents for contract clauses",
    PRECEDENT_PROMPT,
    &["precedents"]
);

unit_agent!(
    /// Drafts redlines for risky clauses.
    NegotiatorAgent,
    UnitKind::Negotiator,
    "Draft redlines and a negotiation strategy",
    NEGOTIATOR_PROMPT,
    &["redlines"]
);

unit_agent!(
    /// Drafts the client-facing summary email and next steps.
    CommunicatorAgent,
    UnitKind::Communicator,
    "Draft client communication for a contract review",
    COMMUNICATOR_PROMPT,
    &["email_draft", "next_steps"]
);

/// Builds a registry with all five built-in agents sharing one backend.
pub fn default_registry(backend: Arc<dyn CompletionBackend>) -> AgentRegistry {
    AgentRegistry::new()
        .with(Arc::new(AnalyzerAgent::new(backend.clone())))
        .with(Arc::new(RiskAssessorAgent::new(backend.clone())))
        .with(Arc::new(PrecedentResearcherAgent::new(backend.clone())))
        .with(Arc::new(NegotiatorAgent::new(backend.clone())))
        .with(Arc::new(CommunicatorAgent::new(backend)))
}
