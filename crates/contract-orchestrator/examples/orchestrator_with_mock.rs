//! Contract analysis with the built-in agents on an offline backend.
//!
//! This example shows how to:
//! - Plug a custom `CompletionBackend` into the five built-in agents
//! - Build and start a `WorkflowOrchestrator`
//! - Follow progress through a `BroadcastProgressSink`
//! - Inspect the result, health and statistics
//!
//! The backend answers the risk assessor with garbage, so that unit falls
//! back to its rule-based output and the run ends `degraded`.
//!
//! Run with: cargo run --example orchestrator_with_mock

use async_trait::async_trait;
use contract_orchestrator::agent::AgentError;
use contract_orchestrator::agent::impls::{CompletionBackend, default_registry};
use contract_orchestrator::observability::{self, ObservabilityConfig};
use contract_orchestrator::orchestrator::{
    BroadcastProgressSink, OrchestratorBuilder, OrchestratorConfig,
};
use serde_json::{Map, json};
use std::sync::Arc;

const CONTRACT: &str = "MASTER SERVICES AGREEMENT\n\
1. Liability of the supplier is unlimited for data breaches.\n\
2. Either party may invoke termination with 30 days notice.\n\
3. Payment is due within 60 days of invoice.\n\
4. Confidential information must not be disclosed.";

/// Answers each unit prompt with a canned JSON reply.
struct CannedBackend;

#[async_trait]
impl CompletionBackend for CannedBackend {
    async fn complete(&self, prompt: String) -> Result<String, AgentError> {
        let reply = if prompt.starts_with("You are a contract analyst") {
            json!({
                "clauses": [
                    {"clause_type": "liability", "text": "Liability of the supplier is unlimited", "confidence": 0.92},
                    {"clause_type": "termination", "text": "termination with 30 days notice", "confidence": 0.88},
                    {"clause_type": "payment_terms", "text": "Payment is due within 60 days", "confidence": 0.9},
                ],
                "document_structure": {"document_type": "msa", "sections": 4},
                "confidence_score": 0.9,
            })
        } else if prompt.starts_with("You are a contract risk assessor") {
            return Ok("I'm not sure how to score these clauses.".to_string());
        } else if prompt.starts_with("You are a legal researcher") {
            json!({
                "precedents": [{"category": "liability", "title": "Unlimited liability carve-outs", "summary": "Courts enforce explicit caps.", "relevance": 0.7}],
                "confidence_score": 0.75,
            })
        } else if prompt.starts_with("You are a contract negotiator") {
            json!({
                "redlines": [{"clause_type": "liability", "original_text": "unlimited", "suggested_change": "capped at 12 months of fees", "rationale": "Market standard"}],
                "negotiation_strategy": "Trade payment terms for a liability cap",
                "confidence_score": 0.8,
            })
        } else {
            json!({
                "email_draft": "We reviewed the MSA; the liability clause needs a cap.",
                "next_steps": ["Send redlines", "Schedule call"],
                "confidence_score": 0.85,
            })
        };
        Ok(format!("Here is the result:\n```json\n{reply}\n```"))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG=contract_orchestrator=debug for per-unit detail
    observability::init(ObservabilityConfig::default())?;

    let progress = Arc::new(BroadcastProgressSink::default());
    let mut events = progress.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("  [{:>5.1}%] {}", event.percentage, event.message);
        }
    });

    let orchestrator = OrchestratorBuilder::new()
        .with_config(OrchestratorConfig::new().with_max_concurrent_agents(3))
        .with_agents(default_registry(Arc::new(CannedBackend)))
        .with_progress_sink(progress)
        .build()
        .await?;
    orchestrator.start();

    let result = orchestrator.run(CONTRACT, "msa.txt", &Map::new()).await;

    println!("\nStatus:        {}", result.status);
    println!("Strategy:      {:?}", result.strategy);
    println!("Quality score: {:.3}", result.quality_score);
    println!("Fallback used: {}", result.fallback_used);
    println!("Degraded:      {:?}", result.degraded_units);
    println!("Failed:        {:?}", result.failed_units);
    for action in &result.recovery_actions {
        println!("Recovery:      {:?} {:?} {}", action.kind, action.unit, action.reason);
    }
    println!(
        "\nResults:\n{}",
        serde_json::to_string_pretty(&result.results_json())?
    );

    println!("\nHealth:");
    for (unit, health) in orchestrator.get_health_status() {
        println!(
            "  {:<22} {:<10} breaker={} success_rate={:.2}",
            unit.as_str(),
            health.status.as_str(),
            health.circuit_breaker_state,
            health.success_rate
        );
    }

    let stats = orchestrator.get_performance_statistics();
    println!(
        "\nRuns: {} (degraded {}), fallbacks: {}",
        stats.total_runs, stats.degraded_runs, stats.fallbacks_used
    );

    orchestrator.stop().await;
    Ok(())
}
