//! Error types for the agent module.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while a unit agent executes.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent execution failed with a specific error message.
    #[error("Agent execution failed: {0}")]
    ExecutionFailed(String),

    /// Failed to parse the backend's reply into a unit output.
    #[error("Failed to parse agent output: {0}")]
    ParseError(String),

    /// The completion backend could not be reached or returned a transport error.
    #[error("Backend error: {0}")]
    BackendError(String),

    /// The backend rejected the request because of rate limiting.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The agent's input is missing a required field or is malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Prompt template rendering failed.
    #[error("Template error: {0}")]
    TemplateError(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A generic error for other cases.
    #[error("Agent error: {0}")]
    Other(String),
}

impl AgentError {
    /// Check if this error should trigger an automatic retry.
    ///
    /// Returns `true` for errors that are likely transient:
    /// - `ParseError`: the model reply was malformed, a second sample may parse
    /// - `BackendError`: transport or provider hiccup
    /// - `RateLimited`: succeeds after backing off
    ///
    /// Everything else is reported straight back to the executor, which falls
    /// back to the rule-based output for the unit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::ParseError(_) | AgentError::BackendError(_) | AgentError::RateLimited(_)
        )
    }

    /// Delay before retry attempt `attempt` (1-based), with up to 25% jitter.
    ///
    /// Rate limits back off harder than other transient failures.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base_ms: u64 = match self {
            AgentError::RateLimited(_) => 2_000,
            _ => 250,
        };
        let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(6));
        let capped = exp.min(30_000);
        let jitter = rand::random::<u64>() % (capped / 4 + 1);
        Duration::from_millis(capped + jitter)
    }
}
