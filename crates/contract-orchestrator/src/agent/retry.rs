//! Core retry logic for unit executions.
//!
//! The executor calls [`retry_execution`] when a run has
//! `retry_failed_tasks` enabled. Only errors marked retryable by
//! [`AgentError::is_retryable`] are retried.

use super::{AgentError, UnitInput};
use std::future::Future;
use tracing::{error, info, warn};

/// Executes an operation with retry logic.
///
/// - `max_retries` is the number of retries on top of the first attempt
/// - the delay between attempts comes from [`AgentError::retry_delay`]
/// - non-retryable errors are returned immediately
///
/// # Examples
///
/// ```rust,ignore
/// use contract_orchestrator::agent::retry::retry_execution;
///
/// let output = retry_execution(2, &input, |input| agent.execute(input.clone())).await?;
/// ```
pub async fn retry_execution<F, Fut, T>(
    max_retries: u32,
    input: &UnitInput,
    operation: F,
) -> Result<T, AgentError>
where
    F: Fn(&UnitInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, AgentError>> + Send,
    T: Send,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation(input).await {
            Ok(output) => {
                if attempts > 1 {
                    info!(
                        attempt = attempts,
                        max = max_retries + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(output);
            }
            Err(e) if e.is_retryable() && attempts <= max_retries => {
                let delay = e.retry_delay(attempts);
                warn!(
                    attempt = attempts,
                    max = max_retries + 1,
                    error = %e,
                    delay = ?delay,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    error!(attempts, error = %e, "Operation failed, retries exhausted");
                } else {
                    error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_execution_success_first_try() {
        let input = UnitInput::new();

        let operation = |_input: &UnitInput| async { Ok::<_, AgentError>("success".to_string()) };

        let result = retry_execution(3, &input, operation).await;
        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test]
    async fn test_retry_execution_success_after_retry() {
        let input = UnitInput::new();
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let operation = move |_input: &UnitInput| {
            let count = call_count_clone.clone();
            async move {
                let current = count.fetch_add(1, Ordering::SeqCst);
                if current < 1 {
                    Err(AgentError::ParseError("truncated reply".to_string()))
                } else {
                    Ok("success".to_string())
                }
            }
        };

        let result = retry_execution(2, &input, operation).await;

        assert!(result.is_ok());
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_execution_non_retryable_error_stops_immediately() {
        let input = UnitInput::new();
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let operation = move |_input: &UnitInput| {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(AgentError::ExecutionFailed("refused".to_string()))
            }
        };

        let result = retry_execution(3, &input, operation).await;

        assert!(matches!(result, Err(AgentError::ExecutionFailed(_))));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_execution_zero_retries_makes_one_attempt() {
        let input = UnitInput::new();
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let operation = move |_input: &UnitInput| {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(AgentError::BackendError("down".to_string()))
            }
        };

        let result = retry_execution(0, &input, operation).await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }
}
