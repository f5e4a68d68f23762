//! Bounded retry with linear backoff for classification calls.

use std::time::Duration;

use tracing::warn;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Longest we will honour a provider's `retry-after` hint.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Retry schedule: attempt `n` (1-based) that fails with a retryable error
/// sleeps `base_delay * n` before attempt `n + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt.
    pub fn delay_for(&self, attempt: u32, error: &LlmError) -> Duration {
        let linear = self.base_delay.saturating_mul(attempt.max(1));
        match error {
            LlmError::RateLimited {
                retry_after: Some(hint),
                ..
            } => linear.max((*hint).min(MAX_RETRY_AFTER)),
            _ => linear,
        }
    }
}

/// Run `request` against `llm`, retrying transient failures per `policy`.
///
/// Non-retryable errors are returned immediately; the last error is returned
/// once attempts are exhausted.
pub async fn complete_with_retry(
    llm: &dyn LlmProvider,
    request: &CompletionRequest,
    policy: &RetryPolicy,
) -> Result<CompletionResponse, LlmError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match llm.complete(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = policy.delay_for(attempt, &e);
                warn!(
                    model = llm.model_name(),
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Classification call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
