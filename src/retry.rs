//! Retry with exponential backoff at the collaborator boundary.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{EngineError, EngineResult, StoreError};

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        StoreError::is_retryable(self)
    }
}

/// Delay before retry number `attempt` (1-based): `base · 2^(attempt−1)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(policy.base_delay_ms.saturating_mul(factor))
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached. Returns the last outcome and the number of
/// attempts made.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> (Result<T, E>, u32)
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if attempt < max_attempts && e.is_retryable() => {
                let delay = backoff_delay(policy, attempt);
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(operation, attempt, error = %e, "giving up");
                return (Err(e), attempt);
            }
        }
    }
}

/// [`retry`] for storage and source-matcher calls, surfacing exhaustion as
/// [`EngineError::ExternalDependency`].
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    op: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let (result, attempts) = retry(policy, operation, op).await;
    result.map_err(|source| EngineError::ExternalDependency {
        operation: operation.to_string(),
        attempts,
        source,
    })
}
