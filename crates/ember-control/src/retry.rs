use std::{future::Future, time::Duration};

use crate::error::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(30);
        let mult = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(mult)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Outcome of [`run_with_retry`]: the final result and how many attempts ran.
pub struct Retried<T> {
    pub result: Result<T, ProvisionError>,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Only connectivity and timeout errors are retried.
pub async fn run_with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProvisionError>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => {
                return Retried {
                    result: Ok(v),
                    attempts: attempt,
                };
            }
            Err(err) if err.is_retryable() && attempt < max => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = max,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable failure; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Retried {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        }
    }
}
