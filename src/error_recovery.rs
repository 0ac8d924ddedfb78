//! Fixed-delay retry for field bus transactions.
//!
//! Serial transactions are cheap and must finish inside one scheduler tick, so the
//! policy is a small number of attempts with a constant delay between them. There is
//! deliberately no exponential backoff here.

use crate::error::{AppResult, GatewayError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use edge_gateway::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 3,
///     backoff_delay: Duration::from_millis(20),
/// };
/// assert_eq!(policy.max_attempts, 3);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Values below 1 are
    /// treated as 1.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(20),
        }
    }
}

impl RetryPolicy {
    /// Policy for a transport configured with `retries` extra attempts.
    pub fn with_retries(retries: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff_delay,
        }
    }

    /// Total attempts, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether a failed `attempt` (1-based) should be followed by another one.
    pub fn should_retry(&self, attempt: u32, err: &GatewayError) -> bool {
        attempt < self.attempts() && err.is_transient()
    }

    /// Wait out the constant delay between attempts.
    pub async fn pause(&self) {
        if !self.backoff_delay.is_zero() {
            sleep(self.backoff_delay).await;
        }
    }
}

/// Apply a caller-side timeout, mapping expiry to [`GatewayError::Timeout`].
pub async fn with_timeout<Fut, T>(timeout: Duration, fut: Fut) -> AppResult<T>
where
    Fut: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(timeout)),
    }
}
