//! Explicit retry policy for command writes.
//
// Components never retry on their own. A scenario that wants to re-attempt a
// command write opts in through its definition, and only transport-level
// failures (communication, timeout) are re-attempted. State checks and counter
// assertions are never retried.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::HarnessResult;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }

    /// Up to `max_attempts` attempts separated by `backoff_delay`.
    pub fn attempts(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay,
        }
    }

    /// Run `operation`, re-attempting transient failures according to the policy.
    pub async fn run<F, Fut, T>(&self, what: &str, mut operation: F) -> HarnessResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = HarnessResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!(
                        operation = what,
                        attempt,
                        max_attempts,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    sleep(self.backoff_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
