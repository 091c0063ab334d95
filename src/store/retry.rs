use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::{MAX_RETRIES, RETRY_DELAY};

/// Fixed-backoff retry policy for a single store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: MAX_RETRIES,
            delay: RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// A policy that tries exactly once
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted
///
/// Returns the last error when every attempt failed.
pub async fn retry<T, F, Fut>(operation: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {:#}",
                    operation, attempt, attempts, e
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
