use std::{future::Future, time::Duration};

use crate::error::Result;

/// How often and how long to re-issue an operation the tester is still busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Total number of attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval: Duration::from_millis(100),
            max_attempts: 50,
        }
    }
}

/// Runs `operation` until it no longer fails with a retryable error.
///
/// Other errors are returned immediately. After `max_attempts` the last
/// retryable error is returned.
pub async fn retry_while_pending<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                log::debug!("Attempt {} pending, retrying: {}", attempt, e);
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
