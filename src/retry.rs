use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::storage::StorageError;

/// Bounds on how long and how often a storage call is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Applied to each attempt separately.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// No retries, only the per-attempt timeout.
    pub fn once(timeout: Duration) -> Self {
        RetryPolicy {
            max_retries: 0,
            timeout,
            ..Default::default()
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `f` under the policy's timeout, retrying transient failures with exponential backoff.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation_name: &str, mut f: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0;
    loop {
        let result = match timeout(policy.timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(policy.timeout)),
        };
        match result {
            Ok(value) => {
                if attempt > 0 {
                    info!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed ({}), retrying in {:?} (attempt {}/{})",
                    operation_name,
                    err,
                    delay,
                    attempt + 1,
                    policy.max_retries
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
