//! Bounded retry with exponential backoff

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{IngestError, Result};

/// Ceiling applied to a single backoff delay
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Retry policy for a pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry
    pub backoff_base: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay slept after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. Backoff sleeps end early on cancellation.
    pub async fn run<T, F, Fut>(&self, operation: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %err,
                        "Attempt failed, retrying in {:?}",
                        delay
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                        _ = tokio::time::sleep(delay) => {},
                    }
                    attempt += 1;
                },
                Err(err) => {
                    if err.is_retryable() {
                        info!(operation, attempts = attempt, "Retry budget exhausted");
                    }
                    return Err(err);
                },
            }
        }
    }
}
