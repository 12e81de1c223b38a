use ditch_core::{BanterError, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fixed-attempt retry: no backoff, no jitter, no delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// A policy of zero attempts never runs the operation.
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds or the attempts are used up.
    ///
    /// The operation receives the 1-based attempt number. On exhaustion the
    /// last error is returned wrapped in [`BanterError::RetryExhausted`].
    /// An error that is not [retryable](BanterError::is_retryable) is
    /// returned as-is without further attempts. Cancelling `cancel` aborts
    /// the in-flight attempt and skips the rest.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.max_attempts == 0 {
            return Err(BanterError::RetryExhausted {
                attempts: 0,
                source: Box::new(BanterError::ConfigError(
                    "retry policy allows no attempts".to_string(),
                )),
            });
        }

        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(BanterError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BanterError::Cancelled),
                outcome = operation(attempt) => outcome,
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    debug!(attempt, error = %e, "Attempt failed with non-retryable error");
                    return Err(e);
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(attempts = attempt, error = %e, "Retry attempts exhausted");
                    return Err(BanterError::RetryExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(attempt, max_attempts = self.max_attempts, error = %e, "Attempt failed, retrying");
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Shorthand for `RetryPolicy::new(attempts).run(cancel, operation)`.
pub async fn retry<T, F, Fut>(attempts: u32, cancel: &CancellationToken, operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::new(attempts).run(cancel, operation).await
}
