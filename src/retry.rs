use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Outcome of a single failed attempt.
///
/// Transient failures are retried until the policy is exhausted, permanent
/// failures end the retry loop right away.
#[derive(Debug, thiserror::Error)]
pub enum AttemptFailure {
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),
    #[error("permanent failure: {0:#}")]
    Permanent(anyhow::Error),
}

impl AttemptFailure {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        AttemptFailure::Transient(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        AttemptFailure::Permanent(error.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("{operation} failed after {attempts} attempts")]
    ExhaustedRetries {
        operation: String,
        attempts: u32,
        #[source]
        last_failure: anyhow::Error,
    },
    #[error("{operation} was cancelled while waiting to retry after attempt {attempts}")]
    Cancelled { operation: String, attempts: u32 },
    #[error("{operation} failed on attempt {attempt} with a non-retryable error")]
    Permanent {
        operation: String,
        attempt: u32,
        #[source]
        source: anyhow::Error,
    },
}

impl RetryError {
    pub fn operation(&self) -> &str {
        match self {
            RetryError::ExhaustedRetries { operation, .. } => operation,
            RetryError::Cancelled { operation, .. } => operation,
            RetryError::Permanent { operation, .. } => operation,
        }
    }

    /// true when the caller should answer with "service unavailable"
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RetryError::ExhaustedRetries { .. } | RetryError::Cancelled { .. })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError::NoAttempts);
        }
        Ok(Self { max_attempts, delay })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Runs fallible async operations under a fixed [`RetryPolicy`].
///
/// Every I/O path of the service goes through one of these so the retry
/// behaviour is the same for pool construction, queries and outbound calls.
/// The executor is cheap to clone; clones share the shutdown token.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_shutdown(policy, CancellationToken::new())
    }

    pub fn with_shutdown(policy: RetryPolicy, shutdown: CancellationToken) -> Self {
        Self { policy, shutdown }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs `operation` until it succeeds or the policy is used up.
    /// Retry waits abort when the executor's shutdown token is cancelled.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        self.run_cancellable(operation_name, &self.shutdown, operation).await
    }

    /// Same as [`RetryExecutor::run`], but the retry waits race against the
    /// caller's `cancellation` token instead of the shutdown token.
    pub async fn run_cancellable<T, F, Fut>(
        &self,
        operation_name: &str,
        cancellation: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1;

        loop {
            let failure = match operation().await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            let cause = match failure {
                AttemptFailure::Permanent(source) => {
                    event!(
                        Level::ERROR,
                        "Attempt {} of {} for {} failed with a non-retryable error: {:#}",
                        attempt,
                        max_attempts,
                        operation_name,
                        source
                    );
                    return Err(RetryError::Permanent {
                        operation: operation_name.to_string(),
                        attempt,
                        source,
                    });
                }
                AttemptFailure::Transient(cause) => cause,
            };

            if attempt >= max_attempts {
                event!(
                    Level::ERROR,
                    "Failed {} after {} attempts: {:#}",
                    operation_name,
                    max_attempts,
                    cause
                );
                return Err(RetryError::ExhaustedRetries {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    last_failure: cause,
                });
            }

            event!(
                Level::WARN,
                "Attempt {} of {} for {} failed, retrying in {:?}: {:#}",
                attempt,
                max_attempts,
                operation_name,
                self.policy.delay,
                cause
            );

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    event!(Level::WARN, "Retry of {} cancelled after attempt {}", operation_name, attempt);
                    return Err(RetryError::Cancelled {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                    });
                }
                _ = tokio::time::sleep(self.policy.delay) => {}
            }

            attempt += 1;
        }
    }
}
