//! Timeout and bounded exponential backoff around external capability calls.
//!
//! Both the outcome parser and the embedding generator route every AI call through
//! [`with_retry`], so the attempt budget, per-attempt timeout, and backoff curve live in one
//! place. Errors decide for themselves whether another attempt is worthwhile via [`Transient`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Attempt budget and timing for a single logical capability call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Upper bound on each individual attempt.
    pub timeout: Duration,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Ceiling applied to the doubled delays.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(60),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff applied after `attempt` (1-based) has failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Classifies whether a failed attempt is worth repeating.
pub trait Transient {
    /// Returns `true` when a later attempt could plausibly succeed.
    fn is_transient(&self) -> bool;
}

/// Terminal failure of a retried capability call.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The final attempt did not finish within the per-attempt timeout.
    #[error("{operation} timed out after {attempts} attempt(s) ({timeout:?} each)")]
    TimedOut {
        /// Logical operation name used in logs.
        operation: &'static str,
        /// Attempts made before giving up.
        attempts: u32,
        /// Per-attempt timeout that elapsed.
        timeout: Duration,
    },
    /// Every attempt failed; carries the error from the last one.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        /// Logical operation name used in logs.
        operation: &'static str,
        /// Attempts made before giving up.
        attempts: u32,
        /// Error returned by the final attempt.
        #[source]
        source: E,
    },
    /// The call failed with an error that retrying cannot fix.
    #[error("{operation} failed permanently on attempt {attempts}: {source}")]
    Permanent {
        /// Logical operation name used in logs.
        operation: &'static str,
        /// Attempt that produced the permanent error.
        attempts: u32,
        /// Non-transient error.
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before the call was abandoned.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::TimedOut { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Permanent { attempts, .. } => *attempts,
        }
    }

    /// The last underlying error, when the final attempt produced one.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::TimedOut { .. } => None,
            Self::Exhausted { source, .. } | Self::Permanent { source, .. } => Some(source),
        }
    }
}

enum AttemptFailure<E> {
    Failed(E),
    TimedOut,
}

/// Run `call` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// `call` receives the 1-based attempt number. Each attempt is bounded by
/// [`RetryPolicy::timeout`]; failed attempts are followed by an exponentially growing sleep.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let failure = match tokio::time::timeout(policy.timeout, call(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "Capability call recovered after retry");
                }
                return Ok(value);
            }
            Ok(Err(error)) if !error.is_transient() => {
                tracing::warn!(operation, attempt, error = %error, "Capability call failed permanently");
                return Err(RetryError::Permanent {
                    operation,
                    attempts: attempt,
                    source: error,
                });
            }
            Ok(Err(error)) => AttemptFailure::Failed(error),
            Err(_) => AttemptFailure::TimedOut,
        };

        if attempt >= max_attempts {
            tracing::warn!(operation, attempts = attempt, "Capability call exhausted retries");
            return Err(match failure {
                AttemptFailure::Failed(source) => RetryError::Exhausted {
                    operation,
                    attempts: attempt,
                    source,
                },
                AttemptFailure::TimedOut => RetryError::TimedOut {
                    operation,
                    attempts: attempt,
                    timeout: policy.timeout,
                },
            });
        }

        let delay = policy.delay_for(attempt);
        match &failure {
            AttemptFailure::Failed(error) => tracing::warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Capability call failed; backing off"
            ),
            AttemptFailure::TimedOut => tracing::warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Capability call timed out; backing off"
            ),
        }
        tokio::time::sleep(delay).await;
    }
}
