//! Bounded retry with exponential backoff.
//!
//! Every fallible call in the pipeline goes through [`retry`] (or
//! [`retry_with_hint`] when the failure itself can say how long to wait).
//! Retryability is decided by the caller: an HTTP fetch and an LLM call
//! classify their errors differently.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use common::RetryPolicyConfig;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Immutable retry parameters, built once from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    pub max_total_timeout: Duration,
}

impl RetryPolicy {
    /// Delay following `current`, capped at `max_backoff`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.backoff_factor;
        if !next.is_finite() || next >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(next)
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryPolicyConfig::default())
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(cfg: &RetryPolicyConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            backoff_factor: cfg.backoff_factor,
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            max_total_timeout: Duration::from_secs(cfg.max_total_timeout_secs),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("total timeout of {timeout:?} exceeded after {attempts} attempt(s): {last}")]
    TotalTimeout {
        timeout: Duration,
        attempts: u32,
        last: E,
    },

    #[error("max retries exceeded after {attempts} attempt(s): {last}")]
    MaxRetries { attempts: u32, last: E },

    /// The error was classified as not retryable.
    #[error("{0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    /// The last error returned by the operation, if any attempt ran.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Cancelled { .. } => None,
            RetryError::TotalTimeout { last, .. } | RetryError::MaxRetries { last, .. } => Some(last),
            RetryError::Permanent(e) => Some(e),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Cancelled { .. } => None,
            RetryError::TotalTimeout { last, .. } | RetryError::MaxRetries { last, .. } => Some(last),
            RetryError::Permanent(e) => Some(e),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Run `op` until it succeeds, `should_retry` rejects its error, the attempts
/// run out, the total budget is spent, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. The first attempt starts
/// immediately; backoff is only inserted between attempts.
pub async fn retry<T, E, F, Fut, R>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    op: F,
    should_retry: R,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    retry_with_hint(cancel, policy, op, should_retry, |_: &E| None).await
}

/// Like [`retry`], but `delay_hint` may supply the wait before the next
/// attempt (e.g. from a `Retry-After` header). The exponential sequence
/// still advances when a hint is used.
pub async fn retry_with_hint<T, E, F, Fut, R, H>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut op: F,
    should_retry: R,
    delay_hint: H,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    H: Fn(&E) -> Option<Duration>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts();
    let mut backoff = policy.initial_backoff.min(policy.max_backoff);
    let mut last_error: Option<E> = None;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        if let Some(last) = last_error.take() {
            if started.elapsed() > policy.max_total_timeout {
                return Err(RetryError::TotalTimeout {
                    timeout: policy.max_total_timeout,
                    attempts: attempt,
                    last,
                });
            }
        }

        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        if !should_retry(&err) {
            return Err(RetryError::Permanent(err));
        }
        if attempt >= max_attempts {
            return Err(RetryError::MaxRetries { attempts: attempt, last: err });
        }

        let delay = delay_hint(&err).unwrap_or(backoff);
        // The next attempt would start past the budget.
        let next_start = started.elapsed().checked_add(delay);
        if next_start.map_or(true, |at| at > policy.max_total_timeout) {
            return Err(RetryError::TotalTimeout {
                timeout: policy.max_total_timeout,
                attempts: attempt,
                last: err,
            });
        }

        warn!(attempt, max_attempts, delay = ?delay, error = %err, "attempt failed, retrying");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
        }

        backoff = policy.next_backoff(backoff);
        last_error = Some(err);
    }
}
