//! Bounded retry with a fixed inter-attempt delay.
//!
//! Three loops share one policy type:
//! - [`retry_until_some`] for preview fetches: only a missing result retries.
//! - [`retry_until_done`] for placement: the caller decides per attempt
//!   whether the result is final.
//! - [`retry_transport`] for plain transport errors, abortable through a
//!   cancellation token.
//!
//! There is no exponential growth: sites rate-limit per account, and the
//! account pool already spaces calls out.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Attempt bound and fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Sleep between attempts (not after the last).
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Same bound, no sleeping. Handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(300))
    }
}

/// Verdict on one attempt of [`retry_until_done`].
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    Retry(E),
}

/// Every attempt was used up; carries the last failure.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Why [`retry_transport`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled { attempts: u32 },
    Exhausted(Exhausted<E>),
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled { attempts } => write!(f, "cancelled after {attempts} attempts"),
            RetryError::Exhausted(e) => write!(f, "gave up after {} attempts: {}", e.attempts, e.last),
        }
    }
}

/// Call `operation` until it yields `Some`, at most `policy.max_attempts`
/// times. Any `Some`, whatever it contains, ends the loop.
pub async fn retry_until_some<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut operation: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 1..=policy.max_attempts {
        if let Some(value) = operation(attempt).await {
            if attempt > 1 {
                debug!(op = op_name, attempt, "got result after retries");
            }
            return Some(value);
        }
        debug!(op = op_name, attempt, max = policy.max_attempts, "no result");
        if attempt < policy.max_attempts {
            policy.pause().await;
        }
    }
    warn!(op = op_name, attempts = policy.max_attempts, "no result after all attempts");
    None
}

/// Call `operation` until it returns [`Attempt::Done`], at most
/// `policy.max_attempts` times.
pub async fn retry_until_done<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry(err) => {
                if attempt >= policy.max_attempts {
                    warn!(op = op_name, attempts = attempt, error = %err, "attempts exhausted");
                    return Err(Exhausted { attempts: attempt, last: err });
                }
                debug!(op = op_name, attempt, error = %err, "attempt failed, retrying");
                policy.pause().await;
                attempt += 1;
            }
        }
    }
}

/// Retry `operation` on error, sleeping `policy.delay` in between.
/// Cancelling `cancel` aborts the loop at once, including mid-sleep.
pub async fn retry_transport<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            r = operation() => r,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts => {
                warn!(op = op_name, attempts = attempt, error = %err, "transport retries exhausted");
                return Err(RetryError::Exhausted(Exhausted { attempts: attempt, last: err }));
            }
            Err(err) => {
                debug!(op = op_name, attempt, error = %err, "transport error, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                    _ = policy.pause() => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
