/// Bounded retry with backoff
///
/// Every place that would otherwise poll in a sleep loop (waiting for a task to
/// go away, waiting for a workflow to finish, retrying a conflicting update)
/// goes through here, with a step budget and a cancellation token.

use std::{fmt, future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Attempts before giving up
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(5),
            steps: 5,
        }
    }
}

impl Backoff {
    /// Fixed-interval polling that gives up after roughly `timeout`
    pub fn polling(interval: Duration, timeout: Duration) -> Self {
        let steps = (timeout.as_millis() / interval.as_millis().max(1)).max(1) as u32;
        Self {
            initial: interval,
            factor: 1.0,
            max: interval,
            steps,
        }
    }

    /// Delay after attempt number `step` (0-based)
    pub fn delay(&self, step: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.max(1.0).powi(step as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

/// Why a retried operation stopped
#[derive(Debug)]
pub enum RetryError<E> {
    /// The token fired before the operation succeeded
    Cancelled,
    /// The step budget ran out; carries the last error
    Exhausted { attempts: u32, last: E },
    /// The operation failed with an error not worth retrying
    Permanent(E),
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "cancelled"),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            RetryError::Permanent(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl<E> RetryError<E> {
    /// The underlying error, if the operation ever produced one
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { last, .. } | RetryError::Permanent(last) => Some(last),
        }
    }
}

/// Why a wait ended without the condition holding
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("wait cancelled")]
    Cancelled,
    #[error("condition not met after {0} checks")]
    TimedOut(u32),
}

/// Sleep for `delay` unless cancelled first; returns false when cancelled
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, runs out of
/// steps, or `cancel` fires
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    backoff: &Backoff,
    cancel: &CancellationToken,
    mut op: F,
    retryable: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: fmt::Display,
{
    let steps = backoff.steps.max(1);
    for step in 0..steps {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(RetryError::Permanent(e)),
            Err(e) if step + 1 == steps => {
                return Err(RetryError::Exhausted {
                    attempts: steps,
                    last: e,
                })
            }
            Err(e) => {
                let delay = backoff.delay(step);
                tracing::debug!("🔁 Attempt {} failed ({}), retrying in {:?}", step + 1, e, delay);
                if !sleep_or_cancel(delay, cancel).await {
                    return Err(RetryError::Cancelled);
                }
            }
        }
    }
    Err(RetryError::Cancelled)
}

/// Check `condition` until it holds, backing off between checks
pub async fn wait_until<F, Fut>(
    backoff: &Backoff,
    cancel: &CancellationToken,
    mut condition: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let steps = backoff.steps.max(1);
    for step in 0..steps {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        if condition().await {
            return Ok(());
        }
        if step + 1 < steps && !sleep_or_cancel(backoff.delay(step), cancel).await {
            return Err(WaitError::Cancelled);
        }
    }
    Err(WaitError::TimedOut(steps))
}
