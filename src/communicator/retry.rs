//! Retrying fallible async operations with capped exponential backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of a failed attempt: try again, or give up immediately.
#[derive(Debug)]
pub enum Failure<E> {
    Retry(E),
    Fatal(E),
}

impl<E> From<E> for Failure<E> {
    fn from(err: E) -> Self {
        Failure::Retry(err)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// An attempt returned `Failure::Fatal`.
    Fatal(E),
    /// The attempt budget ran out; carries the last attempt's error.
    Exhausted(E),
    /// The context was cancelled.
    Interrupted(Option<E>),
    /// The context deadline passed.
    Timeout(Option<E>),
}

impl<E> RetryError<E> {
    /// The most recent error returned by the operation, if any.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Fatal(e) | RetryError::Exhausted(e) => Some(e),
            RetryError::Interrupted(e) | RetryError::Timeout(e) => e.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Fatal(e) | RetryError::Exhausted(e) => Some(e),
            RetryError::Interrupted(e) | RetryError::Timeout(e) => e,
        }
    }
}

fn fmt_last<E: fmt::Display>(f: &mut fmt::Formatter<'_>, last: &Option<E>) -> fmt::Result {
    match last {
        Some(e) => write!(f, "{}", e),
        None => write!(f, "<nil>"),
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Fatal(e) | RetryError::Exhausted(e) => write!(f, "{}", e),
            RetryError::Interrupted(last) => {
                write!(f, "interrupted: last error: ")?;
                fmt_last(f, last)
            }
            RetryError::Timeout(last) => {
                write!(f, "timeout: last error: ")?;
                fmt_last(f, last)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries until the context ends.
    pub max_attempts: Option<usize>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(20),
            max_attempts: None,
        }
    }
}

impl Backoff {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Cancellation and optional deadline bounding a retry loop.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

enum Stop {
    Cancelled,
    DeadlinePassed,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn stopped(&self) -> Option<Stop> {
        if self.cancel.is_cancelled() {
            return Some(Stop::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Stop::DeadlinePassed),
            _ => None,
        }
    }

    async fn done(&self) -> Stop {
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Stop::Cancelled,
            _ = deadline => Stop::DeadlinePassed,
        }
    }
}

impl Stop {
    fn into_error<E>(self, last: Option<E>) -> RetryError<E> {
        match self {
            Stop::Cancelled => RetryError::Interrupted(last),
            Stop::DeadlinePassed => RetryError::Timeout(last),
        }
    }
}

/// Runs `op` until it succeeds, fails fatally, or `ctx` ends, using the
/// default backoff (1s doubling to 20s).
pub async fn retry<T, E, F, Fut>(ctx: &RetryContext, op: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Failure<E>>>,
    E: fmt::Display,
{
    retry_with(ctx, &Backoff::default(), op).await
}

pub async fn retry_with<T, E, F, Fut>(
    ctx: &RetryContext,
    backoff: &Backoff,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Failure<E>>>,
    E: fmt::Display,
{
    if let Some(stop) = ctx.stopped() {
        return Err(stop.into_error(None));
    }

    let mut delay = backoff.initial;
    let mut last: Option<E> = None;
    let mut attempts = 0usize;

    loop {
        attempts += 1;
        let outcome = tokio::select! {
            outcome = op() => outcome,
            stop = ctx.done() => return Err(stop.into_error(last)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(Failure::Fatal(e)) => return Err(RetryError::Fatal(e)),
            Err(Failure::Retry(e)) => {
                debug!(attempt = attempts, delay = ?delay, error = %e, "retryable error");
                if backoff.max_attempts.is_some_and(|max| attempts >= max) {
                    return Err(RetryError::Exhausted(e));
                }
                last = Some(e);
            }
        }

        tokio::select! {
            _ = sleep(delay) => {}
            stop = ctx.done() => return Err(stop.into_error(last)),
        }
        delay = backoff.next_delay(delay);
    }
}
