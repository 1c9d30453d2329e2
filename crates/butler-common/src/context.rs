//! Run context: one cancellation token plus an optional deadline
//!
//! Every blocking step of a bootstrap run takes a [`RunContext`]. Cancelling the
//! token (e.g., on SIGINT) or passing the deadline makes the active step return
//! [`Error::Cancelled`] or [`Error::Timeout`] respectively, so callers can tell
//! "told to stop" apart from "ran out of time" without inspecting messages.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{Error, Result};

/// Default interval between readiness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Floor applied to every poll interval so that no loop can spin
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cancellable, optionally deadline-bounded context for a run
#[derive(Clone, Debug)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    /// Context bound only by the given token
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Context bound by the given token and a deadline `timeout` from now
    pub fn with_timeout(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derive a context with a tighter deadline.
    ///
    /// The child expires at whichever comes first: the parent's deadline or
    /// `timeout` from now. Cancelling the parent cancels the child, but not
    /// the other way round.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => parent.min(candidate),
            None => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// The underlying cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Deadline of this context, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every child derived from it. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once the context has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Return the context's error if it is already done
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::timeout(operation));
            }
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context finishes first.
    ///
    /// The future is dropped on cancellation or deadline, which is what lets a
    /// long external command or API call observe an interrupt.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(operation)?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = sleep_until_deadline(self.deadline) => Err(Error::timeout(operation)),
            res = fut => res,
        }
    }

    /// Sleep for `duration`, waking early on cancellation or deadline
    pub async fn sleep(&self, operation: &str, duration: Duration) -> Result<()> {
        let wake = Instant::now() + duration;
        let wake = match self.deadline {
            Some(deadline) if deadline < wake => deadline,
            _ => wake,
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(wake) => self.check(operation),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Poll until `check` yields a value, the context is cancelled, or the deadline passes.
///
/// Shared by every wait in a bootstrap run (CRD establishment, workload
/// readiness, bootstrap status). The context is checked before each attempt
/// and observed during both the attempt and the pause between attempts;
/// on cancellation or deadline the context's own error is returned unchanged.
///
/// # Arguments
/// * `ctx` - Context bounding the wait
/// * `operation` - Description used in the timeout error and trace logs
/// * `interval` - Pause between attempts, never less than [`MIN_POLL_INTERVAL`]
/// * `check` - Returns `Ok(Some(v))` when done, `Ok(None)` to keep polling, or
///   `Err` to abort. Callers that want to tolerate transient errors convert
///   them to `Ok(None)` themselves.
pub async fn poll_until<T, F, Fut>(
    ctx: &RunContext,
    operation: &str,
    interval: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let interval = interval.max(MIN_POLL_INTERVAL);

    loop {
        ctx.check(operation)?;

        if let Some(value) = ctx.run(operation, check()).await? {
            return Ok(value);
        }

        trace!(operation, "condition not yet met, retrying");
        ctx.sleep(operation, interval).await?;
    }
}
