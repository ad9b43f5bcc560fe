//! Per-call deadline and cancellation.
//!
//! Every call that crosses the plugin process boundary takes a [`CallContext`]
//! so a wedged backend process can never hang the caller past its deadline.

use crate::errors::{Result, WardenError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default deadline used when a caller does not supply one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline plus cancellation signal for one logical operation
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl CallContext {
    /// Context expiring `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { deadline: Instant::now() + timeout, cancel: CancellationToken::new() }
    }

    /// Context expiring `timeout` from now and cancelled together with `parent`
    pub fn with_parent(timeout: Duration, parent: &CancellationToken) -> Self {
        Self { deadline: Instant::now() + timeout, cancel: parent.child_token() }
    }

    /// Child context sharing cancellation, with a deadline no later than ours
    pub fn child(&self, timeout: Duration) -> Self {
        let deadline = std::cmp::min(self.deadline, Instant::now() + timeout);
        Self { deadline, cancel: self.cancel.child_token() }
    }

    /// Time left before the deadline (zero once passed)
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Absolute deadline
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Cancellation token observed by this context
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this context and every child derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the context was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `future` until it completes, the deadline passes or the context
    /// is cancelled.
    pub async fn run<F, T>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(WardenError::cancelled(operation));
        }

        let budget = self.remaining();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WardenError::cancelled(operation)),
            result = tokio::time::timeout_at(self.deadline, future) => match result {
                Ok(inner) => inner,
                Err(_) => Err(WardenError::timeout(operation, budget.as_millis() as u64)),
            },
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_CALL_TIMEOUT)
    }
}
