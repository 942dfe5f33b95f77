//! Cancellable, deadline-bound execution scopes.
//!
//! Every long-running operation in this crate accepts a [`CallScope`]. The
//! scope carries a [`CancellationToken`] and an optional wall-clock deadline.
//! Sleeping, polling rounds and streamed uploads all observe it, so a caller
//! can abort a whole upload or download from the outside.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bundlex_core::CallScope;
//!
//! # async fn example() {
//! let scope = CallScope::with_timeout(Duration::from_secs(30));
//! let child = scope.child();
//! scope.cancel();
//! assert!(child.is_cancelled());
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::ClientError;

/// Cancellation token plus optional deadline shared by one logical call.
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallScope {
    /// Creates a scope with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scope that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Creates a scope that expires at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Returns a child scope: cancelling the parent cancels the child, not
    /// the other way around. The child inherits the parent's deadline.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Returns a child scope whose deadline is the earlier of the parent's
    /// and `deadline`.
    #[must_use]
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Signals cancellation to this scope and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called on this scope
    /// or an ancestor.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the underlying token, for handing to spawned workers.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fails with [`ClientError::Cancelled`] or [`ClientError::DeadlineExceeded`]
    /// if the scope is already done.
    ///
    /// # Errors
    ///
    /// Returns the scope's terminal error when cancelled or expired.
    pub fn check(&self) -> Result<(), ClientError> {
        if self.token.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(ClientError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Sleeps for `duration`, clipped to the deadline.
    ///
    /// If the deadline falls inside the requested sleep, this sleeps until the
    /// deadline and returns [`ClientError::DeadlineExceeded`] instead of
    /// overshooting it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Cancelled`] if cancelled while sleeping, or
    /// [`ClientError::DeadlineExceeded`] if the deadline is reached.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ClientError> {
        self.check()?;
        let wake = Instant::now() + duration;
        match self.deadline {
            Some(deadline) if deadline <= wake => {
                tokio::select! {
                    () = self.token.cancelled() => Err(ClientError::Cancelled),
                    () = tokio::time::sleep_until(deadline) => Err(ClientError::DeadlineExceeded),
                }
            }
            _ => {
                tokio::select! {
                    () = self.token.cancelled() => Err(ClientError::Cancelled),
                    () = tokio::time::sleep_until(wake) => Ok(()),
                }
            }
        }
    }

    /// Drives `future` to completion unless the scope is cancelled or its
    /// deadline passes first.
    ///
    /// # Errors
    ///
    /// Returns the future's own error, or the scope's terminal error.
    pub async fn run<T, F>(&self, future: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => Err(ClientError::Cancelled),
                    () = tokio::time::sleep_until(deadline) => Err(ClientError::DeadlineExceeded),
                    result = future => result,
                }
            }
            None => {
                tokio::select! {
                    () = self.token.cancelled() => Err(ClientError::Cancelled),
                    result = future => result,
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_clipped_to_deadline() {
        let scope = CallScope::with_timeout(Duration::from_millis(300));
        let started = Instant::now();

        let result = scope.sleep(Duration::from_secs(10)).await;

        assert!(matches!(result, Err(ClientError::DeadlineExceeded)));
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_within_deadline_completes() {
        let scope = CallScope::with_timeout(Duration::from_secs(5));
        scope.sleep(Duration::from_secs(1)).await.unwrap();
        assert!(scope.remaining().unwrap() <= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let scope = CallScope::new();
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = scope.sleep(Duration::from_secs(60)).await;

        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_child_observes_parent_cancel() {
        let parent = CallScope::new();
        let child = parent.child();
        parent.cancel();
        assert!(matches!(child.check(), Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_reach_parent() {
        let parent = CallScope::new();
        let child = parent.child();
        child.cancel();
        assert!(parent.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_with_deadline_keeps_earlier() {
        let parent = CallScope::with_timeout(Duration::from_secs(1));
        let child = parent.child_with_deadline(Instant::now() + Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_deadline() {
        let scope = CallScope::with_timeout(Duration::from_millis(10));
        let result: Result<(), ClientError> = scope
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ClientError::DeadlineExceeded)));
    }
}
