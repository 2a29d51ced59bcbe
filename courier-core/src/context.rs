//! Cancellation and deadline propagation.
//!
//! Every dispatch takes a [`Context`]. Cancellation is cooperative: it stops a
//! caller from *waiting*, it never aborts a handler that is already running.

use crate::error::CancellationError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Caller-supplied cancellation signal with an optional deadline.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wrap an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child that is cancelled with this context, or on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child that also expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child that also expires at `deadline`.
    ///
    /// The earlier of the parent's and the given deadline wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<CancellationError> {
        if self.token.is_cancelled() {
            return Some(CancellationError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => {
                Some(CancellationError::DeadlineExceeded)
            }
            _ => None,
        }
    }

    /// Check whether the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Wait until the context is cancelled or its deadline passes.
    pub async fn done(&self) -> CancellationError {
        if let Some(reason) = self.err() {
            return reason;
        }
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => CancellationError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancellationError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancellationError::Cancelled
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_is_live() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert_eq!(ctx.err(), None);
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();

        assert_eq!(child.err(), Some(CancellationError::Cancelled));
        assert_eq!(child.done().await, CancellationError::Cancelled);
    }

    #[tokio::test]
    async fn child_cancel_leaves_parent_alone() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();

        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        assert!(!ctx.is_done());

        assert_eq!(ctx.done().await, CancellationError::DeadlineExceeded);
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn expired_deadline_resolves_immediately() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert_eq!(ctx.err(), Some(CancellationError::DeadlineExceeded));
        assert_eq!(ctx.done().await, CancellationError::DeadlineExceeded);
    }

    #[test]
    fn cancelled_context_resolves_on_any_runtime() {
        let ctx = Context::background();
        ctx.cancel();
        assert_eq!(tokio_test::block_on(ctx.done()), CancellationError::Cancelled);
    }

    #[tokio::test]
    async fn earlier_deadline_wins() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
