//! Cancellation context carried through an execution.
//!
//! A [`Context`] pairs a cancellation token with an optional deadline. Every
//! suspension point in the engine (sending, backoff, body reads) is raced
//! against [`Context::done`], and the race is biased so that cancellation wins
//! whenever both sides are ready.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelReason {
    /// The token was canceled explicitly
    #[error("context canceled")]
    Canceled,
    /// The deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation token with an optional deadline
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never canceled and has no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a child context that expires after `timeout`.
    ///
    /// The child keeps the parent's deadline when that one is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that expires at `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child context that can be canceled without affecting this one
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if one was set
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why the context is done, or `None` while it is still live
    pub fn err(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(CancelReason::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Check if the context is done
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is canceled or its deadline passes
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => CancelReason::Canceled,
                    _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Canceled
            }
        }
    }

    /// Run `fut` until it completes or the context finishes, whichever is first
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, CancelReason>
    where
        F: Future,
    {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            output = fut => Ok(output),
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
    async fn test_background_never_done() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wins_over_slow_future() {
        let ctx = Context::background().with_timeout(Duration::from_millis(500));
        let started = Instant::now();
        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(result, Err(CancelReason::DeadlineExceeded));
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.err(), Some(CancelReason::Canceled));
        assert_eq!(child.done().await, CancelReason::Canceled);
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_alive() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test]
    async fn test_child_keeps_earlier_deadline() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(30));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_run_on_finished_context_skips_future() {
        let ctx = Context::background();
        ctx.cancel();
        let result = ctx.run(async { panic!("must not be polled") }).await;
        assert_eq!(result, Err::<(), _>(CancelReason::Canceled));
    }
}
