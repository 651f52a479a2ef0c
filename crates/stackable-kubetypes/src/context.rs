//! Per-call execution context carrying a cancellation signal and an optional deadline.
//!
//! Every operation of the client contracts takes a [`Context`] as its first argument. A call
//! started with a context that is already done fails right away. A call in flight when the
//! context is cancelled (or its deadline passes) is aborted and surfaces a [`ContextError`].
//!
//! ```
//! # use std::time::Duration;
//! use stackable_kubetypes::Context;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let root = Context::background();
//! let ctx = root.with_timeout(Duration::from_secs(5));
//!
//! root.cancel();
//! assert!(ctx.is_cancelled());
//! # }
//! ```
use std::{future::Future, time::Duration};

use snafu::Snafu;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The reason a [`Context`] is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum ContextError {
    #[snafu(display("context cancelled"))]
    Cancelled,

    #[snafu(display("context deadline exceeded"))]
    DeadlineExceeded,
}

#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Returns a context that is never cancelled on its own and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context which is cancelled together with `self`, but can also be cancelled on
    /// its own without affecting `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child context which expires after `timeout`, or earlier if `self` expires first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a child context which expires at `deadline`, or earlier if `self` expires first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns why the context is done, or [`None`] if it is still live.
    ///
    /// Cancellation takes precedence over an elapsed deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }

        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline has passed.
    pub async fn done(&self) -> ContextError {
        if let Some(err) = self.err() {
            return err;
        }

        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Same as [`Context::done`], but owns the context so the future can be moved into
    /// `'static` streams and tasks.
    pub fn into_done(self) -> impl Future<Output = ContextError> + Send + 'static {
        async move { self.done().await }
    }

    /// Drives `future` to completion unless the context is done first.
    ///
    /// The future is not polled at all if the context is already done.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            err = self.done() => Err(err),
            output = future => Ok(output),
        }
    }
}
