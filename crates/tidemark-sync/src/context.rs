//! Cancellation and deadline context shared by one task tree.
//!
//! Checks are cooperative: code calls [`TaskContext::check`] at page and
//! dispatch boundaries, and wraps collaborator calls in
//! [`TaskContext::run`] so an in-flight call is dropped once the deadline
//! passes or the tree is cancelled.

use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Error, Result};

/// Cancellation token plus optional working deadline.
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl TaskContext {
    /// Creates a root context.
    #[must_use]
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline,
        }
    }

    /// Creates a root context without a deadline.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Creates a child that is cancelled with this context but can also be
    /// cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// Returns the working deadline.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns a guard that cancels this context when dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    /// Returns true if this context was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Fails if the deadline passed or the context was cancelled.
    ///
    /// The deadline is checked first so a deadline-triggered stop is never
    /// reported as a plain cancellation.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeadlineExceeded` or `Error::Cancelled`.
    pub fn check(&self) -> Result<()> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Runs `fut` unless the deadline passes or the context is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeadlineExceeded` or `Error::Cancelled` if `fut` was
    /// dropped, or whatever `fut` itself returned.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            () = deadline => Err(Error::DeadlineExceeded),
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result.map_err(Into::into),
        }
    }
}
