//! Request context carrying cancellation and deadlines.
//!
//! Every ledger operation takes a `Context` as its first argument. Cancelling
//! the context, or letting its deadline pass, aborts the in-flight operation
//! with `BankError::Cancelled` or `BankError::DeadlineExceeded`.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{BankError, Result};

/// Cancellation scope for a ledger operation.
///
/// Derived contexts are cancelled together with their parent and never outlive
/// the parent's deadline.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Root context, never cancelled and without deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a context that can be cancelled independently of its parent.
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a context expiring after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context expiring at `deadline`, or earlier if the parent does.
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

    /// Cancel this context and all contexts derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Get the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Get the reason this context is done, if it is.
    pub fn err(&self) -> Option<BankError> {
        if self.token.is_cancelled() {
            Some(BankError::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(BankError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait until the context is cancelled or its deadline passes.
    pub async fn done(&self) -> BankError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => BankError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => BankError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                BankError::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    ///
    /// When the context wins, `fut` is dropped before this returns.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
