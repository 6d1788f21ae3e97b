//! Cancellable operation context.
//!
//! Every blocking client operation (connect, disconnect, command dispatch)
//! takes a [`Context`]. A context ends when its token is cancelled or when its
//! deadline passes, whichever happens first.

use std::future::Future;
use std::time::Duration;

use ouroboros_common::{DriverError, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that never ends on its own
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derive a context that ends when this one does, or earlier if
    /// `timeout` elapses first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) => parent.min(deadline),
                None => deadline,
            }),
        }
    }

    /// Derive a context sharing this deadline whose cancellation does not
    /// propagate upwards.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Why the context ended, if it has
    pub fn err(&self) -> Option<DriverError> {
        if self.token.is_cancelled() {
            return Some(DriverError::Cancelled("context cancelled".to_string()));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(DriverError::Timeout(
                "context deadline exceeded".to_string(),
            )),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Race `fut` against the context.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `Timeout` if the context ends before `fut`
    /// completes. An already-ended context never polls `fut`.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            _ = self.done() => Err(self.err().unwrap_or_else(|| {
                DriverError::Cancelled("context ended".to_string())
            })),
        }
    }
}
