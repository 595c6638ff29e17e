//! Cancellation and deadlines for copy operations.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{InjectError, Result};

/// Cancellation signal threaded through every blocking step of a copy.
///
/// Cloning shares the underlying token, so cancelling any clone cancels them all.
/// Archive encoding polls [`CopyContext::check`] between entries; runtime calls are
/// raced against the signal with [`CopyContext::run`].
#[derive(Debug, Clone, Default)]
pub struct CopyContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CopyContext {
    /// A context that is never cancelled unless [`CopyContext::cancel`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline(Instant::now() + timeout)
    }

    /// Wrap an existing cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set an absolute deadline; an earlier existing deadline is kept.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    /// The configured deadline, if any.
    pub fn deadline_at(&self) -> Option<Instant> {
        self.deadline
    }

    /// The underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with [`InjectError::Canceled`] once the context is done.
    pub fn check(&self) -> Result<()> {
        if self.is_done() {
            return Err(InjectError::Canceled);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context finishes first.
    ///
    /// On cancellation `fut` is dropped, which closes any connection it holds.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(InjectError::Canceled),
            _ = expiry => Err(InjectError::Canceled),
            result = fut => result,
        }
    }
}
