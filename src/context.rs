//! Cancellation and deadline context / 取消与超时上下文
//!
//! Every bucket operation takes a [`Context`]. Cancelling it (or letting its
//! deadline pass) makes the pending operation return `Canceled`; the
//! operation's future is dropped, which releases any file or connection it
//! held.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::storage::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Context that is never cancelled on its own / 永不取消的上下文
    pub fn background() -> Self {
        Self::default()
    }

    /// Child context, cancelled when `self` is cancelled or by its own `cancel`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child context that additionally expires after `timeout` / 带超时的子上下文
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Fail with `Canceled` if the context is already done / 检查是否已取消
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::canceled("context canceled"));
        }
        if self.deadline.map_or(false, |d| Instant::now() >= d) {
            return Err(Error::canceled("context deadline exceeded"));
        }
        Ok(())
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Error::canceled("context canceled"),
            _ = deadline => Error::canceled("context deadline exceeded"),
        }
    }

    /// Drive `fut` to completion unless the context finishes first, in which
    /// case `fut` is dropped and `Canceled` is returned.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}
