//! Request context: cancellation plus an optional deadline.
//!
//! Every network call made on behalf of an admission request runs through
//! [`RequestContext::run`], so a timed-out or cancelled request drops the
//! in-flight call instead of blocking the worker.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CancelReason;

#[derive(Debug, Clone)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Child of `parent` that additionally expires after `timeout`.
    pub fn with_timeout(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel: parent.child_token(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive `fut` to completion unless the context is cancelled or expires first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CancelReason> {
        if self.cancel.is_cancelled() {
            return Err(CancelReason::Cancelled);
        }

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CancelReason::Cancelled),
            _ = expired => Err(CancelReason::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}
