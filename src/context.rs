use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::QuoteStoreError;

/// Cancellation and deadline carried by every store operation.
///
/// When either fires, the guarded future is dropped. A statement still running on
/// the server is cancelled, an open transaction is rolled back, and the
/// connection goes back to the pool.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// No deadline and a fresh token.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_at(Instant::now() + timeout)
    }

    /// Derive a context that is cancelled when `token` is.
    #[must_use]
    pub fn with_cancel(token: &CancellationToken) -> Self {
        Self {
            cancel: token.child_token(),
            deadline: None,
        }
    }

    /// Tighten the deadline; a later instant than the current one is ignored.
    #[must_use]
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` to completion unless the context is cancelled or expires first.
    ///
    /// # Errors
    /// Returns `Canceled` or `DeadlineExceeded` labelled with `op`, or whatever `fut` yields.
    pub async fn guard<F, T>(&self, op: &str, fut: F) -> Result<T, QuoteStoreError>
    where
        F: Future<Output = Result<T, QuoteStoreError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(QuoteStoreError::Canceled(op.to_string()));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(QuoteStoreError::DeadlineExceeded(op.to_string()));
        }

        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(QuoteStoreError::Canceled(op.to_string())),
            () = expiry => Err(QuoteStoreError::DeadlineExceeded(op.to_string())),
            res = fut => res,
        }
    }
}
