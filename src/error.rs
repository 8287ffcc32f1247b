use thiserror::Error;

/// Failures surfaced by the pool and the quote store.
///
/// Every message carries the operation name (and the id or author involved,
/// when there is one) so callers can log it without extra context.
#[derive(Debug, Error)]
pub enum QuoteStoreError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("connection error: {0}")]
    ConnectError(String),

    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("connection pool is stopped")]
    PoolClosed,

    #[error("storage is not initialized")]
    Uninitialized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    StorageError {
        context: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("transaction already closed")]
    TxClosed,
}

impl QuoteStoreError {
    pub(crate) fn storage(context: impl Into<String>, source: tokio_postgres::Error) -> Self {
        Self::StorageError {
            context: context.into(),
            source,
        }
    }

    /// Prefix a storage failure's context with the operation that hit it.
    pub(crate) fn within(self, op: &str) -> Self {
        match self {
            Self::StorageError { context, source } => Self::StorageError {
                context: format!("{op}: {context}"),
                source,
            },
            other => other,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Pool exhaustion, deadline and cancellation; the caller owns retry policy.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted(_) | Self::DeadlineExceeded(_) | Self::Canceled(_)
        )
    }

    /// Rolling back a transaction that is already gone is not a failure.
    #[must_use]
    pub fn is_benign_rollback(&self) -> bool {
        matches!(self, Self::TxClosed)
    }
}
