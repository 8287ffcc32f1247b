//! Request validation and error classification in front of [`QuoteStorage`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::OpContext;
use crate::error::QuoteStoreError;
use crate::lifecycle::{Service, ServiceError};
use crate::model::Quote;
use crate::store::QuoteStorage;

#[derive(Debug, Clone, Deserialize)]
pub struct AddQuoteRequest {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub quote: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AddQuoteResponse {
    pub id: i64,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    NotFound(QuoteStoreError),

    /// Pool exhausted, deadline exceeded or canceled; retrying may succeed.
    #[error(transparent)]
    Unavailable(QuoteStoreError),

    #[error(transparent)]
    Storage(QuoteStoreError),
}

impl From<QuoteStoreError> for AppError {
    fn from(err: QuoteStoreError) -> Self {
        if err.is_not_found() {
            Self::NotFound(err)
        } else if err.is_transient() {
            Self::Unavailable(err)
        } else {
            Self::Storage(err)
        }
    }
}

fn required(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} is required")));
    }
    Ok(())
}

pub struct QuoteService {
    storage: Arc<dyn QuoteStorage>,
}

impl QuoteService {
    #[must_use]
    pub fn new(storage: Arc<dyn QuoteStorage>) -> Self {
        Self { storage }
    }

    /// # Errors
    /// `Validation` if `author` or `quote` is blank; otherwise the storage error.
    pub async fn add_quote(
        &self,
        ctx: &OpContext,
        req: AddQuoteRequest,
    ) -> Result<AddQuoteResponse, AppError> {
        required("author", &req.author)?;
        required("quote", &req.quote)?;
        match self.storage.add_quote(ctx, &req.author, &req.quote).await {
            Ok(id) => Ok(AddQuoteResponse { id }),
            Err(err) => {
                tracing::error!(op = "add_quote", author = %req.author, error = %err, "failed to add quote");
                Err(err.into())
            }
        }
    }

    /// # Errors
    /// Storage failures.
    pub async fn get_all_quotes(&self, ctx: &OpContext) -> Result<Vec<Quote>, AppError> {
        self.storage.get_all_quotes(ctx).await.map_err(|err| {
            tracing::error!(op = "get_all_quotes", error = %err, "failed to list quotes");
            err.into()
        })
    }

    /// `None` when there are no quotes yet.
    ///
    /// # Errors
    /// Storage failures.
    pub async fn get_random_quote(&self, ctx: &OpContext) -> Result<Option<Quote>, AppError> {
        match self.storage.get_random_quote(ctx).await {
            Ok(quote) => Ok(Some(quote)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => {
                tracing::error!(op = "get_random_quote", error = %err, "failed to pick a quote");
                Err(err.into())
            }
        }
    }

    /// # Errors
    /// `Validation` if `author` is blank; otherwise storage failures.
    pub async fn get_quotes_by_author(
        &self,
        ctx: &OpContext,
        author: &str,
    ) -> Result<Vec<Quote>, AppError> {
        required("author", author)?;
        self.storage
            .get_quotes_by_author(ctx, author)
            .await
            .map_err(|err| {
                tracing::error!(op = "get_quotes_by_author", author, error = %err, "failed to list quotes");
                err.into()
            })
    }

    /// # Errors
    /// `Validation` for id 0, `NotFound` when no quote has `id`.
    pub async fn delete_quote(&self, ctx: &OpContext, id: i64) -> Result<(), AppError> {
        if id == 0 {
            return Err(AppError::Validation("id is required".to_string()));
        }
        self.storage.delete_quote(ctx, id).await.map_err(|err| {
            if !err.is_not_found() {
                tracing::error!(op = "delete_quote", id, error = %err, "failed to delete quote");
            }
            err.into()
        })
    }
}

#[async_trait]
impl Service for QuoteService {
    fn name(&self) -> &'static str {
        "application"
    }

    async fn init(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn run(&self, _shutdown: CancellationToken) {}

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Only counts calls; validation must reject before storage is reached.
    #[derive(Default)]
    struct CountingStorage {
        calls: Mutex<usize>,
    }

    impl CountingStorage {
        fn hit(&self) {
            *self.calls.lock().unwrap() += 1;
        }
    }

    #[async_trait]
    impl QuoteStorage for CountingStorage {
        async fn add_quote(&self, _: &OpContext, _: &str, _: &str) -> Result<i64, QuoteStoreError> {
            self.hit();
            Ok(1)
        }

        async fn get_all_quotes(&self, _: &OpContext) -> Result<Vec<Quote>, QuoteStoreError> {
            self.hit();
            Ok(Vec::new())
        }

        async fn get_random_quote(&self, _: &OpContext) -> Result<Quote, QuoteStoreError> {
            self.hit();
            Err(QuoteStoreError::NotFound("get_random_quote: store is empty".into()))
        }

        async fn get_quotes_by_author(
            &self,
            _: &OpContext,
            _: &str,
        ) -> Result<Vec<Quote>, QuoteStoreError> {
            self.hit();
            Ok(Vec::new())
        }

        async fn delete_quote(&self, _: &OpContext, id: i64) -> Result<(), QuoteStoreError> {
            self.hit();
            Err(QuoteStoreError::PoolExhausted(format!("delete_quote id={id}")))
        }
    }

    fn service() -> (QuoteService, Arc<CountingStorage>) {
        let storage = Arc::new(CountingStorage::default());
        (QuoteService::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn blank_fields_never_reach_storage() {
        let (svc, storage) = service();
        let ctx = OpContext::background();

        let req = AddQuoteRequest {
            author: "  ".into(),
            quote: "q".into(),
        };
        assert!(matches!(svc.add_quote(&ctx, req).await, Err(AppError::Validation(m)) if m.contains("author")));
        let req = AddQuoteRequest {
            author: "a".into(),
            quote: String::new(),
        };
        assert!(matches!(svc.add_quote(&ctx, req).await, Err(AppError::Validation(m)) if m.contains("quote")));
        assert!(matches!(svc.get_quotes_by_author(&ctx, "").await, Err(AppError::Validation(_))));
        assert!(matches!(svc.delete_quote(&ctx, 0).await, Err(AppError::Validation(_))));

        assert_eq!(*storage.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_store_yields_no_random_quote() {
        let (svc, _) = service();
        let out = svc.get_random_quote(&OpContext::background()).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn transient_storage_errors_are_unavailable() {
        let (svc, _) = service();
        let err = svc.delete_quote(&OpContext::background(), 7).await.unwrap_err();
        assert!(matches!(err, AppError::Unavailable(QuoteStoreError::PoolExhausted(_))));
    }

    #[test]
    fn storage_errors_classify() {
        assert!(matches!(
            AppError::from(QuoteStoreError::NotFound("x".into())),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            AppError::from(QuoteStoreError::Canceled("x".into())),
            AppError::Unavailable(_)
        ));
        assert!(matches!(AppError::from(QuoteStoreError::PoolClosed), AppError::Storage(_)));
    }
}
