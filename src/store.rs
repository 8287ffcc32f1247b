//! The five quote operations.
//!
//! Each operation borrows one connection for its whole duration, runs one
//! statement (inside a transaction for writes) and returns the connection on
//! every exit path, including cancellation.

use async_trait::async_trait;

use crate::context::OpContext;
use crate::error::QuoteStoreError;
use crate::model::Quote;
use crate::postgres::query::{
    DELETE_QUOTE, INSERT_QUOTE, SELECT_ALL_QUOTES, SELECT_QUOTES_BY_AUTHOR, SELECT_RANDOM_QUOTE,
};
use crate::postgres::{ConnectionPool, Idle, InTx, PgConnection, abort};

/// Durable quote operations consumed by the application layer.
///
/// `author` and `text` are expected to be validated by the caller.
#[async_trait]
pub trait QuoteStorage: Send + Sync {
    async fn add_quote(
        &self,
        ctx: &OpContext,
        author: &str,
        text: &str,
    ) -> Result<i64, QuoteStoreError>;

    async fn get_all_quotes(&self, ctx: &OpContext) -> Result<Vec<Quote>, QuoteStoreError>;

    async fn get_random_quote(&self, ctx: &OpContext) -> Result<Quote, QuoteStoreError>;

    async fn get_quotes_by_author(
        &self,
        ctx: &OpContext,
        author: &str,
    ) -> Result<Vec<Quote>, QuoteStoreError>;

    async fn delete_quote(&self, ctx: &OpContext, id: i64) -> Result<(), QuoteStoreError>;
}

enum Insert {
    Committed(i64),
    Rejected(PgConnection<InTx>, QuoteStoreError),
}

/// Quote operations over a PostgreSQL pool.
#[derive(Debug)]
pub struct QuoteStore {
    pool: ConnectionPool,
}

impl QuoteStore {
    #[must_use]
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn connect(
        &self,
        ctx: &OpContext,
        op: &str,
    ) -> Result<PgConnection<Idle>, QuoteStoreError> {
        let lease = self.pool.acquire(ctx, op).await?;
        Ok(PgConnection::from_lease(lease))
    }

    async fn fetch_all(
        &self,
        ctx: &OpContext,
        op: &str,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Quote>, QuoteStoreError> {
        let conn = self.connect(ctx, op).await?;
        let rows = conn.query(op, sql, params).await?;
        conn.release();
        rows.iter()
            .map(|row| Quote::from_row(row).map_err(|e| QuoteStoreError::storage(op, e)))
            .collect()
    }

    /// Insert a quote in its own transaction and return the new id.
    ///
    /// # Errors
    /// Acquire failures, or `StorageError` when the insert or commit fails; in that
    /// case no row is visible.
    pub async fn add_quote(
        &self,
        ctx: &OpContext,
        author: &str,
        text: &str,
    ) -> Result<i64, QuoteStoreError> {
        let op = format!("add_quote author={author:?}");
        let outcome = ctx
            .guard(&op, async {
                let tx = self
                    .connect(ctx, &op)
                    .await?
                    .begin()
                    .await
                    .map_err(|e| e.within(&op))?;

                let inserted: Result<i64, QuoteStoreError> = tx
                    .query_one(&op, INSERT_QUOTE, &[&author, &text])
                    .await
                    .and_then(|row| {
                        row.try_get("id")
                            .map_err(|e| QuoteStoreError::storage(op.as_str(), e))
                    });
                match inserted {
                    Ok(id) => {
                        tx.commit().await.map_err(|e| e.within(&op))?.release();
                        Ok(Insert::Committed(id))
                    }
                    Err(err) => Ok(Insert::Rejected(tx, err)),
                }
            })
            .await?;

        // unguarded: the caller sees the insert's error even if ctx expires now
        match outcome {
            Insert::Committed(id) => {
                tracing::debug!(id, author, "quote added");
                Ok(id)
            }
            Insert::Rejected(tx, err) => {
                tracing::debug!(op = %op, error = %err, "insert failed, rolling back");
                Err(abort(tx, err).await)
            }
        }
    }

    /// All quotes, newest first. An empty store yields an empty vec.
    ///
    /// # Errors
    /// Acquire failures or `StorageError`.
    pub async fn get_all_quotes(&self, ctx: &OpContext) -> Result<Vec<Quote>, QuoteStoreError> {
        let op = "get_all_quotes";
        ctx.guard(op, self.fetch_all(ctx, op, SELECT_ALL_QUOTES, &[]))
            .await
    }

    /// One quote drawn uniformly from the stored ones.
    ///
    /// # Errors
    /// `NotFound` when the store is empty; acquire failures or `StorageError`.
    pub async fn get_random_quote(&self, ctx: &OpContext) -> Result<Quote, QuoteStoreError> {
        let op = "get_random_quote";
        ctx.guard(op, async {
            let conn = self.connect(ctx, op).await?;
            let row = conn.query_opt(op, SELECT_RANDOM_QUOTE, &[]).await?;
            conn.release();
            match row {
                Some(row) => Quote::from_row(&row).map_err(|e| QuoteStoreError::storage(op, e)),
                None => Err(QuoteStoreError::NotFound(format!("{op}: store is empty"))),
            }
        })
        .await
    }

    /// Quotes whose author equals `author` exactly, newest first.
    ///
    /// # Errors
    /// Acquire failures or `StorageError`.
    pub async fn get_quotes_by_author(
        &self,
        ctx: &OpContext,
        author: &str,
    ) -> Result<Vec<Quote>, QuoteStoreError> {
        let op = format!("get_quotes_by_author author={author:?}");
        ctx.guard(&op, self.fetch_all(ctx, &op, SELECT_QUOTES_BY_AUTHOR, &[&author]))
            .await
    }

    /// Hard-delete the quote with `id`.
    ///
    /// # Errors
    /// `NotFound` when no row has that id; acquire failures or `StorageError`.
    pub async fn delete_quote(&self, ctx: &OpContext, id: i64) -> Result<(), QuoteStoreError> {
        let op = format!("delete_quote id={id}");
        ctx.guard(&op, async {
            let conn = self.connect(ctx, &op).await?;
            let affected = conn.execute(&op, DELETE_QUOTE, &[&id]).await?;
            conn.release();
            // id is the primary key, so at most one row matches
            if affected == 0 {
                return Err(QuoteStoreError::NotFound(op.clone()));
            }
            tracing::debug!(id, "quote deleted");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl QuoteStorage for QuoteStore {
    async fn add_quote(
        &self,
        ctx: &OpContext,
        author: &str,
        text: &str,
    ) -> Result<i64, QuoteStoreError> {
        QuoteStore::add_quote(self, ctx, author, text).await
    }

    async fn get_all_quotes(&self, ctx: &OpContext) -> Result<Vec<Quote>, QuoteStoreError> {
        QuoteStore::get_all_quotes(self, ctx).await
    }

    async fn get_random_quote(&self, ctx: &OpContext) -> Result<Quote, QuoteStoreError> {
        QuoteStore::get_random_quote(self, ctx).await
    }

    async fn get_quotes_by_author(
        &self,
        ctx: &OpContext,
        author: &str,
    ) -> Result<Vec<Quote>, QuoteStoreError> {
        QuoteStore::get_quotes_by_author(self, ctx, author).await
    }

    async fn delete_quote(&self, ctx: &OpContext, id: i64) -> Result<(), QuoteStoreError> {
        QuoteStore::delete_quote(self, ctx, id).await
    }
}
