//! Schema for the `quotes` relation.
//!
//! The service normally runs against a schema managed elsewhere; these are used by
//! `--migrate`, `storage.auto_migrate` and the test fixtures.

use crate::context::OpContext;
use crate::error::QuoteStoreError;
use crate::postgres::{ConnectionPool, PgConnection, abort};

pub const UP: &str = "
CREATE TABLE IF NOT EXISTS quotes (
    id         BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    author     TEXT        NOT NULL,
    quote      TEXT        NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS quotes_author_created_at_idx
    ON quotes (author, created_at DESC);
";

pub const DOWN: &str = "
DROP INDEX IF EXISTS quotes_author_created_at_idx;
DROP TABLE IF EXISTS quotes;
";

/// Create the relation if it does not exist.
///
/// # Errors
/// Propagates acquire failures and `StorageError` from the DDL.
pub async fn up(pool: &ConnectionPool, ctx: &OpContext) -> Result<(), QuoteStoreError> {
    apply(pool, ctx, "migrate up", UP).await?;
    tracing::info!("quotes schema is up");
    Ok(())
}

/// Drop the relation and its index.
///
/// # Errors
/// Propagates acquire failures and `StorageError` from the DDL.
pub async fn down(pool: &ConnectionPool, ctx: &OpContext) -> Result<(), QuoteStoreError> {
    apply(pool, ctx, "migrate down", DOWN).await?;
    tracing::info!("quotes schema dropped");
    Ok(())
}

async fn apply(
    pool: &ConnectionPool,
    ctx: &OpContext,
    op: &str,
    sql: &str,
) -> Result<(), QuoteStoreError> {
    let failed = ctx
        .guard(op, async {
            let lease = pool.acquire(ctx, op).await?;
            let tx = PgConnection::from_lease(lease).begin().await?;
            match tx.execute_batch(op, sql).await {
                Ok(()) => {
                    tx.commit().await?.release();
                    Ok(None)
                }
                Err(err) => Ok(Some((tx, err))),
            }
        })
        .await?;
    match failed {
        None => Ok(()),
        Some((tx, err)) => Err(abort(tx, err).await),
    }
}
