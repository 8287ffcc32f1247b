//! Typestate wrapper around a leased Postgres client.
//! `PgConnection<Idle>` runs auto-commit statements; `begin` moves it to
//! `PgConnection<InTx>` until `commit` or `rollback`.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::runtime::Handle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use crate::error::QuoteStoreError;

use super::manager::PgManager;
use super::pool::PoolLease;

/// Marker types for typestate
pub enum Idle {}
pub enum InTx {}

pub struct PgConnection<State> {
    lease: Option<PoolLease<PgManager>>,
    /// True while a transaction is open and would need a rollback if dropped.
    needs_rollback: bool,
    /// Set while a statement is outstanding; still set after drop means the
    /// caller gave up on it and the server may still be running it.
    in_flight: AtomicBool,
    _state: PhantomData<State>,
}

impl<State> PgConnection<State> {
    fn new(lease: PoolLease<PgManager>, needs_rollback: bool) -> Self {
        Self {
            lease: Some(lease),
            needs_rollback,
            in_flight: AtomicBool::new(false),
            _state: PhantomData,
        }
    }

    fn lease(&self) -> Result<&PoolLease<PgManager>, QuoteStoreError> {
        self.lease.as_ref().ok_or(QuoteStoreError::TxClosed)
    }

    fn take_lease(&mut self) -> Result<PoolLease<PgManager>, QuoteStoreError> {
        self.lease.take().ok_or(QuoteStoreError::TxClosed)
    }

    fn is_closed(&self) -> bool {
        self.lease.as_ref().is_none_or(|lease| lease.is_closed())
    }

    async fn track<T>(
        &self,
        statement: impl Future<Output = Result<T, tokio_postgres::Error>>,
    ) -> Result<T, tokio_postgres::Error> {
        self.in_flight.store(true, Ordering::Release);
        let res = statement.await;
        self.in_flight.store(false, Ordering::Release);
        res
    }

    /// Return the connection to the pool.
    pub fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }

    /// Run a statement that yields rows.
    ///
    /// # Errors
    /// Returns `StorageError` labelled with `context` when the query fails.
    pub async fn query(
        &self,
        context: &str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, QuoteStoreError> {
        let lease = self.lease()?;
        self.track(lease.query(sql, params))
            .await
            .map_err(|e| QuoteStoreError::storage(context, e))
    }

    /// Run a statement that yields at most one row.
    ///
    /// # Errors
    /// Returns `StorageError` labelled with `context` when the query fails.
    pub async fn query_opt(
        &self,
        context: &str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, QuoteStoreError> {
        let lease = self.lease()?;
        self.track(lease.query_opt(sql, params))
            .await
            .map_err(|e| QuoteStoreError::storage(context, e))
    }

    /// Run a statement that yields exactly one row.
    ///
    /// # Errors
    /// Returns `StorageError` labelled with `context` when the query fails or the
    /// row count is not one.
    pub async fn query_one(
        &self,
        context: &str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, QuoteStoreError> {
        let lease = self.lease()?;
        self.track(lease.query_one(sql, params))
            .await
            .map_err(|e| QuoteStoreError::storage(context, e))
    }

    /// Run DML and return the affected row count.
    ///
    /// # Errors
    /// Returns `StorageError` labelled with `context` when execution fails.
    pub async fn execute(
        &self,
        context: &str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, QuoteStoreError> {
        let lease = self.lease()?;
        self.track(lease.execute(sql, params))
            .await
            .map_err(|e| QuoteStoreError::storage(context, e))
    }

    /// Run one or more statements without parameters.
    ///
    /// # Errors
    /// Returns `StorageError` labelled with `context` when execution fails.
    pub async fn execute_batch(&self, context: &str, sql: &str) -> Result<(), QuoteStoreError> {
        let lease = self.lease()?;
        self.track(lease.batch_execute(sql))
            .await
            .map_err(|e| QuoteStoreError::storage(context, e))
    }
}

impl PgConnection<Idle> {
    #[must_use]
    pub fn from_lease(lease: PoolLease<PgManager>) -> Self {
        Self::new(lease, false)
    }

    /// Begin an explicit transaction.
    ///
    /// # Errors
    /// Returns `StorageError` if `BEGIN` fails.
    pub async fn begin(mut self) -> Result<PgConnection<InTx>, QuoteStoreError> {
        let lease = self.take_lease()?;
        // Armed before BEGIN is sent, so a cancellation mid-flight still rolls back.
        let tx = PgConnection::<InTx>::new(lease, true);
        let lease = tx.lease()?;
        tx.track(lease.simple_query("BEGIN"))
            .await
            .map_err(|e| QuoteStoreError::storage("postgres begin", e))?;
        Ok(tx)
    }
}

impl PgConnection<InTx> {
    /// Commit and return to idle.
    ///
    /// A failed `COMMIT` ends the transaction server-side, so nothing is left to
    /// roll back on that path.
    ///
    /// # Errors
    /// Returns `StorageError` if the commit fails.
    pub async fn commit(mut self) -> Result<PgConnection<Idle>, QuoteStoreError> {
        let lease = self.lease()?;
        let res = self.track(lease.simple_query("COMMIT")).await;
        self.needs_rollback = false;
        res.map_err(|e| QuoteStoreError::storage("postgres commit", e))?;
        let lease = self.take_lease()?;
        Ok(PgConnection::new(lease, false))
    }

    /// Roll back and return to idle.
    ///
    /// # Errors
    /// Returns `TxClosed` when the connection is already gone (nothing to undo), or
    /// `StorageError` if `ROLLBACK` itself fails.
    pub async fn rollback(mut self) -> Result<PgConnection<Idle>, QuoteStoreError> {
        if self.is_closed() {
            self.needs_rollback = false;
            return Err(QuoteStoreError::TxClosed);
        }
        let lease = self.lease()?;
        let res = self.track(lease.simple_query("ROLLBACK")).await;
        self.needs_rollback = false;
        match res {
            Ok(_) => Ok(PgConnection::new(self.take_lease()?, false)),
            Err(_) if self.is_closed() => Err(QuoteStoreError::TxClosed),
            Err(e) => Err(QuoteStoreError::storage("postgres rollback", e)),
        }
    }
}

// Drop cannot be specialized for PgConnection<InTx>, so the flags carry the state.
// A connection abandoned mid-statement or mid-transaction (error path or
// cancelled future) is settled on a spawned task, which keeps the lease until the
// server is done with it.
impl<State> Drop for PgConnection<State> {
    fn drop(&mut self) {
        let interrupted = *self.in_flight.get_mut();
        if !(interrupted || self.needs_rollback) {
            return;
        }
        let Some(lease) = self.lease.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(settle(lease, interrupted, self.needs_rollback));
            }
            Err(_) => {
                tracing::warn!("no runtime to settle abandoned connection");
            }
        }
    }
}

/// Stop a statement the caller no longer waits for, then undo its transaction.
///
/// The cancel request reaches the server out of band, so an interrupted
/// connection is closed on return rather than reused.
async fn settle(mut lease: PoolLease<PgManager>, interrupted: bool, rollback: bool) {
    if lease.is_closed() {
        return;
    }
    if interrupted {
        if let Err(e) = lease.cancel_token().cancel_query(NoTls).await {
            tracing::warn!(error = %e, "failed to cancel abandoned statement");
        }
        lease.discard();
    }
    if rollback
        && let Err(e) = lease.simple_query("ROLLBACK").await
        && !lease.is_closed()
    {
        tracing::error!(error = %e, "rollback of abandoned transaction failed");
    }
}

/// Roll back after a failed statement and hand back the error that caused it.
///
/// A rollback failure is logged and never replaces `primary`; rolling back a
/// transaction that is already closed is not reported at all.
pub async fn abort(tx: PgConnection<InTx>, primary: QuoteStoreError) -> QuoteStoreError {
    match tx.rollback().await {
        Ok(conn) => conn.release(),
        Err(err) if err.is_benign_rollback() => {}
        Err(err) => {
            tracing::error!(error = %err, primary = %primary, "rollback error");
        }
    }
    primary
}
