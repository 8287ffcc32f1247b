//! Bounded connection pool with scoped leases and a draining stop.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bb8::{ErrorSink, ManageConnection, Pool, PooledConnection, RunError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::context::OpContext;
use crate::error::QuoteStoreError;

use super::config::{PoolSettings, StorageConfig};
use super::manager::PgManager;

const MAX_REAPER_RATE: Duration = Duration::from_secs(30);
const MIN_REAPER_RATE: Duration = Duration::from_millis(10);

#[derive(Default)]
struct LeaseTracker {
    outstanding: AtomicUsize,
    drained: Notify,
}

impl LeaseTracker {
    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Remembers the most recent failed connect so a waiter that times out can
/// report why no connection came.
#[derive(Debug, Clone, Default)]
struct ConnectFailures {
    last: Arc<Mutex<Option<(Instant, String)>>>,
}

impl ConnectFailures {
    fn take_since(&self, window: Duration) -> Option<String> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match last.take() {
            Some((at, msg)) if at.elapsed() <= window => Some(msg),
            _ => None,
        }
    }
}

impl<E: fmt::Display + Send + 'static> ErrorSink<E> for ConnectFailures {
    fn sink(&self, error: E) {
        tracing::warn!(error = %error, "connection attempt failed");
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((Instant::now(), error.to_string()));
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<E>> {
        Box::new(self.clone())
    }
}

/// Counts one lease from the start of `acquire` until the connection is back.
struct LeaseTicket(Arc<LeaseTracker>);

impl LeaseTicket {
    fn issue(tracker: &Arc<LeaseTracker>) -> Self {
        tracker.outstanding.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(tracker))
    }
}

impl Drop for LeaseTicket {
    fn drop(&mut self) {
        if self.0.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// A connection exclusively held by one operation.
///
/// Dropping the lease returns the connection to the pool.
pub struct PoolLease<M: ManageConnection> {
    // dropped before the ticket, so a drained pool has every connection back
    conn: PooledConnection<'static, M>,
    _ticket: LeaseTicket,
}

impl<M: ManageConnection> PoolLease<M> {
    /// Hand the connection back to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl<M: ManageConnection> Deref for PoolLease<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        &self.conn
    }
}

impl<M: ManageConnection> DerefMut for PoolLease<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        &mut self.conn
    }
}

impl<M: ManageConnection> fmt::Debug for PoolLease<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease").finish_non_exhaustive()
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub connections: u32,
    pub idle_connections: u32,
    pub leased: usize,
    pub stopped: bool,
}

/// Bounded pool of connections produced by `M`.
pub struct ConnectionPool<M: ManageConnection = PgManager> {
    pool: Mutex<Option<Pool<M>>>,
    settings: PoolSettings,
    leases: Arc<LeaseTracker>,
    connect_failures: ConnectFailures,
    closing: CancellationToken,
    background: CancellationToken,
    stopped: AtomicBool,
}

impl<M: ManageConnection> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("status", &self.status())
            .finish()
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    #[must_use]
    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    fn current(&self) -> Result<Pool<M>, QuoteStoreError> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(QuoteStoreError::PoolClosed)
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let guard = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let (connections, idle_connections) = guard
            .as_ref()
            .map(|pool| {
                let state = pool.state();
                (state.connections, state.idle_connections)
            })
            .unwrap_or((0, 0));
        PoolStatus {
            connections,
            idle_connections,
            leased: self.leases.outstanding.load(Ordering::Acquire),
            stopped: self.stopped.load(Ordering::Acquire),
        }
    }
}

impl ConnectionPool<PgManager> {
    /// Parse `config`, build the pool and probe one connection.
    ///
    /// # Errors
    /// `ConfigError` for malformed parameters, `ConnectError` when the server cannot
    /// be reached in time, or `Canceled` if `ctx` is cancelled.
    pub async fn open(config: &StorageConfig, ctx: &OpContext) -> Result<Self, QuoteStoreError> {
        let pg_config = config.pg_config()?;
        let settings = config.pool_settings();
        let background = CancellationToken::new();
        let manager = PgManager::new(pg_config, settings.conn_max_lifetime, background.clone());
        let pool = Self::build(manager, settings, background)?;

        let probe = async {
            let conn = pool.acquire(ctx, "pool probe").await?;
            conn.simple_query("SELECT 1").await.map_err(|e| {
                QuoteStoreError::ConnectError(format!("pool probe failed: {e}"))
            })?;
            Ok::<_, QuoteStoreError>(())
        };
        match probe.await {
            Ok(()) => {}
            // A probe that times out means nothing answered.
            Err(QuoteStoreError::PoolExhausted(msg) | QuoteStoreError::DeadlineExceeded(msg)) => {
                let cause = pool
                    .connect_failures
                    .take_since(Duration::MAX)
                    .map_or(msg, |cause| format!("pool probe: {cause}"));
                pool.stop().await;
                return Err(QuoteStoreError::ConnectError(cause));
            }
            Err(err) => {
                pool.stop().await;
                return Err(err);
            }
        }

        tracing::info!(
            host = %config.host,
            db = %config.db_name,
            max_open_conns = settings.max_open_conns,
            "connected to postgres"
        );
        Ok(pool)
    }
}

impl<M> ConnectionPool<M>
where
    M: ManageConnection,
    M::Error: fmt::Display,
{
    /// Build a pool over an arbitrary connection manager without connecting.
    ///
    /// # Errors
    /// Returns `ConfigError` when `settings` are invalid.
    pub fn with_manager(manager: M, settings: PoolSettings) -> Result<Self, QuoteStoreError> {
        Self::build(manager, settings, CancellationToken::new())
    }

    fn build(
        manager: M,
        settings: PoolSettings,
        background: CancellationToken,
    ) -> Result<Self, QuoteStoreError> {
        settings.validate()?;

        let connect_failures = ConnectFailures::default();
        let mut builder = Pool::builder()
            .max_size(settings.max_open_conns)
            .min_idle(None)
            .idle_timeout(settings.conn_idle_lifetime)
            .max_lifetime(settings.conn_max_lifetime)
            .connection_timeout(settings.acquire_timeout)
            .test_on_check_out(true)
            .retry_connection(false)
            .error_sink(Box::new(connect_failures.clone()));
        if let Some(rate) = reaper_rate(&settings) {
            builder = builder.reaper_rate(rate);
        }
        let pool = builder.build_unchecked(manager);

        Ok(Self {
            pool: Mutex::new(Some(pool)),
            settings,
            leases: Arc::new(LeaseTracker::default()),
            connect_failures,
            closing: CancellationToken::new(),
            background,
            stopped: AtomicBool::new(false),
        })
    }

    /// Borrow a connection, waiting while every slot is leased.
    ///
    /// # Errors
    /// `Canceled`/`DeadlineExceeded` from `ctx`, `PoolExhausted` when the pool's own
    /// acquire timeout elapses, `PoolClosed` after [`stop`](Self::stop), or
    /// `ConnectError` if the timeout elapsed while new connections were failing.
    pub async fn acquire(
        &self,
        ctx: &OpContext,
        op: &str,
    ) -> Result<PoolLease<M>, QuoteStoreError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(QuoteStoreError::PoolClosed);
        }
        let pool = self.current()?;
        let ticket = LeaseTicket::issue(&self.leases);

        let checkout = async {
            tokio::select! {
                biased;
                () = self.closing.cancelled() => Err(QuoteStoreError::PoolClosed),
                res = pool.get_owned() => res.map_err(|e| match e {
                    RunError::TimedOut => match self
                        .connect_failures
                        .take_since(self.settings.acquire_timeout)
                    {
                        Some(cause) => QuoteStoreError::ConnectError(format!("{op}: {cause}")),
                        None => QuoteStoreError::PoolExhausted(format!(
                            "{op}: no connection available within {:?}",
                            self.settings.acquire_timeout
                        )),
                    },
                    RunError::User(e) => QuoteStoreError::ConnectError(format!("{op}: {e}")),
                }),
            }
        };
        let conn = ctx.guard(op, checkout).await?;

        Ok(PoolLease {
            conn,
            _ticket: ticket,
        })
    }

    /// Reject new acquires, wait for every lease to come back, then close all
    /// connections. Calling it again only waits for the drain.
    pub async fn stop(&self) {
        let first = !self.stopped.swap(true, Ordering::AcqRel);
        self.closing.cancel();
        if first {
            tracing::info!(
                leased = self.leases.outstanding.load(Ordering::Acquire),
                "draining connection pool"
            );
        }

        self.leases.wait_drained().await;

        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(pool);
        self.background.cancel();

        if first {
            tracing::info!("connection pool stopped");
        }
    }
}

fn reaper_rate(settings: &PoolSettings) -> Option<Duration> {
    let shortest = [settings.conn_idle_lifetime, settings.conn_max_lifetime]
        .into_iter()
        .flatten()
        .min()?;
    Some((shortest / 2).clamp(MIN_REAPER_RATE, MAX_REAPER_RATE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(idle: Option<Duration>, life: Option<Duration>) -> PoolSettings {
        PoolSettings {
            max_open_conns: 2,
            conn_idle_lifetime: idle,
            conn_max_lifetime: life,
            acquire_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn reaper_follows_shortest_limit() {
        assert_eq!(reaper_rate(&settings(None, None)), None);
        assert_eq!(
            reaper_rate(&settings(Some(Duration::from_secs(4)), Some(Duration::from_secs(600)))),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            reaper_rate(&settings(None, Some(Duration::from_secs(3600)))),
            Some(MAX_REAPER_RATE)
        );
        assert_eq!(
            reaper_rate(&settings(Some(Duration::from_millis(2)), None)),
            Some(MIN_REAPER_RATE)
        );
    }

    #[tokio::test]
    async fn drain_returns_immediately_without_leases() {
        let tracker = Arc::new(LeaseTracker::default());
        tracker.wait_drained().await;
    }

    #[tokio::test]
    async fn drain_waits_for_last_ticket() {
        let tracker = Arc::new(LeaseTracker::default());
        let first = LeaseTicket::issue(&tracker);
        let second = LeaseTicket::issue(&tracker);
        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_drained().await })
        };
        drop(first);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(second);
        waiter.await.unwrap();
        assert_eq!(tracker.outstanding.load(Ordering::Acquire), 0);
    }
}
