use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bb8::ManageConnection;
use quote_service::prelude::*;
use tokio_util::sync::CancellationToken;

/// Hands out numbered in-memory connections and counts how many are alive.
#[derive(Clone, Default)]
struct CountingManager {
    opened: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

struct FakeConn {
    id: usize,
    live: Arc<AtomicUsize>,
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ManageConnection for CountingManager {
    type Connection = FakeConn;
    type Error = io::Error;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let this = self.clone();
        async move {
            if this.refuse.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let id = this.opened.fetch_add(1, Ordering::SeqCst);
            this.live.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn {
                id,
                live: Arc::clone(&this.live),
            })
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        _conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

fn settings(max_open_conns: u32, acquire_timeout: Duration) -> PoolSettings {
    PoolSettings {
        max_open_conns,
        conn_idle_lifetime: None,
        conn_max_lifetime: None,
        acquire_timeout,
    }
}

fn pool(
    max_open_conns: u32,
    acquire_timeout: Duration,
) -> (Arc<ConnectionPool<CountingManager>>, CountingManager) {
    let manager = CountingManager::default();
    let pool = ConnectionPool::with_manager(manager.clone(), settings(max_open_conns, acquire_timeout))
        .expect("valid settings");
    (Arc::new(pool), manager)
}

fn recycling_pool(
    idle: Option<Duration>,
    lifetime: Option<Duration>,
) -> (ConnectionPool<CountingManager>, CountingManager) {
    let manager = CountingManager::default();
    let settings = PoolSettings {
        max_open_conns: 1,
        conn_idle_lifetime: idle,
        conn_max_lifetime: lifetime,
        acquire_timeout: Duration::from_secs(5),
    };
    let pool = ConnectionPool::with_manager(manager.clone(), settings).expect("valid settings");
    (pool, manager)
}

#[tokio::test]
async fn zero_sized_pool_is_a_config_error() {
    let err = ConnectionPool::with_manager(CountingManager::default(), settings(0, Duration::from_secs(1)))
        .unwrap_err();
    assert!(matches!(err, QuoteStoreError::ConfigError(_)));
}

#[tokio::test]
async fn saturated_pool_waits_until_deadline() {
    let (pool, _) = pool(2, Duration::from_secs(30));
    let bg = OpContext::background();
    let a = pool.acquire(&bg, "hold a").await.unwrap();
    let b = pool.acquire(&bg, "hold b").await.unwrap();
    assert_ne!(a.id, b.id);

    let ctx = OpContext::with_timeout(Duration::from_millis(100));
    let started = std::time::Instant::now();
    let err = pool.acquire(&ctx, "third").await.unwrap_err();
    assert!(matches!(err, QuoteStoreError::DeadlineExceeded(ref op) if op == "third"), "{err}");
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(pool.status().leased, 2);
}

#[tokio::test]
async fn pool_timeout_reports_exhaustion() {
    let (pool, _) = pool(1, Duration::from_millis(100));
    let bg = OpContext::background();
    let _held = pool.acquire(&bg, "hold").await.unwrap();

    let err = pool.acquire(&bg, "add_quote").await.unwrap_err();
    assert!(matches!(err, QuoteStoreError::PoolExhausted(_)), "{err}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn release_wakes_a_waiter_with_the_same_connection() {
    let (pool, manager) = pool(1, Duration::from_secs(5));
    let bg = OpContext::background();
    let held = pool.acquire(&bg, "hold").await.unwrap();
    let first_id = held.id;

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let lease = pool.acquire(&OpContext::background(), "waiter").await?;
            Ok::<_, QuoteStoreError>(lease.id)
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    held.release();
    let id = waiter.await.unwrap().unwrap();
    assert_eq!(id, first_id);
    assert_eq!(manager.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_acquires_never_exceed_the_bound() {
    let (pool, manager) = pool(3, Duration::from_secs(5));
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..24 {
        let pool = Arc::clone(&pool);
        let in_use = Arc::clone(&in_use);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let lease = pool.acquire(&OpContext::background(), "worker").await?;
            let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1 + rand::random::<u64>() % 10)).await;
            in_use.fetch_sub(1, Ordering::SeqCst);
            drop(lease);
            Ok::<_, QuoteStoreError>(i)
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(manager.opened.load(Ordering::SeqCst) <= 3);
    assert_eq!(pool.status().leased, 0);
}

#[tokio::test]
async fn cancelled_waiter_gives_up_its_slot() {
    let (pool, _) = pool(1, Duration::from_secs(30));
    let _held = pool.acquire(&OpContext::background(), "hold").await.unwrap();

    let root = CancellationToken::new();
    let waiter = {
        let pool = Arc::clone(&pool);
        let ctx = OpContext::with_cancel(&root);
        tokio::spawn(async move { pool.acquire(&ctx, "waiter").await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    root.cancel();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, QuoteStoreError::Canceled(_)));
    assert_eq!(pool.status().leased, 1);
}

#[tokio::test]
async fn refused_connections_surface_as_connect_errors() {
    let (pool, manager) = pool(1, Duration::from_millis(200));
    manager.refuse.store(true, Ordering::SeqCst);

    let err = pool
        .acquire(&OpContext::background(), "add_quote")
        .await
        .unwrap_err();
    assert!(matches!(err, QuoteStoreError::ConnectError(ref m) if m.contains("refused")), "{err}");
}

#[tokio::test]
async fn stop_drains_leases_then_closes_everything() {
    let (pool, manager) = pool(2, Duration::from_secs(5));
    let bg = OpContext::background();
    let held = pool.acquire(&bg, "in flight").await.unwrap();
    pool.acquire(&bg, "returned").await.unwrap().release();
    assert_eq!(manager.live.load(Ordering::SeqCst), 2);

    let stopper = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopper.is_finished(), "stop must wait for the outstanding lease");
    assert!(pool.status().stopped);

    let err = pool.acquire(&bg, "late").await.unwrap_err();
    assert!(matches!(err, QuoteStoreError::PoolClosed));

    drop(held);
    stopper.await.unwrap();
    assert_eq!(pool.status().leased, 0);

    // connections close once the last pool handle is gone
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.live.load(Ordering::SeqCst), 0);

    pool.stop().await;
}

#[tokio::test]
async fn stop_wakes_blocked_waiters() {
    let (pool, _) = pool(1, Duration::from_secs(30));
    let held = pool.acquire(&OpContext::background(), "hold").await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(&OpContext::background(), "waiter").await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stopper = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.stop().await })
    };
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, QuoteStoreError::PoolClosed));

    drop(held);
    stopper.await.unwrap();
}

#[tokio::test]
async fn connections_past_max_lifetime_are_replaced() {
    let (pool, manager) = recycling_pool(None, Some(Duration::from_millis(100)));
    let bg = OpContext::background();

    let first = pool.acquire(&bg, "first").await.unwrap();
    assert_eq!(first.id, 0);
    first.release();

    // reused while young
    let again = pool.acquire(&bg, "again").await.unwrap();
    assert_eq!(again.id, 0);
    again.release();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let fresh = pool.acquire(&bg, "fresh").await.unwrap();
    assert_eq!(fresh.id, 1);
    assert_eq!(manager.live.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_connection_is_not_pooled_again_on_return() {
    let (pool, manager) = recycling_pool(None, Some(Duration::from_millis(100)));
    let bg = OpContext::background();

    let held = pool.acquire(&bg, "long holder").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    held.release();

    let next = pool.acquire(&bg, "next").await.unwrap();
    assert_eq!(next.id, 1);
    assert_eq!(manager.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn idle_connections_are_closed_after_idle_lifetime() {
    let (pool, manager) = recycling_pool(Some(Duration::from_millis(100)), None);
    let bg = OpContext::background();

    pool.acquire(&bg, "first").await.unwrap().release();
    assert_eq!(manager.live.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(manager.live.load(Ordering::SeqCst), 0);

    let fresh = pool.acquire(&bg, "fresh").await.unwrap();
    assert_eq!(fresh.id, 1);
}
