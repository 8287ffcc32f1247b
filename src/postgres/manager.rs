use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use bb8::ManageConnection;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;

use crate::error::QuoteStoreError;

/// A client plus the instant it was established, so over-age connections can be
/// recycled on checkout and on return.
#[derive(Debug)]
pub struct PgClient {
    client: Client,
    born_at: Instant,
    discarded: bool,
}

impl PgClient {
    #[must_use]
    pub fn age(&self) -> Duration {
        self.born_at.elapsed()
    }

    /// Close this connection when it is returned instead of pooling it again.
    pub fn discard(&mut self) {
        self.discarded = true;
    }
}

impl Deref for PgClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl DerefMut for PgClient {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

/// bb8 manager for Postgres clients.
///
/// Each connection's driver task stops when `background` is cancelled.
pub struct PgManager {
    config: tokio_postgres::Config,
    max_lifetime: Option<Duration>,
    background: CancellationToken,
}

impl PgManager {
    #[must_use]
    pub fn new(
        config: tokio_postgres::Config,
        max_lifetime: Option<Duration>,
        background: CancellationToken,
    ) -> Self {
        Self {
            config,
            max_lifetime,
            background,
        }
    }

    fn expired(&self, conn: &PgClient) -> bool {
        self.max_lifetime.is_some_and(|max| conn.age() >= max)
    }
}

impl ManageConnection for PgManager {
    type Connection = PgClient;
    type Error = QuoteStoreError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let cfg = self.config.clone();
        let background = self.background.clone();
        async move {
            tracing::debug!(
                hosts = ?cfg.get_hosts(),
                db = ?cfg.get_dbname(),
                user = ?cfg.get_user(),
                "postgres connect start"
            );
            let (client, connection) = cfg
                .connect(NoTls)
                .await
                .map_err(|e| QuoteStoreError::ConnectError(format!("postgres connect: {e}")))?;
            tracing::debug!("postgres connection established");
            tokio::spawn(async move {
                tokio::select! {
                    () = background.cancelled() => {}
                    res = connection => {
                        if let Err(e) = res {
                            tracing::warn!(error = %e, "postgres connection closed with error");
                        }
                    }
                }
            });
            Ok(PgClient {
                client,
                born_at: Instant::now(),
                discarded: false,
            })
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let expired = self.expired(conn);
        async move {
            if expired {
                return Err(QuoteStoreError::ConnectError(
                    "connection exceeded max lifetime".to_string(),
                ));
            }
            conn.simple_query("SELECT 1")
                .await
                .map(|_| ())
                .map_err(|e| QuoteStoreError::ConnectError(format!("postgres ping: {e}")))
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed() || conn.discarded || self.expired(conn)
    }
}
