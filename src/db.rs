//! Storage service: owns the pool for its whole lifetime.
//!
//! `init` connects (and optionally migrates), `run` returns immediately and `stop`
//! drains the pool. Quote operations are available between `init` and `stop`.

use std::sync::OnceLock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::OpContext;
use crate::error::QuoteStoreError;
use crate::lifecycle::{Service, ServiceError};
use crate::migrations;
use crate::model::Quote;
use crate::postgres::{ConnectionPool, StorageConfig};
use crate::store::{QuoteStorage, QuoteStore};

#[derive(Debug)]
pub struct QuoteDb {
    config: StorageConfig,
    store: OnceLock<QuoteStore>,
}

impl QuoteDb {
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            store: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Open the pool and verify one connection.
    ///
    /// # Errors
    /// `ConfigError` for bad parameters or a second `init`, `ConnectError` when the
    /// server is unreachable within `connect_timeout`, or a migration failure.
    pub async fn init(&self) -> Result<(), QuoteStoreError> {
        if self.store.get().is_some() {
            return Err(QuoteStoreError::ConfigError(
                "storage is already initialized".to_string(),
            ));
        }
        tracing::info!(config = ?self.config, "initializing storage service");

        let ctx = if self.config.connect_timeout.is_zero() {
            OpContext::background()
        } else {
            OpContext::with_timeout(self.config.connect_timeout)
        };
        let pool = ConnectionPool::open(&self.config, &ctx).await?;

        if self.config.auto_migrate
            && let Err(err) = migrations::up(&pool, &OpContext::background()).await
        {
            pool.stop().await;
            return Err(err);
        }

        if let Err(store) = self.store.set(QuoteStore::new(pool)) {
            // lost a race with a concurrent init
            store.pool().stop().await;
            return Err(QuoteStoreError::ConfigError(
                "storage is already initialized".to_string(),
            ));
        }
        Ok(())
    }

    /// Drain in-flight operations and close every connection. Safe to call more
    /// than once, or without a successful `init`.
    pub async fn stop(&self) {
        tracing::info!("stopping storage service");
        if let Some(store) = self.store.get() {
            store.pool().stop().await;
        }
        tracing::info!("storage service has been stopped");
    }

    /// # Errors
    /// `Uninitialized` before a successful `init`.
    pub fn store(&self) -> Result<&QuoteStore, QuoteStoreError> {
        self.store.get().ok_or(QuoteStoreError::Uninitialized)
    }
}

#[async_trait]
impl Service for QuoteDb {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn init(&self) -> Result<(), ServiceError> {
        QuoteDb::init(self).await.map_err(ServiceError::from)
    }

    async fn run(&self, _shutdown: CancellationToken) {}

    async fn stop(&self) {
        QuoteDb::stop(self).await;
    }
}

#[async_trait]
impl QuoteStorage for QuoteDb {
    async fn add_quote(
        &self,
        ctx: &OpContext,
        author: &str,
        text: &str,
    ) -> Result<i64, QuoteStoreError> {
        self.store()?.add_quote(ctx, author, text).await
    }

    async fn get_all_quotes(&self, ctx: &OpContext) -> Result<Vec<Quote>, QuoteStoreError> {
        self.store()?.get_all_quotes(ctx).await
    }

    async fn get_random_quote(&self, ctx: &OpContext) -> Result<Quote, QuoteStoreError> {
        self.store()?.get_random_quote(ctx).await
    }

    async fn get_quotes_by_author(
        &self,
        ctx: &OpContext,
        author: &str,
    ) -> Result<Vec<Quote>, QuoteStoreError> {
        self.store()?.get_quotes_by_author(ctx, author).await
    }

    async fn delete_quote(&self, ctx: &OpContext, id: i64) -> Result<(), QuoteStoreError> {
        self.store()?.delete_quote(ctx, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_before_init_are_rejected() {
        let db = QuoteDb::new(StorageConfig::default());
        let err = db
            .get_all_quotes(&OpContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, QuoteStoreError::Uninitialized));
    }

    #[tokio::test]
    async fn stop_without_init_is_a_noop() {
        let db = QuoteDb::new(StorageConfig::default());
        db.stop().await;
        db.stop().await;
    }

    #[tokio::test]
    async fn bad_config_fails_init_without_connecting() {
        let db = QuoteDb::new(StorageConfig {
            host: "db:notaport".to_string(),
            ..StorageConfig::default()
        });
        let err = db.init().await.unwrap_err();
        assert!(matches!(err, QuoteStoreError::ConfigError(_)));
        assert!(db.store().is_err());
    }
}
