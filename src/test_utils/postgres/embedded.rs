use std::time::Duration;

use postgresql_embedded::PostgreSQL;

use super::super::SHARED_RUNTIME;
use crate::context::OpContext;
use crate::migrations;
use crate::postgres::{ConnectionPool, StorageConfig};

/// A running embedded `PostgreSQL` instance.
pub struct EmbeddedPostgres {
    pub postgresql: PostgreSQL,
    pub port: u16,
    /// Points at the freshly created database, with the quotes schema applied.
    pub config: StorageConfig,
}

/// Start an embedded server, create `db_name` and apply the quotes schema.
///
/// # Errors
/// Returns an error if the server cannot be set up or started, or if database
/// creation or the schema migration fails.
pub fn setup_postgres_embedded(
    db_name: &str,
) -> Result<EmbeddedPostgres, Box<dyn std::error::Error>> {
    SHARED_RUNTIME.block_on(async {
        let mut postgresql = PostgreSQL::default();

        // bundled binaries, no download
        postgresql.setup().await?;
        postgresql.start().await?;
        postgresql.create_database(db_name).await?;

        let settings = postgresql.settings();
        let port = settings.port;
        let config = StorageConfig {
            host: format!("{}:{port}", settings.host),
            db_name: db_name.to_string(),
            user: settings.username.clone(),
            password: settings.password.clone(),
            acquire_timeout: Duration::from_secs(10),
            ..StorageConfig::default()
        };

        let pool = ConnectionPool::open(&config, &OpContext::background()).await?;
        let migrated = migrations::up(&pool, &OpContext::background()).await;
        pool.stop().await;
        migrated?;

        println!("PostgreSQL started on port {port}, database {db_name}");
        Ok(EmbeddedPostgres {
            postgresql,
            port,
            config,
        })
    })
}

/// Stop a previously started embedded `PostgreSQL` instance.
pub fn stop_postgres_embedded(postgres: EmbeddedPostgres) {
    let EmbeddedPostgres { postgresql, .. } = postgres;
    SHARED_RUNTIME.block_on(async move {
        let _ = postgresql.stop().await;
    });
}
