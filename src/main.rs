use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use quote_service::application::QuoteService;
use quote_service::config::{self, Config};
use quote_service::context::OpContext;
use quote_service::db::QuoteDb;
use quote_service::lifecycle::ServiceManager;
use quote_service::postgres::ConnectionPool;
use quote_service::rest::RestApi;
use quote_service::{logging, migrations};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MigrateDirection {
    Up,
    Down,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Quote storage service")]
struct Args {
    /// TOML configuration; missing files fall back to defaults plus env overrides.
    #[arg(long, default_value = "config.toml")]
    config_file: PathBuf,
    /// Apply (or with `down`, revert) the schema and exit.
    #[arg(long, value_enum, num_args = 0..=1, default_missing_value = "up")]
    migrate: Option<MigrateDirection>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match config::load_config(Some(args.config_file.as_path())) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = logging::init(&config.logging) {
        eprintln!("failed to open log file: {err}");
        return ExitCode::FAILURE;
    }
    tracing::info!(path = %args.config_file.display(), "configuration loaded");

    let result = match args.migrate {
        Some(direction) => migrate(&config, direction).await,
        None => serve(config).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "quote-service exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn migrate(
    config: &Config,
    direction: MigrateDirection,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = if config.storage.connect_timeout.is_zero() {
        OpContext::background()
    } else {
        OpContext::with_timeout(config.storage.connect_timeout)
    };
    let pool = ConnectionPool::open(&config.storage, &ctx).await?;
    let res = match direction {
        MigrateDirection::Up => migrations::up(&pool, &OpContext::background()).await,
        MigrateDirection::Down => migrations::down(&pool, &OpContext::background()).await,
    };
    pool.stop().await;
    Ok(res?)
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(QuoteDb::new(config.storage));
    let app = Arc::new(QuoteService::new(db.clone()));
    let api = Arc::new(RestApi::new(config.rest, app.clone()));

    let mut manager = ServiceManager::new();
    manager.add_service(db).add_service(app).add_service(api);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    manager.run(shutdown).await?;
    tracing::info!("quote-service shut down");
    Ok(())
}

/// Cancels `token` on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
    token.cancel();
}
