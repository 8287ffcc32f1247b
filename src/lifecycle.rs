//! Init/run/stop contract shared by every long-lived component, and the manager
//! that drives a set of them.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::QuoteStoreError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] QuoteStoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{service} failed to initialize: {source}")]
    Init {
        service: &'static str,
        #[source]
        source: Box<ServiceError>,
    },
}

/// A component the [`ServiceManager`] can start and stop.
///
/// `init` is called once before `run`; `stop` must be idempotent and safe to call
/// after a failed `init`.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    async fn init(&self) -> Result<(), ServiceError>;

    /// Do the component's work until `shutdown` fires. Components without a loop
    /// return right away.
    async fn run(&self, shutdown: CancellationToken);

    async fn stop(&self);
}

/// Starts services in registration order and stops them in reverse.
#[derive(Default)]
pub struct ServiceManager {
    services: Vec<Arc<dyn Service>>,
}

impl ServiceManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&mut self, service: Arc<dyn Service>) -> &mut Self {
        self.services.push(service);
        self
    }

    /// Init every service, run them until `shutdown` is cancelled, then stop them.
    ///
    /// # Errors
    /// Returns the first init failure, after stopping the services already initialized.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServiceError> {
        for (idx, service) in self.services.iter().enumerate() {
            tracing::info!(service = service.name(), "initializing service");
            if let Err(err) = service.init().await {
                tracing::error!(service = service.name(), error = %err, "service init failed");
                // the failed one too: stop is safe after a partial init
                for started in self.services[..=idx].iter().rev() {
                    started.stop().await;
                }
                return Err(ServiceError::Init {
                    service: service.name(),
                    source: Box::new(err),
                });
            }
        }

        let run_token = CancellationToken::new();
        let mut running = JoinSet::new();
        for service in &self.services {
            let service = Arc::clone(service);
            let token = run_token.clone();
            running.spawn(async move {
                service.run(token).await;
                service.name()
            });
        }
        tracing::info!(count = self.services.len(), "services started");

        shutdown.cancelled().await;
        tracing::info!("shutting down services");

        for service in self.services.iter().rev() {
            service.stop().await;
            tracing::info!(service = service.name(), "service stopped");
        }
        run_token.cancel();

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "service task panicked");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        fail_init: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &'static str, fail_init: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_init,
                log: Arc::clone(log),
            })
        }

        fn push(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}:{event}", self.name));
        }
    }

    #[async_trait]
    impl Service for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn init(&self) -> Result<(), ServiceError> {
            self.push("init");
            if self.fail_init {
                return Err(QuoteStoreError::ConnectError("unreachable".into()).into());
            }
            Ok(())
        }

        async fn run(&self, shutdown: CancellationToken) {
            self.push("run");
            shutdown.cancelled().await;
        }

        async fn stop(&self) {
            self.push("stop");
        }
    }

    #[tokio::test]
    async fn stops_in_reverse_order_on_shutdown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = ServiceManager::new();
        mgr.add_service(Recorder::new("db", false, &log))
            .add_service(Recorder::new("api", false, &log));

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        mgr.run(shutdown).await.unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(&events[..2], ["db:init", "api:init"]);
        let stops: Vec<_> = events.iter().filter(|e| e.ends_with(":stop")).collect();
        assert_eq!(stops, ["api:stop", "db:stop"]);
    }

    #[tokio::test]
    async fn init_failure_unwinds_started_services() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = ServiceManager::new();
        mgr.add_service(Recorder::new("db", false, &log))
            .add_service(Recorder::new("app", true, &log))
            .add_service(Recorder::new("api", false, &log));

        let err = mgr.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Init { service: "app", .. }));

        let events = log.lock().unwrap().clone();
        assert_eq!(events, ["db:init", "app:init", "app:stop", "db:stop"]);
    }
}
