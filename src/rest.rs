//! HTTP facade over [`QuoteService`].
//!
//! | route            | method | success                      |
//! |------------------|--------|------------------------------|
//! | `/quotes`        | GET    | 200, quotes (`?author=`)     |
//! | `/quotes`        | POST   | 200, `{"id": n}`             |
//! | `/quotes/random` | GET    | 200, one quote; 204 if empty |
//! | `/quotes/{id}`   | DELETE | 204                          |
//!
//! Validation failures are 400, a missing id on delete 404, pool exhaustion and
//! timeouts 503, anything else 500. Error bodies are `{"error": "..."}`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::{AddQuoteRequest, AddQuoteResponse, AppError, QuoteService};
use crate::config::RestConfig;
use crate::context::OpContext;
use crate::lifecycle::{Service, ServiceError};
use crate::model::Quote;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(msg) => ApiError::BadRequest(msg),
            AppError::NotFound(e) => ApiError::NotFound(e.to_string()),
            AppError::Unavailable(e) => ApiError::Unavailable(e.to_string()),
            AppError::Storage(e) => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

#[derive(Clone)]
struct ApiState {
    service: Arc<QuoteService>,
    request_timeout: Duration,
}

impl ApiState {
    fn op_context(&self) -> OpContext {
        if self.request_timeout.is_zero() {
            OpContext::background()
        } else {
            OpContext::with_timeout(self.request_timeout)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    author: Option<String>,
}

/// Build the quote routes. A zero `request_timeout` leaves requests unbounded.
pub fn router(service: Arc<QuoteService>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/quotes", get(list_quotes).post(add_quote))
        .route("/quotes/random", get(random_quote))
        .route("/quotes/{id}", delete(delete_quote))
        .with_state(ApiState {
            service,
            request_timeout,
        })
}

/// Handler for `GET /quotes`. An empty `author` lists everything.
async fn list_quotes(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Quote>>, ApiError> {
    let ctx = state.op_context();
    let quotes = match params.author.as_deref().filter(|a| !a.is_empty()) {
        Some(author) => state.service.get_quotes_by_author(&ctx, author).await?,
        None => state.service.get_all_quotes(&ctx).await?,
    };
    Ok(Json(quotes))
}

/// Handler for `POST /quotes`.
async fn add_quote(
    State(state): State<ApiState>,
    payload: Result<Json<AddQuoteRequest>, JsonRejection>,
) -> Result<Json<AddQuoteResponse>, ApiError> {
    let Json(req) =
        payload.map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;
    let created = state.service.add_quote(&state.op_context(), req).await?;
    Ok(Json(created))
}

async fn random_quote(State(state): State<ApiState>) -> Result<Response, ApiError> {
    match state.service.get_random_quote(&state.op_context()).await? {
        Some(quote) => Ok(Json(quote).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn delete_quote(
    State(state): State<ApiState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id.map_err(|_| ApiError::BadRequest("invalid quote id".to_string()))?;
    state.service.delete_quote(&state.op_context(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The HTTP listener as a managed service.
pub struct RestApi {
    config: RestConfig,
    service: Arc<QuoteService>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    served: CancellationToken,
}

impl RestApi {
    #[must_use]
    pub fn new(config: RestConfig, service: Arc<QuoteService>) -> Self {
        Self {
            config,
            service,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
            served: CancellationToken::new(),
        }
    }

    /// Bound address, once `init` has run. Useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Service for RestApi {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn init(&self) -> Result<(), ServiceError> {
        let listener = TcpListener::bind(self.config.addr()).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        tracing::info!(%addr, "HTTP server initialized");
        Ok(())
    }

    async fn run(&self, shutdown: CancellationToken) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            tracing::warn!("HTTP server has no listener; was init called?");
            return;
        };
        let _served = self.served.clone().drop_guard();

        let app = router(Arc::clone(&self.service), self.config.request_timeout);
        let stop = self.shutdown.clone();
        tracing::info!(addr = ?self.local_addr(), "starting HTTP server");
        let res = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    () = stop.cancelled() => {}
                    () = shutdown.cancelled() => {}
                }
            })
            .await;
        if let Err(e) = res {
            tracing::error!(error = %e, "HTTP server error");
        }
    }

    async fn stop(&self) {
        tracing::info!("stopping HTTP server");
        self.shutdown.cancel();
        // never bound, or never handed to run: nothing is being served
        let unserved = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if unserved.is_some() || self.local_addr().is_none() {
            return;
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, self.served.cancelled())
            .await
            .is_err()
        {
            tracing::error!(grace = ?SHUTDOWN_GRACE, "failed to shutdown HTTP server in time");
        }
    }
}
