use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::limit::RequestBodyLimitLayer;

use coop_core::models::{Collection, SyncRecord, ensure_record_id};

use crate::connectivity::ConnectivityMonitor;
use crate::network::FetchRequest;
use crate::tls::TlsConfig;
use crate::worker::clients::WindowClient;
use crate::worker::error::{StoreError, WorkerError};
use crate::worker::intercept::{Intercepted, SOURCE_HEADER};
use crate::worker::lifecycle::{ActivateReport, WorkerState};
use crate::worker::notify::{ClickOutcome, Notification, Notifier};
use crate::worker::{ControlMessage, Worker, WorkerStatus};

const BODY_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

/// Control endpoints live under this prefix; every other path is intercepted.
pub const CONTROL_PREFIX: &str = "/__worker";

#[derive(Clone)]
struct AppState {
    worker: Arc<Worker>,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct SyncRequest {
    tag: String,
}

#[derive(Serialize)]
struct SyncRegistered {
    tag: String,
    pending: Vec<String>,
}

#[derive(Serialize)]
struct MessageResponse {
    state: WorkerState,
    activated: Option<ActivateReport>,
}

#[derive(Deserialize)]
struct ClickQuery {
    action: Option<String>,
}

#[derive(Deserialize)]
struct OpenClientRequest {
    url: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(err) => {
                tracing::error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::UnknownSyncTag(_) | WorkerError::UnknownNotification(_) => {
                Self::NotFound(err.to_string())
            }
            WorkerError::InvalidPush(_) => Self::BadRequest(err.to_string()),
            WorkerError::InvalidState(..) | WorkerError::SyncBusy(_) => {
                Self::Conflict(err.to_string())
            }
            WorkerError::Install(_) | WorkerError::Store(_) | WorkerError::SyncAbandoned(_) => {
                Self::Internal(err.into())
            }
        }
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

// --- Control handlers ---

async fn get_status(State(state): State<AppState>) -> Json<WorkerStatus> {
    Json(state.worker.status())
}

async fn post_message(
    State(state): State<AppState>,
    Json(message): Json<ControlMessage>,
) -> Result<Json<MessageResponse>, ApiError> {
    let activated = state.worker.on_message(message).await?;
    Ok(Json(MessageResponse {
        state: state.worker.state(),
        activated,
    }))
}

async fn post_sync(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> Result<(StatusCode, Json<SyncRegistered>), ApiError> {
    state.worker.register_sync(&req.tag)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncRegistered {
            tag: req.tag,
            pending: state.worker.pending_syncs(),
        }),
    ))
}

async fn post_push(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    let notification = state.worker.on_push(&body)?;
    Ok((StatusCode::CREATED, Json(notification)))
}

async fn list_notifications(State(state): State<AppState>) -> Json<Vec<Notification>> {
    Json(state.worker.notifications().list())
}

async fn click_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ClickQuery>,
) -> Result<Json<ClickOutcome>, ApiError> {
    let outcome = state
        .worker
        .on_notification_click(&id, query.action.as_deref())?;
    Ok(Json(outcome))
}

async fn list_clients(State(state): State<AppState>) -> Json<Vec<WindowClient>> {
    Json(state.worker.clients().match_all())
}

async fn open_client(
    State(state): State<AppState>,
    Json(req): Json<OpenClientRequest>,
) -> Result<(StatusCode, Json<WindowClient>), ApiError> {
    if req.url.trim().is_empty() {
        return Err(ApiError::BadRequest("url must not be empty".to_string()));
    }
    let client = state.worker.on_client_opened(&req.url);
    Ok((StatusCode::CREATED, Json(client)))
}

async fn close_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.worker.on_client_closed(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("No client with id '{id}'")))
    }
}

fn parse_collection(name: &str) -> Result<Collection, ApiError> {
    Collection::parse(name).map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn list_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<SyncRecord>>, ApiError> {
    let collection = parse_collection(&collection)?;
    let records = state.worker.store().get_all(collection).await?;
    Ok(Json(records))
}

async fn put_record(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(mut value): Json<Value>,
) -> Result<Json<SyncRecord>, ApiError> {
    let collection = parse_collection(&collection)?;
    ensure_record_id(&mut value);
    let record = SyncRecord::from_value(value).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state
        .worker
        .store()
        .put(collection, record.clone())
        .await?;
    tracing::debug!(collection = %collection, key = record.key(), "record stored");
    Ok(Json(record))
}

async fn control_not_found() -> ApiError {
    ApiError::NotFound("Unknown worker endpoint".to_string())
}

// --- Interception ---

async fn intercept(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(body) => body,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    let key = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

    let fetch = FetchRequest {
        method: parts.method,
        key,
        headers: parts.headers,
        body,
    };
    let intercepted = state.worker.on_fetch(&fetch).await;
    tracing::debug!(
        method = %fetch.method,
        key = %fetch.key,
        status = intercepted.response.status,
        source = intercepted.source.as_str(),
        "intercepted"
    );
    into_http_response(intercepted)
}

fn into_http_response(intercepted: Intercepted) -> Response {
    let Intercepted { source, response } = intercepted;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut http = Response::new(Body::from(response.body));
    *http.status_mut() = status;
    let headers = http.headers_mut();
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
    http
}

// --- Router builder ---

fn build_router(state: AppState) -> Router {
    let control = Router::new()
        .route("/status", get(get_status))
        .route("/message", post(post_message))
        .route("/sync", post(post_sync))
        .route("/push", post(post_push))
        .route("/notifications", get(list_notifications))
        .route("/notifications/{id}/click", post(click_notification))
        .route("/clients", get(list_clients).post(open_client))
        .route("/clients/{id}", delete(close_client))
        .route(
            "/records/{collection}",
            get(list_records).put(put_record),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .fallback(control_not_found)
        .layer(middleware::from_fn(security_headers));

    Router::new()
        .nest(CONTROL_PREFIX, control)
        .fallback(intercept)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .with_state(state)
}

// --- Server startup ---

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

pub async fn start_server(
    worker: Arc<Worker>,
    port: u16,
    bind: &str,
    api_key: Option<String>,
    tls: Option<TlsConfig>,
) -> anyhow::Result<()> {
    match worker.start().await {
        Ok(state) => tracing::info!(state = state.as_str(), "worker started"),
        Err(err) => tracing::error!(error = %err, "worker failed to start, proxying without cache"),
    }

    let state = AppState {
        worker: Arc::clone(&worker),
        api_key: api_key.clone(),
    };
    let app = build_router(state);

    if let Some(ref key) = api_key {
        tracing::info!(
            "API key: {} (see api_key file in data directory)",
            crate::config::mask_api_key(key)
        );
    } else {
        tracing::warn!("authentication disabled (--no-auth), control API is open to anyone");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        tracing::warn!(
            "listening on {bind} with no authentication; any device on your network can control the worker"
        );
    }

    let monitor = tokio::spawn(ConnectivityMonitor::new(Arc::clone(&worker)).run());

    if let Some(tls_config) = tls {
        let fingerprint = tls_config.ensure()?;

        let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &tls_config.cert_path,
            &tls_config.key_path,
        )
        .await
        .context("failed to load TLS certificate")?;

        let addr = format!("{bind}:{port}")
            .parse::<std::net::SocketAddr>()
            .context("invalid bind address")?;

        tracing::info!("listening on https://{bind}:{port}");
        tracing::info!(%fingerprint, "certificate fingerprint (SHA-256)");

        let handle = axum_server::Handle::new();
        let shutdown = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
        });
        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
        tracing::info!("listening on http://{bind}:{port}");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    monitor.abort();
    let pending = worker.keepalive().pending();
    if pending > 0 {
        tracing::info!(tasks = pending, "waiting for background work to finish");
    }
    worker.keepalive().drain().await;
    Ok(())
}
