use crate::manager::{JobManager, ManagerError};
use crate::models::StartRequest;
use crate::progress::ProgressBroadcaster;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub broadcaster: ProgressBroadcaster,
    /// Ends open progress streams when the server shuts down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(manager: Arc<JobManager>, broadcaster: ProgressBroadcaster, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            broadcaster,
            shutdown,
        }
    }
}

/// Errors a handler reports through the `{ ok: false, error }` envelope.
///
/// Both kinds answer HTTP 500.
#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    Internal(String),
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::InvalidRequest(msg) => ApiError::InvalidRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::InvalidRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match self {
            ApiError::InvalidRequest(msg) => {
                warn!("rejected request: {msg}");
                msg
            }
            ApiError::Internal(msg) => {
                error!("request failed: {msg}");
                msg
            }
        };
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": message })),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let download = Router::new()
        .route("/start", post(start_download))
        .route("/progress/:job_id", get(download_progress))
        .route("/status/:job_id", get(download_status))
        .route("/jobs", get(list_jobs));

    Router::new()
        .route("/api/health", get(health))
        .nest("/api/download", download.clone())
        // Older dashboard builds still call the hub-specific paths.
        .nest("/api/huggingface/download", download)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let queue = state.manager.queue();
    Json(json!({
        "ok": true,
        "message": "API is up",
        "concurrent": queue.capacity(),
        "running": queue.running(),
        "queued": queue.pending(),
    }))
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = payload?;
    let started = state.manager.create_job(request).await?;
    Ok(Json(json!({ "ok": true, "data": started })))
}

async fn download_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Json<serde_json::Value> {
    let job = match Uuid::parse_str(&job_id) {
        Ok(id) => state.manager.get_job(id).await,
        Err(_) => None,
    };
    match job {
        Some(job) => Json(json!({ "ok": true, "data": job })),
        None => Json(json!({ "ok": false, "error": "not-found" })),
    }
}

async fn list_jobs(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "data": state.manager.list_jobs().await }))
}

async fn download_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    // An unparsable id behaves like one that was never created: no events.
    let job_id = Uuid::parse_str(&job_id).unwrap_or(Uuid::nil());
    let events = state
        .broadcaster
        .subscribe(job_id)
        .take_until(state.shutdown.cancelled_owned())
        .map(|event| Event::default().json_data(event));
    Sse::new(events)
}
