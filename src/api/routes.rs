use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::db::{
    get_posts_for_channel, get_recent_runs, get_running_channels, CrawlRun, RunningChannel,
    StoredPost,
};
use crate::queue::TaskQueue;
use crate::service::{self, ServiceError};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

/// Create the router with all routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/status", get(status))
        .route("/api/crawls", axum::routing::post(enqueue_crawl))
        .route(
            "/api/crawls/:channel",
            axum::routing::delete(cancel_crawl).patch(change_window),
        )
        .route("/api/crawls/:channel/progress", get(progress))
        .route("/api/capacity", get(get_capacity).put(set_capacity))
        .route("/api/runs", get(recent_runs))
        .route("/api/channels/:channel/posts", get(channel_posts))
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidChannel(_) | Self::InvalidWindow { .. } => StatusCode::BAD_REQUEST,
            Self::Store(e) => {
                tracing::error!("Store error: {e:#}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Database error" })),
                )
                    .into_response();
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    pending: u64,
    capacity: u32,
    running: Vec<RunningChannel>,
}

async fn status(State(state): State<AppState>) -> Response {
    let pending = match state.db.pending_count().await {
        Ok(n) => n,
        Err(e) => return ServiceError::Store(e).into_response(),
    };
    let running = match get_running_channels(state.db.pool()).await {
        Ok(running) => running,
        Err(e) => return ServiceError::Store(e).into_response(),
    };
    match service::get_worker_capacity(&state.db).await {
        Ok(capacity) => Json(StatusResponse {
            pending,
            capacity,
            running,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

// ========== Crawl Routes ==========

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    channel_id: String,
    window_from: DateTime<Utc>,
    window_to: DateTime<Utc>,
}

async fn enqueue_crawl(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Response {
    match service::enqueue_crawl(
        &state.db,
        &request.channel_id,
        request.window_from,
        request.window_to,
    )
    .await
    {
        Ok(window) => (StatusCode::ACCEPTED, Json(window)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cancel_crawl(State(state): State<AppState>, Path(channel): Path<String>) -> Response {
    if let Err(e) = service::validate_channel_id(&channel) {
        return e.into_response();
    }
    match service::cancel_crawl(&state.db, &channel).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChangeWindowRequest {
    window_from: DateTime<Utc>,
    window_to: DateTime<Utc>,
}

async fn change_window(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(request): Json<ChangeWindowRequest>,
) -> Response {
    match service::change_window(&state.db, &channel, request.window_from, request.window_to)
        .await
    {
        Ok(true) => Json(json!({
            "channel_id": channel,
            "window_from": request.window_from,
            "window_to": request.window_to,
        }))
        .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No active crawl for channel" })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    channel_id: String,
    progress: i64,
}

async fn progress(State(state): State<AppState>, Path(channel): Path<String>) -> Response {
    if let Err(e) = service::validate_channel_id(&channel) {
        return e.into_response();
    }
    match service::get_progress(&state.db, &channel).await {
        Ok(progress) => Json(ProgressResponse {
            channel_id: channel,
            progress,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

// ========== Capacity Routes ==========

#[derive(Debug, Serialize, Deserialize)]
pub struct CapacityBody {
    capacity: u32,
}

async fn get_capacity(State(state): State<AppState>) -> Response {
    match service::get_worker_capacity(&state.db).await {
        Ok(capacity) => Json(CapacityBody { capacity }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn set_capacity(State(state): State<AppState>, Json(body): Json<CapacityBody>) -> Response {
    match service::set_worker_capacity(&state.db, body.capacity).await {
        Ok(()) => Json(body).into_response(),
        Err(e) => e.into_response(),
    }
}

// ========== History Routes ==========

#[derive(Debug, Deserialize)]
pub struct RunsParams {
    channel: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

async fn recent_runs(State(state): State<AppState>, Query(params): Query<RunsParams>) -> Response {
    let runs: Vec<CrawlRun> = match get_recent_runs(
        state.db.pool(),
        params.channel.as_deref(),
        clamp_limit(params.limit),
    )
    .await
    {
        Ok(runs) => runs,
        Err(e) => return ServiceError::Store(e).into_response(),
    };
    Json(ListResponse { data: runs }).into_response()
}

#[derive(Debug, Deserialize)]
pub struct PostsParams {
    limit: Option<i64>,
}

async fn channel_posts(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(params): Query<PostsParams>,
) -> Response {
    if let Err(e) = service::validate_channel_id(&channel) {
        return e.into_response();
    }
    let posts: Vec<StoredPost> =
        match get_posts_for_channel(state.db.pool(), &channel, clamp_limit(params.limit)).await {
            Ok(posts) => posts,
            Err(e) => return ServiceError::Store(e).into_response(),
        };
    Json(ListResponse { data: posts }).into_response()
}
