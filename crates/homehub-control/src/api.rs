use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
};
use homehub_agent::logs::DEFAULT_TAIL_LINES;
use homehub_process::{
    AppId, AppSummary, HealthReport, HubInfo, LogStream, LogTail, ProcessStatus, SchedulerStatus,
};
use serde::{Deserialize, Serialize};

use crate::error_payload::ApiError;
use crate::request_meta::{self, RequestMeta};
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    let apps = Router::new()
        .route("/", get(list_apps))
        .route("/:id/status", get(app_status))
        .route("/:id/start", post(start_app))
        .route("/:id/stop", post(stop_app))
        .route("/:id/restart", post(restart_app))
        .route("/:id/activity", post(touch_activity))
        .route("/:id/open", get(open_app))
        .route("/:id/health", get(app_health))
        .route("/:id/logs", get(app_logs));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/hub", get(hub_info))
        .route("/api/scheduler", get(scheduler_status))
        .nest("/api/apps", apps)
        .layer(middleware::from_fn(request_meta::request_id))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    apps: usize,
    scheduler_running: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        apps: state.manager.apps().count(),
        scheduler_running: state.scheduler.is_running(),
    })
}

async fn hub_info(State(state): State<AppState>) -> Json<HubInfo> {
    Json(state.aggregator.hub_info())
}

async fn list_apps(State(state): State<AppState>) -> Json<Vec<AppSummary>> {
    Json(state.aggregator.list_apps().await)
}

async fn app_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ProcessStatus> {
    Ok(Json(state.manager.status(&id).await?))
}

async fn start_app(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
) -> ApiResult<ProcessStatus> {
    tracing::info!(app_id = %id, request_id = %meta.request_id, "start requested");
    Ok(Json(state.manager.start(&id).await?))
}

async fn stop_app(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
) -> ApiResult<ProcessStatus> {
    tracing::info!(app_id = %id, request_id = %meta.request_id, "stop requested");
    Ok(Json(state.manager.stop(&id).await?))
}

async fn restart_app(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(id): Path<String>,
) -> ApiResult<ProcessStatus> {
    tracing::info!(app_id = %id, request_id = %meta.request_id, "restart requested");
    Ok(Json(state.manager.restart(&id).await?))
}

async fn touch_activity(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ProcessStatus> {
    Ok(Json(state.manager.touch_activity(&id).await?))
}

#[derive(Debug, Serialize)]
struct OpenResponse {
    app_id: AppId,
    url: String,
    status: ProcessStatus,
}

// Opening an app in the dashboard counts as activity.
async fn open_app(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<OpenResponse> {
    let url = state.manager.app_url(&id)?;
    let status = state.manager.touch_activity(&id).await?;
    Ok(Json(OpenResponse {
        app_id: status.app_id.clone(),
        url,
        status,
    }))
}

async fn app_health(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<HealthReport> {
    Ok(Json(state.manager.health(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    stream: Option<String>,
    lines: Option<String>,
}

fn parse_logs_query(q: &LogsQuery) -> Result<(LogStream, usize), ApiError> {
    let stream = match q.stream.as_deref() {
        None => LogStream::default(),
        Some("stdout") => LogStream::Stdout,
        Some("stderr") => LogStream::Stderr,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unknown stream `{other}`; expected stdout or stderr"
            )));
        }
    };
    let lines = match q.lines.as_deref() {
        None => DEFAULT_TAIL_LINES,
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ApiError::bad_request(format!(
                    "lines must be a positive integer, got `{raw}`"
                )));
            }
        },
    };
    Ok((stream, lines))
}

async fn app_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<LogTail> {
    let (stream, lines) = parse_logs_query(&q)?;
    Ok(Json(state.manager.tail_log(&id, stream, lines).await?))
}

async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status().await)
}
