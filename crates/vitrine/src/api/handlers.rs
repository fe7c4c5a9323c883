//! HTTP handlers for demo sessions.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use tracing::{info, instrument};

use crate::container::ContainerStats;
use crate::jobs::SweepScope;
use crate::session::{
    AggregateStats, Credentials, SessionTransition, SessionView, StartSessionRequest,
    StartedSession, SwitchUserRequest,
};
use crate::sweeper::SweepReport;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn require(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{} is required", field)));
    }
    Ok(())
}

/// Launch a demo.
///
/// POST /api/demo/sessions
#[instrument(skip(state))]
pub async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<(StatusCode, Json<StartedSession>)> {
    require("project", &request.project)?;
    require("username", &request.username)?;

    let started = state
        .jobs
        .start_session(&request.project, &request.username)
        .await?;
    info!(session_id = %started.session_id, host_port = started.host_port, "Demo session started");
    Ok((StatusCode::CREATED, Json(started)))
}

/// GET /api/demo/sessions
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionView>>> {
    Ok(Json(state.demo.list_active_sessions().await?))
}

/// GET /api/demo/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    Ok(Json(state.demo.get_status(&session_id).await?))
}

/// DELETE /api/demo/sessions/{session_id}
#[instrument(skip(state))]
pub async fn terminate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.jobs.terminate(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/demo/sessions/{session_id}/switch
#[instrument(skip(state))]
pub async fn switch_user(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<SwitchUserRequest>,
) -> ApiResult<Json<Credentials>> {
    require("username", &request.username)?;
    let credentials = state
        .jobs
        .switch_user(&session_id, &request.username)
        .await?;
    Ok(Json(credentials))
}

/// Visitor heartbeat.
///
/// POST /api/demo/sessions/{session_id}/activity
pub async fn touch_activity(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.demo.touch_activity(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/demo/sessions/{session_id}/freeze
pub async fn freeze_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    Ok(Json(state.demo.freeze_session(&session_id).await?))
}

/// POST /api/demo/sessions/{session_id}/unfreeze
pub async fn unfreeze_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    Ok(Json(state.demo.unfreeze_session(&session_id).await?))
}

/// GET /api/demo/sessions/{session_id}/stats
pub async fn session_stats(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<ContainerStats>> {
    Ok(Json(state.demo.session_stats(&session_id).await?))
}

/// GET /api/demo/sessions/{session_id}/history
pub async fn session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<SessionTransition>>> {
    Ok(Json(state.demo.session_history(&session_id).await?))
}

/// GET /api/demo/stats
pub async fn aggregate_stats(State(state): State<AppState>) -> ApiResult<Json<AggregateStats>> {
    Ok(Json(state.demo.aggregate_stats().await?))
}

/// Run a full reconciliation pass now.
///
/// POST /api/demo/sweep
#[instrument(skip(state))]
pub async fn sweep(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.jobs.sweep(SweepScope::Full).await?))
}
