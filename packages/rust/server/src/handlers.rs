//! Route handlers for the `/pipeline` API.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde_json::{Value, json};
use tracing::info;

use codekb_core::SubscriptionTarget;
use codekb_shared::{CodeKbError, RunId, StepStatus};

use crate::AppState;
use crate::dto::StartPipelineRequest;
use crate::error::ApiError;
use crate::sse;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Unparseable ids cannot name a known run.
fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    raw.parse().map_err(|_| ApiError(CodeKbError::not_found(raw)))
}

fn parse_step_ordinal(raw: &str) -> ApiResult<u8> {
    raw.parse().map_err(|_| {
        ApiError(CodeKbError::invalid_argument(format!(
            "step id must be a number between 1 and 5, got '{raw}'"
        )))
    })
}

pub(crate) async fn start_pipeline(
    State(state): State<AppState>,
    body: Result<Json<StartPipelineRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = body?;
    let config = request.into_config(&state.config)?;
    let started = state.registry.start(config).await?;
    info!(run_id = %started.run_id, "pipeline started in background");
    Ok(Json(json!({ "success": true, "pipeline": started })))
}

pub(crate) async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let snapshot = state.registry.get_status(&parse_run_id(&id)?).await?;
    Ok(Json(json!({ "success": true, "pipeline": snapshot })))
}

pub(crate) async fn list_pipelines(State(state): State<AppState>) -> Json<Value> {
    let pipelines = state.registry.list().await;
    Json(json!({ "success": true, "pipelines": pipelines }))
}

pub(crate) async fn cancel_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = state.registry.cancel(&parse_run_id(&id)?).await?;
    Ok(Json(json!({ "success": true, "pipeline": outcome })))
}

pub(crate) async fn run_step(
    State(state): State<AppState>,
    Path(step_id): Path<String>,
    body: Result<Json<StartPipelineRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let ordinal = parse_step_ordinal(&step_id)?;
    codekb_shared::step_by_ordinal(ordinal)?;
    let Json(request) = body?;
    let config = request.into_config(&state.config)?;

    let outcome = state.registry.run_step(ordinal, config).await?;
    let success = outcome.state.status == StepStatus::Completed;
    Ok(Json(json!({ "success": success, "step": outcome })))
}

pub(crate) async fn steps_status(State(state): State<AppState>) -> Json<Value> {
    let steps = state.registry.steps_status().await;
    Json(json!({ "success": true, "steps": steps }))
}

pub(crate) async fn stream_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run_id = parse_run_id(&id)?;
    let snapshot = state.registry.get_status(&run_id).await?;

    let broadcaster = state.registry.broadcaster().clone();
    let (conn, rx) = broadcaster.connect();
    let conn_id = conn.id();
    broadcaster.subscribe(SubscriptionTarget::Run(run_id), conn, Some(&snapshot));
    Ok(sse::event_stream(broadcaster, conn_id, rx))
}

pub(crate) async fn stream_global(State(state): State<AppState>) -> impl IntoResponse {
    let broadcaster = state.registry.broadcaster().clone();
    let (conn, rx) = broadcaster.connect();
    let conn_id = conn.id();
    broadcaster.subscribe(SubscriptionTarget::Global, conn, None);
    sse::event_stream(broadcaster, conn_id, rx)
}

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "success": true, "status": "ok" }))
}
