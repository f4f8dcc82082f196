use crate::auth::require_internal_token;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use broker_core::TaskEvent;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    worker_id: String,
}

/// `POST /internal/worker/tasks` — Claim. 200 `{task, input}` or 204.
pub async fn claim(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<impl IntoResponse> {
    require_internal_token(&headers, &state.cfg)?;

    let claimed = state
        .queue
        .claim(&req.worker_id, state.cfg.queue_block)
        .await?;

    Ok(match claimed {
        Some((task, input)) => {
            (StatusCode::OK, Json(serde_json::json!({ "task": task, "input": input }))).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    #[serde(default)]
    requeue: bool,
}

/// `POST /internal/worker/tasks/{id}/ack` — Ack or requeue.
pub async fn ack(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(req): Json<AckRequest>,
) -> ApiResult<impl IntoResponse> {
    require_internal_token(&headers, &state.cfg)?;

    if req.requeue {
        state.queue.requeue(task_id).await?;
    } else {
        state.queue.ack(task_id).await?;
    }

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    worker_id: String,
    /// Extension length; defaults to `LEASE_MS` when omitted. Clamped to
    /// `[15_000 ms, 5 * LEASE_MS]` by the queue.
    #[serde(default)]
    ttl_ms: Option<u64>,
}

/// `POST /internal/worker/tasks/{id}/heartbeat` — lease renewal. 409 if
/// `worker_id` does not currently hold the lease.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<impl IntoResponse> {
    require_internal_token(&headers, &state.cfg)?;

    let ttl = Duration::from_millis(req.ttl_ms.unwrap_or(state.cfg.lease_ms.max(0) as u64));
    state
        .queue
        .extend_lease(task_id, &req.worker_id, ttl)
        .await?;

    Ok(StatusCode::OK)
}

/// `POST /internal/tasks/{id}/events` — Append event.
pub async fn append_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(event): Json<TaskEvent>,
) -> ApiResult<impl IntoResponse> {
    require_internal_token(&headers, &state.cfg)?;

    if event.task_id != task_id {
        return Err(ApiError::bad_request("event.taskId does not match path"));
    }

    state
        .repo
        .append_event(task_id, &event.event_type, event.payload)
        .await?;

    Ok(StatusCode::OK)
}
