use crate::error::ApiResult;
use crate::session::ensure_session_cookie;
use crate::sse::{index_event_stream, task_event_stream};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Sse},
    Json,
};
use broker_core::{CreateTaskInput, StreamCursor};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<CreateTaskInput>,
) -> ApiResult<impl IntoResponse> {
    let task = state.repo.create(input).await?;
    state.queue.enqueue(task.id).await?;
    let mut response = (StatusCode::CREATED, Json(serde_json::json!({ "task": task }))).into_response();
    attach_session_cookie(&headers, &state, response.headers_mut());
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    cursor: Option<String>,
}

/// `GET /tasks`. When the client negotiates `text/event-stream` this
/// serves the index-stream SSE variant (snapshot then tail); otherwise a
/// plain JSON list, per the two rows the wire contract gives the same
/// path.
pub async fn list_or_subscribe_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<axum::response::Response> {
    if wants_event_stream(&headers) {
        let cursor = match &query.cursor {
            Some(raw) => StreamCursor::parse(raw)?,
            None => StreamCursor::BEGINNING,
        };
        let stream = index_event_stream(state, cursor);
        return Ok(Sse::new(stream)
            .keep_alive(axum::response::sse::KeepAlive::default())
            .into_response());
    }

    let tasks = state.repo.list().await?;
    Ok(Json(serde_json::json!({ "tasks": tasks })).into_response())
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.repo.snapshot(task_id).await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct TailQuery {
    cursor: Option<String>,
}

/// `GET /tasks/{id}/events` — SSE: snapshot then tail.
pub async fn task_events(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    Query(query): Query<TailQuery>,
) -> ApiResult<impl IntoResponse> {
    // Validate the task exists before handing back a stream that would
    // otherwise block forever on a nonexistent task.
    state.repo.get(task_id).await?;
    let cursor = match &query.cursor {
        Some(raw) => Some(StreamCursor::parse(raw)?),
        None => None,
    };
    let stream = task_event_stream(state, task_id, cursor);
    Ok(Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default()))
}

fn attach_session_cookie(headers: &HeaderMap, state: &AppState, out: &mut axum::http::HeaderMap) {
    if let Some(cookie) = ensure_session_cookie(headers, &state.cfg.session_cookie_name) {
        out.insert(header::SET_COOKIE, cookie);
    }
}
