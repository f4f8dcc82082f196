use crate::{internal, public, state::AppState};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks", post(public::create_task).get(public::list_or_subscribe_tasks))
        .route("/tasks/:id", get(public::get_snapshot))
        .route("/tasks/:id/events", get(public::task_events))
        .route("/internal/worker/tasks", post(internal::claim))
        .route("/internal/worker/tasks/:id/ack", post(internal::ack))
        .route("/internal/worker/tasks/:id/heartbeat", post(internal::heartbeat))
        .route("/internal/tasks/:id/events", post(internal::append_event))
        .with_state(state)
}
