use crate::state::AppState;
use async_stream::stream;
use axum::response::sse::Event;
use broker_core::StreamCursor;
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

/// `{task, events[], cursor}` followed by one `event: <event.type>` message
/// per subsequent append, then tailing forever until the client
/// disconnects (which simply drops this generator).
pub fn task_event_stream(
    state: Arc<AppState>,
    task_id: Uuid,
    cursor: Option<StreamCursor>,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    stream! {
        let mut cursor = match cursor {
            Some(c) => c,
            None => match state.repo.snapshot(task_id).await {
                Ok(snapshot) => {
                    let last = StreamCursor::parse(&snapshot.cursor).unwrap_or(StreamCursor::BEGINNING);
                    if let Ok(event) = Event::default().event("snapshot").json_data(&snapshot) {
                        yield Ok(event);
                    }
                    last
                }
                Err(err) => {
                    tracing::warn!(event = "broker.http.sse.snapshot_error", %task_id, error = %err, "snapshot failed");
                    return;
                }
            },
        };

        loop {
            match state
                .repo
                .tail_task(task_id, cursor, state.cfg.queue_block, state.cfg.max_tail_count)
                .await
            {
                Ok((events, new_cursor)) => {
                    cursor = new_cursor;
                    for event in events {
                        let event_type = event.event_type.clone();
                        if let Ok(sse_event) = Event::default().event(event_type).json_data(&event) {
                            yield Ok(sse_event);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(event = "broker.http.sse.tail_error", %task_id, error = %err, "tail read failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// `{tasks[]}` followed by `event: task, data: Task` per subsequent
/// index-stream persistence.
pub fn index_event_stream(
    state: Arc<AppState>,
    cursor: StreamCursor,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    stream! {
        let mut cursor = cursor;

        match state.repo.index_snapshot().await {
            Ok(snapshot) => {
                if let Ok(event) = Event::default().event("snapshot").json_data(&snapshot) {
                    yield Ok(event);
                }
                if let Ok(parsed) = StreamCursor::parse(&snapshot.cursor) {
                    cursor = parsed;
                }
            }
            Err(err) => {
                tracing::warn!(event = "broker.http.sse.index_snapshot_error", error = %err, "index snapshot failed");
                return;
            }
        }

        loop {
            match state
                .repo
                .tail_index(cursor, state.cfg.queue_block, state.cfg.max_index_tail_count)
                .await
            {
                Ok((tasks, new_cursor)) => {
                    cursor = new_cursor;
                    for task in tasks {
                        if let Ok(sse_event) = Event::default().event("task").json_data(&task) {
                            yield Ok(sse_event);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(event = "broker.http.sse.index_tail_error", error = %err, "index tail read failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}
