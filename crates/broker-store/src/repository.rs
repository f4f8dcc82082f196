use crate::row::{store_err, stored_task_from_row};
use broker_core::cursor::StreamCursor;
use broker_core::model::{CreateTaskInput, IndexSnapshot, StoredTask, Task, TaskEvent, TaskSnapshot};
use broker_core::{derive, validate, BrokerError, Result, TaskStatus};
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// How often a blocking tail read re-polls the store while waiting for new
/// entries. Short enough that a client's `blockDuration` deadline is
/// honored within a bounded error margin.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Postgres-backed Task Repository: owns the `tasks` and `task_events` /
/// `task_index_stream` tables exclusively.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
    /// Soft per-stream cap (`STREAM_TRIM_THRESHOLD`).
    trim_threshold: i64,
}

impl PgRepository {
    pub fn new(pool: PgPool, trim_threshold: i64) -> Self {
        Self {
            pool,
            trim_threshold,
        }
    }

    pub async fn create(&self, input: CreateTaskInput) -> Result<Task> {
        validate::validate_create_input(&input)?;

        let task_id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(store_err)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, title, description, repo_url, branch, base_branch,
                constraints, status, plan, created_at, updated_at,
                risk_score, input
            ) VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, 'queued', '[]'::jsonb, $8, $8,
                $9, $10
            )
            "#,
        )
        .bind(task_id)
        .bind(&input.title)
        .bind(&input.description)
        .bind(&input.repo_url)
        .bind(&input.branch)
        .bind(&input.base_branch)
        .bind(serde_json::to_value(input.constraints.clone().unwrap_or_default()).unwrap())
        .bind(now)
        .bind(broker_core::model::DEFAULT_RISK_SCORE)
        .bind(serde_json::to_value(&input).map_err(|err| BrokerError::internal(err.to_string()))?)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        let payload = serde_json::to_value(&input).map_err(|err| BrokerError::internal(err.to_string()))?;
        let (task, _event) = self
            .append_event_tx(&mut tx, task_id, "task.created", Some(payload))
            .await?;

        tx.commit().await.map_err(store_err)?;
        Ok(task)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Task> {
        let row = sqlx::query(
            r#"
            SELECT task_id, title, description, repo_url, branch, base_branch,
                   constraints, status, plan, created_at, updated_at, assignee,
                   latest_event_id, latest_stream_seq, risk_score, input
            FROM tasks
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let row = row.ok_or_else(|| BrokerError::not_found(format!("task {task_id} not found")))?;
        let stored = stored_task_from_row(&row).map_err(store_err)?;
        Ok(stored.sanitize())
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, title, description, repo_url, branch, base_branch,
                   constraints, status, plan, created_at, updated_at, assignee,
                   latest_event_id, latest_stream_seq, risk_score, input
            FROM tasks
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| stored_task_from_row(row).map(|s| s.sanitize()).map_err(store_err))
            .collect()
    }

    /// `AppendEvent` — validates the event type, derives plan/status, and
    /// persists atomically.
    pub async fn append_event(
        &self,
        task_id: Uuid,
        event_type: &str,
        payload: Option<Value>,
    ) -> Result<()> {
        validate::validate_event_type(event_type)?;
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        self.append_event_tx(&mut tx, task_id, event_type, payload)
            .await?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    /// Convenience wrapper that synthesizes a `task.updated` event.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        mut extra: Value,
    ) -> Result<()> {
        if !extra.is_object() {
            extra = Value::Object(Default::default());
        }
        extra["status"] = Value::String(status.as_str().to_string());
        self.append_event(task_id, "task.updated", Some(extra)).await
    }

    pub async fn snapshot(&self, task_id: Uuid) -> Result<TaskSnapshot> {
        let task = self.get(task_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, event_id, task_id, event_type, occurred_at, payload
            FROM task_events
            WHERE task_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut last_id = 0i64;
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(store_err)?;
            last_id = last_id.max(id);
            events.push(task_event_from_row(row).map_err(store_err)?);
        }

        Ok(TaskSnapshot {
            task,
            events,
            cursor: StreamCursor::from(last_id).to_wire(),
        })
    }

    /// Blocking read on the per-task stream.
    pub async fn tail_task(
        &self,
        task_id: Uuid,
        cursor: StreamCursor,
        block: Duration,
        max_count: i64,
    ) -> Result<(Vec<TaskEvent>, StreamCursor)> {
        let deadline = Instant::now() + block;
        loop {
            let rows = sqlx::query(
                r#"
                SELECT id, event_id, task_id, event_type, occurred_at, payload
                FROM task_events
                WHERE task_id = $1 AND id > $2
                ORDER BY id ASC
                LIMIT $3
                "#,
            )
            .bind(task_id)
            .bind(cursor.0)
            .bind(max_count)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

            if !rows.is_empty() {
                let mut last = cursor;
                let mut events = Vec::with_capacity(rows.len());
                for row in &rows {
                    let id: i64 = row.try_get("id").map_err(store_err)?;
                    last = StreamCursor::from(id);
                    events.push(task_event_from_row(row).map_err(store_err)?);
                }
                return Ok((events, last));
            }

            if Instant::now() >= deadline {
                return Ok((Vec::new(), cursor));
            }
            tokio::time::sleep(TAIL_POLL_INTERVAL.min(block)).await;
        }
    }

    /// Blocking read on the global task-index stream.
    pub async fn tail_index(
        &self,
        cursor: StreamCursor,
        block: Duration,
        max_count: i64,
    ) -> Result<(Vec<Task>, StreamCursor)> {
        let deadline = Instant::now() + block;
        loop {
            let rows = sqlx::query(
                r#"
                SELECT id, snapshot
                FROM task_index_stream
                WHERE id > $1
                ORDER BY id ASC
                LIMIT $2
                "#,
            )
            .bind(cursor.0)
            .bind(max_count)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

            if !rows.is_empty() {
                let mut last = cursor;
                let mut tasks = Vec::with_capacity(rows.len());
                for row in &rows {
                    let id: i64 = row.try_get("id").map_err(store_err)?;
                    last = StreamCursor::from(id);
                    let snapshot: Value = row.try_get("snapshot").map_err(store_err)?;
                    let task: Task = serde_json::from_value(snapshot)
                        .map_err(|err| BrokerError::internal(err.to_string()))?;
                    tasks.push(task);
                }
                return Ok((tasks, last));
            }

            if Instant::now() >= deadline {
                return Ok((Vec::new(), cursor));
            }
            tokio::time::sleep(TAIL_POLL_INTERVAL.min(block)).await;
        }
    }

    pub async fn index_snapshot(&self) -> Result<IndexSnapshot> {
        let tasks = self.list().await?;
        let cursor = sqlx::query("SELECT COALESCE(MAX(id), 0) AS last FROM task_index_stream")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?
            .try_get::<i64, _>("last")
            .map_err(store_err)?;
        Ok(IndexSnapshot {
            tasks,
            cursor: StreamCursor::from(cursor).to_wire(),
        })
    }

    /// The shared core of `Create`, `AppendEvent`, and `UpdateStatus`:
    /// derive plan before status, persist the event, trim, update the
    /// task row, and fan out to the index stream, all in `tx`.
    async fn append_event_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        task_id: Uuid,
        event_type: &str,
        payload: Option<Value>,
    ) -> Result<(Task, TaskEvent)> {
        let row = sqlx::query(
            r#"
            SELECT task_id, title, description, repo_url, branch, base_branch,
                   constraints, status, plan, created_at, updated_at, assignee,
                   latest_event_id, latest_stream_seq, risk_score, input
            FROM tasks
            WHERE task_id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(store_err)?;

        let row = row.ok_or_else(|| BrokerError::not_found(format!("task {task_id} not found")))?;
        let mut stored: StoredTask = stored_task_from_row(&row).map_err(store_err)?;

        let now = Utc::now();
        let event_id = Uuid::new_v4();
        let payload_value = payload.unwrap_or(Value::Null);

        // Derivation order: plan before status (§4.1).
        if let Some(plan) = derive::plan_from_payload(&payload_value) {
            stored.task.plan = plan;
        }
        if let Some(status) = derive::status_from_payload(&payload_value) {
            stored.task.status = status;
        }
        stored.task.updated_at = now;
        stored.task.latest_event_id = Some(event_id);

        let stream_id: i64 = sqlx::query(
            r#"
            INSERT INTO task_events (task_id, event_id, event_type, occurred_at, payload)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(&payload_value)
        .fetch_one(&mut **tx)
        .await
        .map_err(store_err)?
        .try_get("id")
        .map_err(store_err)?;

        stored.latest_stream_seq = stream_id;
        trim_task_stream(tx, task_id, self.trim_threshold).await?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET title = $2, description = $3, repo_url = $4, branch = $5,
                base_branch = $6, constraints = $7, status = $8, plan = $9,
                updated_at = $10, assignee = $11, latest_event_id = $12,
                latest_stream_seq = $13, risk_score = $14
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(&stored.task.title)
        .bind(&stored.task.description)
        .bind(&stored.task.repo_url)
        .bind(&stored.task.branch)
        .bind(&stored.task.base_branch)
        .bind(serde_json::to_value(&stored.task.constraints).unwrap())
        .bind(stored.task.status.as_str())
        .bind(serde_json::to_value(&stored.task.plan).unwrap())
        .bind(stored.task.updated_at)
        .bind(&stored.task.assignee)
        .bind(stored.task.latest_event_id)
        .bind(stored.latest_stream_seq)
        .bind(stored.task.risk_score)
        .execute(&mut **tx)
        .await
        .map_err(store_err)?;

        let sanitized = stored.sanitize();
        let snapshot = serde_json::to_value(&sanitized)
            .map_err(|err| BrokerError::internal(err.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO task_index_stream (task_id, snapshot, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(task_id)
        .bind(snapshot)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(store_err)?;

        trim_index_stream(tx, self.trim_threshold).await?;

        let event = TaskEvent {
            id: event_id,
            task_id,
            event_type: event_type.to_string(),
            timestamp: now.timestamp_millis(),
            payload: if payload_value.is_null() {
                None
            } else {
                Some(payload_value)
            },
        };

        Ok((sanitized, event))
    }
}

fn task_event_from_row(row: &sqlx::postgres::PgRow) -> sqlx::Result<TaskEvent> {
    let occurred_at: chrono::DateTime<Utc> = row.try_get("occurred_at")?;
    let payload: Option<Value> = row.try_get("payload")?;
    Ok(TaskEvent {
        id: row.try_get("event_id")?,
        task_id: row.try_get("task_id")?,
        event_type: row.try_get("event_type")?,
        timestamp: occurred_at.timestamp_millis(),
        payload: payload.filter(|v| !v.is_null()),
    })
}

/// Approximate trim to ~`threshold` entries for one task's stream.
async fn trim_task_stream(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    threshold: i64,
) -> Result<()> {
    if threshold <= 0 {
        return Ok(());
    }
    sqlx::query(
        r#"
        DELETE FROM task_events
        WHERE task_id = $1
          AND id <= (
              SELECT id FROM task_events
              WHERE task_id = $1
              ORDER BY id DESC
              OFFSET $2 LIMIT 1
          )
        "#,
    )
    .bind(task_id)
    .bind(threshold.saturating_sub(1))
    .execute(&mut **tx)
    .await
    .map_err(store_err)?;
    Ok(())
}

/// Approximate trim to ~`threshold` entries for the global index stream.
async fn trim_index_stream(tx: &mut Transaction<'_, Postgres>, threshold: i64) -> Result<()> {
    if threshold <= 0 {
        return Ok(());
    }
    sqlx::query(
        r#"
        DELETE FROM task_index_stream
        WHERE id <= (
            SELECT id FROM task_index_stream
            ORDER BY id DESC
            OFFSET $1 LIMIT 1
        )
        "#,
    )
    .bind(threshold.saturating_sub(1))
    .execute(&mut **tx)
    .await
    .map_err(store_err)?;
    Ok(())
}
