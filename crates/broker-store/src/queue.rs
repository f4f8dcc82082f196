use crate::row::{store_err, stored_task_from_row};
use broker_core::model::{StoredTask, Task};
use broker_core::{BrokerError, Result};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Default lease TTL (`LEASE_MS`).
pub const DEFAULT_LEASE_MS: i64 = 60_000;

/// `ExtendLease`'s `ttl` clamp bounds.
const MIN_TTL_MS: i64 = 15_000;

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Postgres-backed Task Queue: owns `task_queue` (FIFO + dedup pending-set
/// in one table) and `task_leases` exclusively.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    lease_ms: i64,
}

impl PgQueue {
    pub fn new(pool: PgPool, lease_ms: i64) -> Self {
        Self { pool, lease_ms }
    }

    /// No-op if `task_id` is already pending.
    pub async fn enqueue(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_queue (task_id, enqueued_at)
            VALUES ($1, now())
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Runs `RequeueLeases`, then blocking-pops the FIFO head and installs
    /// a lease for `worker_id`. Returns `None` on timeout.
    pub async fn claim(
        &self,
        worker_id: &str,
        block: Duration,
    ) -> Result<Option<(Task, serde_json::Value)>> {
        let deadline = Instant::now() + block;
        self.requeue_expired_leases().await?;
        loop {
            if let Some(task_id) = self.try_claim_one(worker_id).await? {
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

                let Some(row) = row else {
                    // Defensive only: tasks are never deleted by the core.
                    self.release_lease_and_requeue(task_id).await?;
                    continue;
                };

                let stored: StoredTask = stored_task_from_row(&row).map_err(store_err)?;
                let input = serde_json::to_value(&stored.input)
                    .map_err(|err| BrokerError::internal(err.to_string()))?;
                return Ok(Some((stored.sanitize(), input)));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(block)).await;
        }
    }

    pub async fn ack(&self, task_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query("DELETE FROM task_leases WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("DELETE FROM task_queue WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    pub async fn requeue(&self, task_id: Uuid) -> Result<()> {
        self.ack(task_id).await?;
        self.enqueue(task_id).await
    }

    /// Extends `worker_id`'s lease on `task_id`. `ttl` is clamped to
    /// `[15_000 ms, 5 * LEASE_MS]`. Fails `Conflict` if `worker_id` does not
    /// currently hold the lease (including when no lease exists at all).
    pub async fn extend_lease(&self, task_id: Uuid, worker_id: &str, ttl: Duration) -> Result<()> {
        let ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;
        let clamped = ttl_ms.min(5 * self.lease_ms).max(MIN_TTL_MS);

        let row = sqlx::query(
            r#"
            UPDATE task_leases
            SET renewals = renewals + 1,
                renewed_at = now(),
                expires_at = now() + ($3::text || ' milliseconds')::interval
            WHERE task_id = $1 AND worker_id = $2
            RETURNING task_id
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(clamped)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        if row.is_some() {
            Ok(())
        } else {
            Err(BrokerError::conflict(format!(
                "worker {worker_id} does not hold the lease for task {task_id}"
            )))
        }
    }

    /// For every task whose lease has expired: drop the lease and
    /// re-enqueue. Runs automatically at the start of `claim`, and may
    /// also be called periodically by a standalone reaper loop.
    pub async fn requeue_expired_leases(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let expired = sqlx::query(
            r#"
            SELECT task_id FROM task_leases
            WHERE expires_at <= now()
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        for row in &expired {
            let task_id: Uuid = row.try_get("task_id").map_err(store_err)?;
            sqlx::query("DELETE FROM task_leases WHERE task_id = $1")
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            sqlx::query(
                r#"
                INSERT INTO task_queue (task_id, enqueued_at)
                VALUES ($1, now())
                ON CONFLICT (task_id) DO NOTHING
                "#,
            )
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    /// Pops the FIFO head and installs a lease for `worker_id` in one
    /// transaction, fenced by `FOR UPDATE SKIP LOCKED` so concurrent
    /// claimants never pop the same id twice.
    async fn try_claim_one(&self, worker_id: &str) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            r#"
            WITH popped AS (
                DELETE FROM task_queue
                WHERE task_id = (
                    SELECT task_id FROM task_queue
                    ORDER BY enqueued_at
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING task_id
            )
            INSERT INTO task_leases (task_id, worker_id, leased_at, renewals, expires_at)
            SELECT task_id, $1, now(), 0, now() + ($2::text || ' milliseconds')::interval
            FROM popped
            ON CONFLICT (task_id) DO NOTHING
            RETURNING task_id
            "#,
        )
        .bind(worker_id)
        .bind(self.lease_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(|r| r.try_get("task_id")).transpose().map_err(store_err)?)
    }

    async fn release_lease_and_requeue(&self, task_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM task_leases WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        self.enqueue(task_id).await
    }
}
