use agent_task_broker::{config::BrokerConfig, migrate, server::BrokerServer};
use anyhow::Context;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::{
    net::SocketAddr,
    sync::{Once, OnceLock},
    time::Duration,
};
use uuid::Uuid;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

/// Tests share one Postgres instance; serialize them so truncation between
/// tests can't race a still-running server from a previous test.
async fn integration_lock() -> tokio::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
        .lock()
        .await
}

async fn migrated_config() -> anyhow::Result<BrokerConfig> {
    init_tracing();
    let cfg = BrokerConfig::from_env().context("load broker config")?;
    migrate::run(&cfg).await.context("run migrations")?;

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&cfg.database_url)
        .await
        .context("connect for cleanup")?;
    sqlx::query(
        "TRUNCATE task_leases, task_queue, task_index_stream, task_events, tasks RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .context("truncate broker tables")?;
    Ok(cfg)
}

async fn start_server(cfg: &BrokerConfig) -> anyhow::Result<BrokerServer> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect store")?;
    BrokerServer::start(pool, cfg, "127.0.0.1:0".parse::<SocketAddr>().unwrap()).await
}

/// S1 — Create-claim-complete: creating a task makes it claimable, and
/// completing it (via AppendEvent + Ack) is reflected in the snapshot.
#[tokio::test]
async fn create_claim_complete_round_trip() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let mut cfg = migrated_config().await?;
    cfg.internal_token = None;
    let server = start_server(&cfg).await?;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "Refactor the widget pipeline" }))
        .send()
        .await?
        .json()
        .await?;
    let task_id = created["task"]["id"].as_str().context("task id")?.to_string();
    anyhow::ensure!(created["task"]["status"] == "queued", "new task must be queued");

    let claimed: serde_json::Value = client
        .post(format!("{base}/internal/worker/tasks"))
        .json(&json!({ "workerId": "worker-1" }))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(
        claimed["task"]["id"].as_str() == Some(task_id.as_str()),
        "claim should return the only pending task"
    );

    let event_id = Uuid::new_v4();
    let resp = client
        .post(format!("{base}/internal/tasks/{task_id}/events"))
        .json(&json!({
            "id": event_id,
            "taskId": task_id,
            "type": "task.completed",
            "timestamp": 0,
            "payload": { "status": "completed" },
        }))
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success(), "append_event should succeed");

    let ack_resp = client
        .post(format!("{base}/internal/worker/tasks/{task_id}/ack"))
        .json(&json!({}))
        .send()
        .await?;
    anyhow::ensure!(ack_resp.status().is_success(), "ack should succeed");

    let snapshot: serde_json::Value = client
        .get(format!("{base}/tasks/{task_id}"))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(
        snapshot["task"]["status"] == "completed",
        "status should derive from the completed event's payload"
    );
    anyhow::ensure!(
        snapshot["events"].as_array().map(|e| e.len()) == Some(2),
        "snapshot should contain task.created and task.completed"
    );

    server.shutdown().await?;
    Ok(())
}

/// S3 — Dedup enqueue: enqueuing the same task twice (once implicitly via
/// Create, once explicitly by requeuing after ack) never yields two
/// concurrent claims of it.
#[tokio::test]
async fn concurrent_claim_yields_one_success() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let mut cfg = migrated_config().await?;
    cfg.internal_token = None;
    cfg.queue_block_seconds = 0;
    let server = start_server(&cfg).await?;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "Only one claimant should win" }))
        .send()
        .await?;

    let claim = || {
        client
            .post(format!("{base}/internal/worker/tasks"))
            .json(&json!({ "workerId": Uuid::new_v4().to_string() }))
            .send()
    };

    let (r1, r2) = tokio::join!(claim(), claim());
    let codes: Vec<_> = [r1?.status(), r2?.status()].to_vec();
    let claimed = codes.iter().filter(|s| **s == reqwest::StatusCode::OK).count();
    let empty = codes
        .iter()
        .filter(|s| **s == reqwest::StatusCode::NO_CONTENT)
        .count();
    anyhow::ensure!(
        claimed == 1 && empty == 1,
        "expected exactly one successful claim, got {codes:?}"
    );

    server.shutdown().await?;
    Ok(())
}

/// S2 — Lease expiry: a lease that is never acked or renewed is reclaimed
/// by a later claim once `LEASE_MS` has elapsed.
#[tokio::test]
async fn expired_lease_is_requeued_for_a_later_claim() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let mut cfg = migrated_config().await?;
    cfg.internal_token = None;
    cfg.lease_ms = 200;
    let server = start_server(&cfg).await?;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "Task whose worker goes dark" }))
        .send()
        .await?
        .json()
        .await?;
    let task_id = created["task"]["id"].as_str().unwrap().to_string();

    let first: serde_json::Value = client
        .post(format!("{base}/internal/worker/tasks"))
        .json(&json!({ "workerId": "worker-a" }))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(first["task"]["id"].as_str() == Some(task_id.as_str()));

    // Worker A disappears without acking. Wait past the lease TTL, then a
    // second worker's claim should reclaim the same task.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let second: serde_json::Value = client
        .post(format!("{base}/internal/worker/tasks"))
        .json(&json!({ "workerId": "worker-b" }))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(
        second["task"]["id"].as_str() == Some(task_id.as_str()),
        "expired lease should be reclaimed by a subsequent claim"
    );

    server.shutdown().await?;
    Ok(())
}

/// S5 — Plan derivation: a plan.updated event whose payload carries a plan
/// array replaces the task's plan, and a status key in the same payload is
/// derived using the just-replaced plan (derivation order).
#[tokio::test]
async fn plan_and_status_derive_in_order() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let mut cfg = migrated_config().await?;
    cfg.internal_token = None;
    let server = start_server(&cfg).await?;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "Plan-bearing task" }))
        .send()
        .await?
        .json()
        .await?;
    let task_id = created["task"]["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{base}/internal/tasks/{task_id}/events"))
        .json(&json!({
            "id": Uuid::new_v4(),
            "taskId": task_id,
            "type": "plan.updated",
            "timestamp": 0,
            "payload": {
                "plan": [{ "id": "s1", "title": "Read repo", "status": "pending" }],
                "status": "planning",
            },
        }))
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success());

    let task: serde_json::Value = client
        .get(format!("{base}/tasks/{task_id}"))
        .send()
        .await?
        .json()
        .await?;
    let snapshot = &task["task"];
    anyhow::ensure!(snapshot["status"] == "planning");
    anyhow::ensure!(snapshot["plan"].as_array().map(|p| p.len()) == Some(1));

    server.shutdown().await?;
    Ok(())
}

/// S6 — Schema rejection: Create fails closed on a too-short title, and
/// AppendEvent fails closed on an event type outside the closed taxonomy.
#[tokio::test]
async fn schema_violations_are_rejected() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let mut cfg = migrated_config().await?;
    cfg.internal_token = None;
    let server = start_server(&cfg).await?;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let bad_create = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "ab" }))
        .send()
        .await?;
    anyhow::ensure!(bad_create.status() == reqwest::StatusCode::BAD_REQUEST);

    let created: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "Valid title here" }))
        .send()
        .await?
        .json()
        .await?;
    let task_id = created["task"]["id"].as_str().unwrap().to_string();

    let bad_event = client
        .post(format!("{base}/internal/tasks/{task_id}/events"))
        .json(&json!({
            "id": Uuid::new_v4(),
            "taskId": task_id,
            "type": "task.teleported",
            "timestamp": 0,
        }))
        .send()
        .await?;
    anyhow::ensure!(bad_event.status() == reqwest::StatusCode::BAD_REQUEST);

    server.shutdown().await?;
    Ok(())
}

/// Universal property: `updatedAt` never regresses across a run of
/// AppendEvent calls on the same task.
#[tokio::test]
async fn updated_at_is_non_decreasing_across_events() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let mut cfg = migrated_config().await?;
    cfg.internal_token = None;
    let server = start_server(&cfg).await?;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "Timestamp monotonicity" }))
        .send()
        .await?
        .json()
        .await?;
    let task_id = created["task"]["id"].as_str().unwrap().to_string();
    let mut previous = created["task"]["updatedAt"].as_str().unwrap().to_string();

    for i in 0..3 {
        client
            .post(format!("{base}/internal/tasks/{task_id}/events"))
            .json(&json!({
                "id": Uuid::new_v4(),
                "taskId": task_id,
                "type": "log.entry",
                "timestamp": 0,
                "payload": { "message": format!("step {i}") },
            }))
            .send()
            .await?;

        let task: serde_json::Value = client
            .get(format!("{base}/tasks/{task_id}"))
            .send()
            .await?
            .json()
            .await?;
        let current = task["task"]["updatedAt"].as_str().unwrap().to_string();
        anyhow::ensure!(current >= previous, "updatedAt must not regress");
        previous = current;
    }

    server.shutdown().await?;
    Ok(())
}

/// Universal property: the internal surface rejects requests without a
/// valid bearer token once `INTERNAL_TOKEN` is configured.
#[tokio::test]
async fn internal_surface_requires_bearer_token() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let mut cfg = migrated_config().await?;
    cfg.internal_token = Some("s3cret".to_string());
    cfg.queue_block_seconds = 0;
    let server = start_server(&cfg).await?;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let unauthorized = client
        .post(format!("{base}/internal/worker/tasks"))
        .json(&json!({ "workerId": "w" }))
        .send()
        .await?;
    anyhow::ensure!(unauthorized.status() == reqwest::StatusCode::UNAUTHORIZED);

    let authorized = client
        .post(format!("{base}/internal/worker/tasks"))
        .bearer_auth("s3cret")
        .json(&json!({ "workerId": "w" }))
        .send()
        .await?;
    anyhow::ensure!(authorized.status() == reqwest::StatusCode::NO_CONTENT);

    server.shutdown().await?;
    Ok(())
}

/// Heartbeat extends the owning worker's lease and rejects renewal attempts
/// from a worker that doesn't hold it (§7's lease-owner-mismatch 409).
#[tokio::test]
async fn heartbeat_renews_lease_and_rejects_wrong_owner() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let mut cfg = migrated_config().await?;
    cfg.internal_token = None;
    cfg.lease_ms = 300;
    let server = start_server(&cfg).await?;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "Long-running task needing a heartbeat" }))
        .send()
        .await?
        .json()
        .await?;
    let task_id = created["task"]["id"].as_str().unwrap().to_string();

    client
        .post(format!("{base}/internal/worker/tasks"))
        .json(&json!({ "workerId": "worker-a" }))
        .send()
        .await?;

    let wrong_owner = client
        .post(format!("{base}/internal/worker/tasks/{task_id}/heartbeat"))
        .json(&json!({ "workerId": "worker-b" }))
        .send()
        .await?;
    anyhow::ensure!(
        wrong_owner.status() == reqwest::StatusCode::CONFLICT,
        "heartbeat from a non-owning worker must 409"
    );

    let renewed = client
        .post(format!("{base}/internal/worker/tasks/{task_id}/heartbeat"))
        .json(&json!({ "workerId": "worker-a" }))
        .send()
        .await?;
    anyhow::ensure!(renewed.status().is_success(), "owner's heartbeat should succeed");

    // The lease should now outlive the original LEASE_MS window: a claim
    // well past the original TTL, but before the renewed one, must not
    // reclaim the task.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let still_leased = client
        .post(format!("{base}/internal/worker/tasks"))
        .json(&json!({ "workerId": "worker-c" }))
        .send()
        .await?;
    anyhow::ensure!(
        still_leased.status() == reqwest::StatusCode::NO_CONTENT,
        "a renewed lease must not be reclaimed before its new expiry"
    );

    server.shutdown().await?;
    Ok(())
}

/// Universal property: `Ack` followed immediately by a claim from another
/// worker never returns the just-acked task unless it was explicitly
/// requeued.
#[tokio::test]
async fn ack_without_requeue_does_not_resurface_the_task() -> anyhow::Result<()> {
    let _lock = integration_lock().await;
    let mut cfg = migrated_config().await?;
    cfg.internal_token = None;
    cfg.queue_block_seconds = 0;
    let server = start_server(&cfg).await?;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "Acked and gone" }))
        .send()
        .await?
        .json()
        .await?;
    let task_id = created["task"]["id"].as_str().unwrap().to_string();

    let claimed: serde_json::Value = client
        .post(format!("{base}/internal/worker/tasks"))
        .json(&json!({ "workerId": "w1" }))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(claimed["task"]["id"].as_str() == Some(task_id.as_str()));

    client
        .post(format!("{base}/internal/worker/tasks/{task_id}/ack"))
        .json(&json!({ "requeue": false }))
        .send()
        .await?;

    let second = client
        .post(format!("{base}/internal/worker/tasks"))
        .json(&json!({ "workerId": "w2" }))
        .send()
        .await?;
    anyhow::ensure!(
        second.status() == reqwest::StatusCode::NO_CONTENT,
        "acked task must not resurface without an explicit requeue"
    );

    server.shutdown().await?;
    Ok(())
}
