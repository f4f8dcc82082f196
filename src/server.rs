use crate::config::BrokerConfig;
use anyhow::Context;
use broker_http::{build_router, AppState, HttpConfig};
use broker_store::{PgQueue, PgRepository};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

/// Per-task tail reads are recommended to block 5s and return at most 50
/// entries; the index stream recommends 100.
const MAX_TASK_TAIL_COUNT: i64 = 50;
const MAX_INDEX_TAIL_COUNT: i64 = 100;

pub struct BrokerServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl BrokerServer {
    pub async fn start(pool: PgPool, cfg: &BrokerConfig, bind: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind broker to {bind}"))?;
        let addr = listener.local_addr().context("broker local_addr")?;

        let repo = Arc::new(PgRepository::new(pool.clone(), cfg.stream_trim_threshold));
        let queue = Arc::new(PgQueue::new(pool, cfg.lease_ms));

        let state = Arc::new(AppState {
            repo,
            queue: queue.clone(),
            cfg: HttpConfig {
                internal_token: cfg.internal_token.clone(),
                queue_block: Duration::from_secs(cfg.queue_block_seconds),
                max_tail_count: MAX_TASK_TAIL_COUNT,
                max_index_tail_count: MAX_INDEX_TAIL_COUNT,
                session_cookie_name: cfg.session_cookie_name.clone(),
                lease_ms: cfg.lease_ms,
            },
        });

        let app = build_router(state);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_broker(
            listener,
            app,
            queue,
            cfg.lease_reaper_poll_ms,
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join broker task")??;
        Ok(())
    }
}

async fn run_broker(
    listener: TcpListener,
    app: axum::Router,
    queue: Arc<PgQueue>,
    lease_reaper_poll_ms: u64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let reaper = tokio::spawn(lease_reaper_loop(
        queue,
        lease_reaper_poll_ms,
        shutdown_rx.clone(),
    ));

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        while !*server_shutdown.borrow() {
            if server_shutdown.changed().await.is_err() {
                break;
            }
        }
    });

    let server_res = server.await;
    let _ = shutdown_tx.send(true);
    let _ = reaper.await;

    server_res.context("broker serve")?;
    Ok(())
}

/// Runs `RequeueLeases` periodically, independent of `Claim` doing the
/// same on every call — bounds how long a dead worker's task sits idle
/// when nobody is actively polling the queue.
async fn lease_reaper_loop(
    queue: Arc<PgQueue>,
    poll_ms: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let interval = Duration::from_millis(poll_ms);

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        if let Err(err) = queue.requeue_expired_leases().await {
            tracing::warn!(
                event = "broker.lease_reaper.error",
                error = %err,
                "lease reaper error"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}
