use agent_task_broker::{config::BrokerConfig, migrate, server::BrokerServer};
use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agent-task-broker")]
#[command(about = "Task broker control plane: durable queue, leases, and event fan-out", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run database migrations.
    Migrate,

    /// Run the control-plane HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = BrokerConfig::from_env().context("load broker config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Serve => serve(&cfg).await,
    }
}

async fn serve(cfg: &BrokerConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect store")?;

    let bind = cfg.bind_addr.parse().context("parse BIND_ADDR")?;
    let server = BrokerServer::start(pool, cfg, bind).await?;
    tracing::info!(event = "broker.started", addr = %server.addr, "task broker started");

    tokio::signal::ctrl_c().await.context("wait for ctrl_c")?;
    tracing::info!(event = "broker.shutdown", "shutting down");
    server.shutdown().await
}
