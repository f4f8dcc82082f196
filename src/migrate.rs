use crate::config::BrokerConfig;
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

pub async fn run(cfg: &BrokerConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect store")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("run migrations")?;

    tracing::info!("migrations complete");
    Ok(())
}
