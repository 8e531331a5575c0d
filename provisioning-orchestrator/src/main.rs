use anyhow::Context;
use provisioning_orchestrator::{
    logger, migrations, watch_dog_job, PgReservationDao, ReservationService, Settings,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logger::init();

    let settings = Settings::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect(&settings.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    info!("connected to database");

    migrations::run_inline_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let service = ReservationService::new(Arc::new(PgReservationDao::new(pool)));
    let shutdown = CancellationToken::new();

    let watchdog = tokio::spawn(watch_dog_job::run(
        service,
        settings.watchdog,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested");
    shutdown.cancel();
    watchdog.await.context("watchdog task panicked")?;
    Ok(())
}
