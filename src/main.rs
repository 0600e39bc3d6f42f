use idempotency_engine::api::{create_router, AppState};
use idempotency_engine::config::{Settings, StoreKind};
use idempotency_engine::idempotency::{
    CleanupJob, Clock, IdempotencyState, IdempotencyStore, InMemoryStore, PostgresStore,
    RetryConfig, SystemClock,
};
use idempotency_engine::observability::{init_logging, init_metrics, LogConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    init_logging(&LogConfig::new(
        settings.application.log_level.clone(),
        &settings.application.log_format,
    ))?;
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    // Select the backing store once; everything downstream sees the trait.
    let mut pool: Option<PgPool> = None;
    let store: Arc<dyn IdempotencyStore> = match settings.idempotency.store {
        StoreKind::Memory => {
            info!("Using in-process idempotency store");
            Arc::new(InMemoryStore::new())
        }
        StoreKind::Postgres => {
            info!("Connecting to database at {}...", settings.database.url);
            let pg = PgPoolOptions::new()
                .max_connections(settings.database.pool_size)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&settings.database.url)
                .await?;

            let retry = RetryConfig::default()
                .with_max_attempts(settings.idempotency.max_transaction_attempts);
            let postgres = PostgresStore::with_retry(pg.clone(), retry);

            info!("Running database migrations...");
            postgres.migrate().await?;
            info!("Migrations applied successfully");

            pool = Some(pg);
            Arc::new(postgres)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = settings.idempotency.to_config(clock.clone())?;
    info!(?config, "Idempotency middleware configured");

    let cleanup = CleanupJob::new(store.clone(), clock)
        .with_interval(settings.idempotency.cleanup_interval())
        .with_batch_size(settings.idempotency.cleanup_batch_size)
        .start();

    let state = AppState::new(IdempotencyState::new(store, config)).with_metrics(metrics_handle);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.application.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The sweep must be fully stopped before the pool goes away.
    info!("Stopping idempotency cleanup job...");
    cleanup.shutdown().await;
    if let Some(pool) = pool {
        pool.close().await;
        info!("Database pool closed");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
