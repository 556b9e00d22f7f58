//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::RecoveryManager;
use sqlx::postgres::PgPoolOptions;
use state_store::{
    IdempotencyStore, InMemoryIdempotencyStore, InMemoryStateStore, PostgresIdempotencyStore,
    PostgresStateStore, StateStore,
};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Runs the orchestrator over the given stores until a shutdown signal arrives.
async fn serve<S, I>(config: Config, store: S, idempotency: I, metrics_handle: PrometheusHandle)
where
    S: StateStore + 'static,
    I: IdempotencyStore + 'static,
{
    let (state, workers) = api::create_default_state(store, idempotency, &config);

    // Resume whatever was in flight when the previous process stopped
    let recovery = Arc::new(RecoveryManager::new(
        state.engine.clone(),
        config.recovery_config(),
    ));
    if let Err(e) = recovery.recover().await {
        tracing::error!(error = %e, "startup recovery failed");
    }
    let (stop_sweeper, sweeper_shutdown) = watch::channel(false);
    let sweeper = recovery.spawn(sweeper_shutdown);

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = stop_sweeper.send(true);
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "recovery sweeper panicked");
    }
    workers.shutdown().await;
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the storage backend and serve
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresStateStore::new(pool.clone());
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL state store");
            serve(config, store, PostgresIdempotencyStore::new(pool), metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga state is kept in memory only");
            serve(
                config,
                InMemoryStateStore::new(),
                InMemoryIdempotencyStore::new(),
                metrics_handle,
            )
            .await;
        }
    }

    tracing::info!("server shut down gracefully");
}
