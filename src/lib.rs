pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod queries;
pub mod services;
pub mod state;
pub mod utils;
pub mod validation;
pub mod workers;

pub use config::Config;
pub use database::{DbConn, DbPool};
pub use error::{Error, Result};
pub use state::AppState;

/// Load configuration from environment variables
pub fn load_config() -> Result<Config> {
    Ok(Config::load()?)
}

/// Initialize tracing subscriber with environment filter
///
/// Reads RUST_LOG for the log level and defaults to "info" when unset.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

/// Runs the message runtime until a shutdown signal arrives: background
/// workers are spawned here and wound down on ctrl-c.
pub async fn run_runtime(state: AppState) -> Result<()> {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    {
        let pool = state.pool.clone();
        let retention = state.config.auth.revoked_token_retention_minutes;
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            workers::revoked_token_cleanup_worker(pool, retention, rx).await;
        });
    }

    {
        let registry = state.registry.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            workers::run_handler_sweep(registry, std::time::Duration::from_secs(3600), rx).await;
        });
    }

    tracing::info!("message runtime started");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("failed to install CTRL+C handler: {}", e)))?;
    tracing::info!("shutdown signal received");
    shutdown_tx.send(()).ok();

    Ok(())
}
