use crate::queries::auth;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Background worker that periodically deletes revoked refresh tokens past
/// their retention window, keeping the token table small.
pub async fn revoked_token_cleanup_worker(
    pool: sqlx::PgPool,
    retention_minutes: i64,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut cleanup_interval = interval(Duration::from_secs(300));
    info!("revoked token cleanup worker started (runs every 5 minutes)");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("revoked token cleanup worker shutting down");
                break;
            }
            _ = cleanup_interval.tick() => {
                let mut conn = match pool.acquire().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to acquire database connection for cleanup: {}", e);
                        continue;
                    }
                };

                match auth::delete_expired_revoked_tokens(&mut conn, retention_minutes).await {
                    Ok(count) => {
                        if count > 0 {
                            info!("cleaned up {} expired revoked tokens (older than {} minutes)", count, retention_minutes);
                        }
                    }
                    Err(e) => {
                        warn!("failed to cleanup expired revoked tokens: {}", e);
                    }
                }
            }
        }
    }

    info!("revoked token cleanup worker stopped");
}
