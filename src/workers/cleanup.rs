use crate::services::dispatcher::Dispatcher;
use crate::services::handler_registry::HandlerRegistry;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

/// How often a dispatcher's agent cache is swept for idle instances.
const AGENT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns the idle-agent sweep for one dispatcher. The task holds only a weak
/// reference, so it winds down once the dispatcher's handler is dropped.
pub fn spawn_agent_cache_cleanup(dispatcher: Weak<Dispatcher>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(AGENT_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(dispatcher) = dispatcher.upgrade() else {
                break;
            };
            let removed = dispatcher.cleanup_agents();
            if removed > 0 {
                info!(removed, "idle agent instances evicted");
            }
        }
    });
}

/// Background worker that periodically drops registry handlers with no live
/// queue workers.
pub async fn run_handler_sweep(
    registry: Arc<HandlerRegistry>,
    interval: Duration,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    info!(interval_secs = interval.as_secs(), "handler sweep worker started");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("handler sweep worker shutting down");
                break;
            }
            _ = ticker.tick() => {
                let removed = registry.sweep_inactive().await;
                if removed > 0 {
                    info!(removed, handlers = registry.len(), "inactive handlers removed");
                }
            }
        }
    }
}
