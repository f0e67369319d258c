use crate::config::QueueConfig;
use crate::error::Result;
use crate::queries;
use crate::services::agent_cache::LruAgentCache;
use crate::services::channels::Channel;
use crate::services::conversation_queue::BatchSink;
use crate::services::message_handler::{HandlerMetrics, MessageHandler};
use crate::DbPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Scope a handler is created for; the sink factory uses it to wire the
/// dispatcher adapter.
#[derive(Debug, Clone)]
pub struct HandlerScope {
    pub business_id: Uuid,
    pub business_name: String,
    pub agent_id: Uuid,
    pub agent_name: Option<String>,
    pub channel: Channel,
    pub customer_name: Option<String>,
    pub phone_number_id: Option<String>,
    pub access_token: Option<String>,
    pub thread_id: Option<String>,
    pub project_id: Option<String>,
}

type SinkFactory =
    dyn Fn(&HandlerScope, Arc<HandlerMetrics>) -> Arc<dyn BatchSink> + Send + Sync;

/// Builds the registry key, preferring the most specific scope.
pub fn handler_key(agent_id: Uuid, thread_id: Option<&str>, project_id: Option<&str>) -> String {
    match (thread_id, project_id) {
        (Some(t), Some(p)) => format!("{}::thread::{}::proj::{}", agent_id, t, p),
        (Some(t), None) => format!("{}::thread::{}", agent_id, t),
        (None, Some(p)) => format!("{}::proj::{}", agent_id, p),
        (None, None) => format!("{}::global", agent_id),
    }
}

/// LRU-bounded map of live message handlers keyed by (agent, thread,
/// project). Evicted handlers are stopped off the caller's path.
pub struct HandlerRegistry {
    cache: LruAgentCache<MessageHandler>,
    pool: DbPool,
    queue_config: QueueConfig,
    sink_factory: Box<SinkFactory>,
}

impl HandlerRegistry {
    pub fn new(
        pool: DbPool,
        queue_config: QueueConfig,
        sink_factory: impl Fn(&HandlerScope, Arc<HandlerMetrics>) -> Arc<dyn BatchSink>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let cache = LruAgentCache::new(
            queue_config.max_handlers,
            // handlers are removed by the activity sweep, not by wall-clock age
            Duration::from_secs(u64::MAX / 4),
            |key: String, handler: Arc<MessageHandler>| {
                tracing::info!(key = %key, "evicting handler (LRU), stopping in background");
                tokio::spawn(async move {
                    handler.stop().await;
                });
            },
        );
        Self {
            cache,
            pool,
            queue_config,
            sink_factory: Box::new(sink_factory),
        }
    }

    /// Resolves the agent for a channel adapter and returns the (existing or
    /// new) handler for the scope. Returns `None` when no active agent serves
    /// the channel.
    pub async fn get_or_create(&self, mut scope: HandlerScope) -> Result<Option<Arc<MessageHandler>>> {
        // Non-WebSocket channels carry no agent id; resolve by channel
        if !scope.channel.is_websocket() {
            let mut conn = self.pool.acquire().await?;
            let resolved = queries::agents::find_active_agent_for_channel(
                &mut conn,
                scope.business_id,
                &scope.channel.to_string(),
            )
            .await?;
            let Some((agent_id, agent_name)) = resolved else {
                tracing::info!(
                    business_id = %scope.business_id,
                    channel = %scope.channel,
                    "no active agent for channel"
                );
                return Ok(None);
            };
            scope.agent_id = agent_id;
            scope.agent_name = Some(agent_name);
        }

        let key = handler_key(
            scope.agent_id,
            scope.thread_id.as_deref(),
            scope.project_id.as_deref(),
        );

        if let Some(handler) = self.cache.get(&key) {
            handler.update_scope(scope.thread_id.clone(), scope.project_id.clone());
            return Ok(Some(handler));
        }

        let metrics = Arc::new(HandlerMetrics::default());
        let sink = (self.sink_factory)(&scope, metrics.clone());
        let handler = self.cache.get_or_insert_with(&key, || {
            Arc::new(MessageHandler::new(
                scope.business_id,
                scope.agent_id,
                scope.thread_id.clone(),
                scope.project_id.clone(),
                sink,
                metrics,
                self.queue_config.clone(),
                self.pool.clone(),
            ))
        });

        Ok(Some(handler))
    }

    /// Removes handlers with no live workers, stopping each outside the map
    /// lock. Returns how many were removed.
    pub async fn sweep_inactive(&self) -> usize {
        let mut removed = 0usize;
        for key in self.cache.keys() {
            let Some(handler) = self.cache.get(&key) else {
                continue;
            };
            if handler.is_active() {
                continue;
            }
            if let Some(handler) = self.cache.remove(&key) {
                handler.stop().await;
                removed += 1;
                tracing::info!(key = %key, "removed inactive handler");
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefers_most_specific_scope() {
        let agent = Uuid::parse_str("3f9e35c3-4a77-4e63-9d09-9e4f4a9bcd10").unwrap();
        assert_eq!(
            handler_key(agent, Some("t1"), Some("p1")),
            format!("{}::thread::t1::proj::p1", agent)
        );
        assert_eq!(handler_key(agent, Some("t1"), None), format!("{}::thread::t1", agent));
        assert_eq!(handler_key(agent, None, Some("p1")), format!("{}::proj::p1", agent));
        assert_eq!(handler_key(agent, None, None), format!("{}::global", agent));
    }
}
