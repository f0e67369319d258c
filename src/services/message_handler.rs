use crate::config::QueueConfig;
use crate::error::Result;
use crate::models::conversation::{BatchItem, FileRef};
use crate::queries;
use crate::services::conversation_queue::{
    spawn_queue_worker, BatchSink, ConversationCtx, QueueHandle, QueueItem, QueueWorkerConfig,
};
use crate::DbPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Attempts to resolve a quoted message before giving up.
const REPLY_LOOKUP_ATTEMPTS: u32 = 3;
const REPLY_LOOKUP_BACKOFF_MS: u64 = 500;
/// Bounded wait after a full-queue rejection before the message is dropped.
const QUEUE_FULL_WAIT: Duration = Duration::from_secs(1);
/// How long flush_all waits for workers to drain.
const FLUSH_ALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Counters exposed for monitoring.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    active_queues: AtomicU64,
    max_queue_size_seen: AtomicU64,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
    ai_invoke_timeouts: AtomicU64,
}

impl HandlerMetrics {
    pub fn set_active_queues(&self, n: u64) {
        self.active_queues.store(n, Ordering::Relaxed);
    }
    pub fn active_queues(&self) -> u64 {
        self.active_queues.load(Ordering::Relaxed)
    }
    pub fn observe_queue_depth(&self, depth: u64) {
        self.max_queue_size_seen.fetch_max(depth, Ordering::Relaxed);
    }
    pub fn max_queue_size_seen(&self) -> u64 {
        self.max_queue_size_seen.load(Ordering::Relaxed)
    }
    pub fn inc_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }
    pub fn inc_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }
    pub fn inc_invoke_timeouts(&self) {
        self.ai_invoke_timeouts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn ai_invoke_timeouts(&self) -> u64 {
        self.ai_invoke_timeouts.load(Ordering::Relaxed)
    }
}

/// One inbound message, channel-agnostic.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub user_id: String,
    pub thread_id: Option<String>,
    pub project_id: Option<String>,
    pub text: Option<String>,
    pub audio_transcription: Option<String>,
    pub images: Vec<String>,
    pub shares: Vec<String>,
    pub stories: Vec<String>,
    pub files: Vec<FileRef>,
    pub reply_to_message_id: Option<String>,
}

/// Owns the per-conversation queues for one (agent, thread, project) scope
/// and enforces the queue and concurrency caps.
pub struct MessageHandler {
    pub business_id: Uuid,
    pub agent_id: Uuid,
    scope: Mutex<(Option<String>, Option<String>)>,
    queues: Arc<Mutex<HashMap<String, Arc<QueueHandle>>>>,
    sink: Arc<dyn BatchSink>,
    semaphore: Arc<tokio::sync::Semaphore>,
    metrics: Arc<HandlerMetrics>,
    config: QueueConfig,
    pool: DbPool,
}

impl MessageHandler {
    pub fn new(
        business_id: Uuid,
        agent_id: Uuid,
        thread_id: Option<String>,
        project_id: Option<String>,
        sink: Arc<dyn BatchSink>,
        metrics: Arc<HandlerMetrics>,
        config: QueueConfig,
        pool: DbPool,
    ) -> Self {
        Self {
            business_id,
            agent_id,
            scope: Mutex::new((thread_id, project_id)),
            queues: Arc::new(Mutex::new(HashMap::new())),
            sink,
            semaphore: Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_workers.max(1))),
            metrics,
            config,
            pool,
        }
    }

    pub fn metrics(&self) -> Arc<HandlerMetrics> {
        self.metrics.clone()
    }

    /// Registry reuse may rebind the handler to a different thread/project.
    pub fn update_scope(&self, thread_id: Option<String>, project_id: Option<String>) {
        let mut scope = self.scope.lock().expect("scope lock poisoned");
        if thread_id.is_some() && scope.0 != thread_id {
            scope.0 = thread_id;
        }
        if project_id.is_some() && scope.1 != project_id {
            scope.1 = project_id;
        }
    }

    /// Whether any queue worker is still alive.
    pub fn is_active(&self) -> bool {
        self.queues
            .lock()
            .expect("queues lock poisoned")
            .values()
            .any(|handle| !handle.is_finished())
    }

    fn session_key(msg: &InboundMessage) -> String {
        msg.thread_id
            .clone()
            .unwrap_or_else(|| msg.user_id.clone())
    }

    fn build_item(msg: &InboundMessage, quoted: Option<String>) -> BatchItem {
        let mut text = msg.text.clone();
        if let Some(transcription) = &msg.audio_transcription {
            let base = text.unwrap_or_default();
            text = Some(format!(
                "{}\nТранскрипция аудиосообщения: {}",
                base, transcription
            ));
        }
        if let Some(quoted) = quoted {
            let base = text.unwrap_or_default();
            text = Some(format!(
                "{}\n[Предыдущее сообщение ассистента, на которое ответил пользователь: {}]",
                base, quoted
            ));
        }

        let mut images = msg.images.clone();
        images.extend(msg.shares.iter().cloned());
        images.extend(msg.stories.iter().cloned());

        BatchItem {
            text: text.map(|t| t.trim_start_matches('\n').to_string()),
            images,
            files: msg.files.clone(),
        }
    }

    async fn resolve_quoted_text(&self, user_id: &str, message_id: &str) -> Option<String> {
        for attempt in 1..=REPLY_LOOKUP_ATTEMPTS {
            let conn = self.pool.acquire().await;
            match conn {
                Ok(mut conn) => {
                    match queries::history::get_message_text_by_id(&mut conn, user_id, message_id)
                        .await
                    {
                        Ok(Some(text)) => return Some(text),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(attempt, error = %e, "quoted message lookup failed")
                        }
                    }
                }
                Err(e) => tracing::warn!(attempt, error = %e, "no connection for quoted lookup"),
            }
            if attempt < REPLY_LOOKUP_ATTEMPTS {
                let backoff =
                    Duration::from_millis(REPLY_LOOKUP_BACKOFF_MS * (1 << (attempt - 1)));
                tokio::time::sleep(backoff).await;
            }
        }
        tracing::error!(user_id, message_id, "quoted message not resolved, sending without context");
        None
    }

    /// Selects or creates the conversation queue and enqueues the message.
    pub async fn add(&self, msg: InboundMessage) -> Result<()> {
        if msg.user_id.is_empty() {
            tracing::error!("add called with an empty user_id");
            return Ok(());
        }

        // human-reply window suppresses the bot entirely
        match self.pool.acquire().await {
            Ok(mut conn) => {
                if queries::history::is_manual_response(&mut conn, self.agent_id, &msg.user_id)
                    .await
                    .unwrap_or(false)
                {
                    tracing::debug!(user_id = %msg.user_id, "manual response window active, skipping");
                    return Ok(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "manual-response check skipped"),
        }

        let key = Self::session_key(&msg);

        let handle = {
            let mut queues = self.queues.lock().expect("queues lock poisoned");
            // drop handles whose worker already exited on idle
            queues.retain(|_, h| !h.is_finished());

            if let Some(handle) = queues.get(&key) {
                handle.clone()
            } else {
                if queues.len() >= self.config.max_total_queues {
                    self.metrics.inc_dropped();
                    tracing::error!(
                        key = %key,
                        queues = queues.len(),
                        cap = self.config.max_total_queues,
                        "cannot create new queue, dropping message"
                    );
                    return Ok(());
                }

                let ctx = ConversationCtx {
                    user_id: msg.user_id.clone(),
                    thread_id: msg.thread_id.clone(),
                    project_id: msg.project_id.clone(),
                };
                let queues_ref = self.queues.clone();
                let metrics_ref = self.metrics.clone();
                let exit_key = key.clone();
                let handle = Arc::new(spawn_queue_worker(
                    key.clone(),
                    ctx,
                    self.config.max_queue_size,
                    QueueWorkerConfig {
                        batch_timeout: Duration::from_secs(self.config.batch_timeout_secs),
                        idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
                    },
                    self.sink.clone(),
                    self.semaphore.clone(),
                    self.metrics.clone(),
                    move || {
                        let mut queues = queues_ref.lock().expect("queues lock poisoned");
                        queues.remove(&exit_key);
                        metrics_ref.set_active_queues(queues.len() as u64);
                    },
                ));
                queues.insert(key.clone(), handle.clone());
                self.metrics.set_active_queues(queues.len() as u64);
                handle
            }
        };
        handle.touch();

        let quoted = match &msg.reply_to_message_id {
            Some(message_id) => self.resolve_quoted_text(&msg.user_id, message_id).await,
            None => None,
        };

        let item = Self::build_item(&msg, quoted);
        if item.is_empty() {
            return Ok(());
        }

        match handle.try_push(QueueItem::Message(item.clone())) {
            Ok(()) => {
                self.metrics.observe_queue_depth(handle.depth() as u64);
            }
            Err(_) => {
                tracing::warn!(
                    key = %key,
                    max = self.config.max_queue_size,
                    "queue full, attempting bounded put"
                );
                if handle
                    .push_timeout(QueueItem::Message(item), QUEUE_FULL_WAIT)
                    .await
                {
                    self.metrics.observe_queue_depth(handle.depth() as u64);
                } else {
                    self.metrics.inc_dropped();
                    tracing::error!(
                        key = %key,
                        dropped = self.metrics.messages_dropped(),
                        "dropping message, queue stayed full"
                    );
                }
            }
        }

        Ok(())
    }

    /// Asks every worker to flush its batch, then waits (bounded) for them to
    /// drain and exit.
    pub async fn flush_all(&self) {
        let handles: Vec<Arc<QueueHandle>> = {
            let queues = self.queues.lock().expect("queues lock poisoned");
            queues.values().cloned().collect()
        };
        for handle in &handles {
            handle.send_stop().await;
        }

        let deadline = tokio::time::Instant::now() + FLUSH_ALL_TIMEOUT;
        loop {
            let empty = self.queues.lock().expect("queues lock poisoned").is_empty();
            if empty {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::info!("flush_all timed out waiting for workers");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Graceful shutdown: stop sentinels, a grace period, then cancellation
    /// of surviving workers.
    pub async fn stop(&self) {
        let handles: Vec<Arc<QueueHandle>> = {
            let queues = self.queues.lock().expect("queues lock poisoned");
            queues.values().cloned().collect()
        };
        for handle in &handles {
            handle.send_stop().await;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;

        for handle in &handles {
            if !handle.is_finished() {
                tracing::warn!("cancelling queue worker that survived the grace period");
                handle.abort();
            }
        }
        self.queues.lock().expect("queues lock poisoned").clear();
        self.metrics.set_active_queues(0);
    }
}
