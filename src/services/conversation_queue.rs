use crate::error::Result;
use crate::models::conversation::{BatchItem, UserBatch};
use crate::services::message_handler::HandlerMetrics;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// What flows through a per-conversation queue.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Message(BatchItem),
    /// Flush whatever is accumulated, then exit the worker.
    Stop,
}

/// Conversation addressing handed to the sink with every flushed batch.
#[derive(Debug, Clone)]
pub struct ConversationCtx {
    pub user_id: String,
    pub thread_id: Option<String>,
    pub project_id: Option<String>,
}

/// Downstream consumer of coalesced batches (the dispatcher in production,
/// an in-process fake in tests).
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn flush(&self, ctx: &ConversationCtx, batch: UserBatch) -> Result<()>;
}

/// Tuning for a queue worker.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    pub batch_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Handle to one conversation's queue and its single worker.
pub struct QueueHandle {
    tx: mpsc::Sender<QueueItem>,
    ctx: ConversationCtx,
    last_activity: Arc<Mutex<Instant>>,
    worker: JoinHandle<()>,
}

impl QueueHandle {
    pub fn ctx(&self) -> &ConversationCtx {
        &self.ctx
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    /// Non-blocking enqueue.
    pub fn try_push(&self, item: QueueItem) -> std::result::Result<(), mpsc::error::TrySendError<QueueItem>> {
        self.tx.try_send(item)
    }

    /// Bounded blocking enqueue used after a full-queue rejection.
    pub async fn push_timeout(&self, item: QueueItem, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.tx.send(item)).await.map(|r| r.is_ok()).unwrap_or(false)
    }

    /// Signals the worker to flush and exit. Falls back to a bounded wait
    /// when the queue is full.
    pub async fn send_stop(&self) {
        if self.try_push(QueueItem::Stop).is_err() {
            let _ = self.push_timeout(QueueItem::Stop, Duration::from_secs(1)).await;
        }
    }

    /// Items currently buffered in the queue.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn abort(&self) {
        self.worker.abort();
    }
}

/// Worker states: waiting for the first item, greedily draining the queue,
/// or handing the batch to the sink.
enum WorkerState {
    Collecting,
    Draining,
    Flushing,
}

/// Spawns the single worker for one conversation queue.
///
/// Protocol: wait up to `batch_timeout` for an item; greedily drain without
/// waiting; flush the non-empty batch under the shared concurrency cap;
/// exit on a stop sentinel (after flushing) or once idle past
/// `idle_timeout`. `on_exit` runs exactly once as the worker leaves, so the
/// owner can drop its map entry.
pub fn spawn_queue_worker(
    key: String,
    ctx: ConversationCtx,
    queue_capacity: usize,
    config: QueueWorkerConfig,
    sink: Arc<dyn BatchSink>,
    concurrency: Arc<Semaphore>,
    metrics: Arc<HandlerMetrics>,
    on_exit: impl FnOnce() + Send + 'static,
) -> QueueHandle {
    let (tx, mut rx) = mpsc::channel::<QueueItem>(queue_capacity.max(1));
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let activity = last_activity.clone();
    let worker_ctx = ctx.clone();

    let worker = tokio::spawn(async move {
        let mut batch = UserBatch::default();
        let mut state = WorkerState::Collecting;
        let mut stop_requested = false;

        loop {
            match state {
                WorkerState::Collecting => {
                    match tokio::time::timeout(config.batch_timeout, rx.recv()).await {
                        Ok(Some(QueueItem::Stop)) | Ok(None) => {
                            stop_requested = true;
                            state = WorkerState::Flushing;
                        }
                        Ok(Some(QueueItem::Message(item))) => {
                            batch.absorb(item);
                            state = WorkerState::Draining;
                        }
                        Err(_) => {
                            // timeout with data flushes; timeout while idle
                            // past the threshold exits
                            if !batch.is_empty() {
                                state = WorkerState::Flushing;
                            } else {
                                let idle = activity
                                    .lock()
                                    .expect("activity lock poisoned")
                                    .elapsed();
                                if idle > config.idle_timeout {
                                    tracing::info!(key = %key, "queue worker idle timeout, stopping");
                                    break;
                                }
                            }
                        }
                    }
                }
                WorkerState::Draining => {
                    loop {
                        match rx.try_recv() {
                            Ok(QueueItem::Message(item)) => batch.absorb(item),
                            Ok(QueueItem::Stop) => {
                                stop_requested = true;
                                break;
                            }
                            Err(_) => break,
                        }
                    }
                    state = WorkerState::Flushing;
                }
                WorkerState::Flushing => {
                    if !batch.is_empty() {
                        let flushed = std::mem::take(&mut batch);
                        let permit = concurrency.acquire().await;
                        match permit {
                            Ok(_permit) => {
                                if let Err(e) = sink.flush(&worker_ctx, flushed).await {
                                    tracing::error!(key = %key, error = %e, "batch flush failed");
                                } else {
                                    metrics.inc_processed();
                                }
                            }
                            Err(_) => {
                                tracing::warn!(key = %key, "concurrency semaphore closed, dropping batch");
                            }
                        }
                        *activity.lock().expect("activity lock poisoned") = Instant::now();
                    }
                    if stop_requested {
                        break;
                    }
                    state = WorkerState::Collecting;
                }
            }
        }

        tracing::debug!(key = %key, "queue worker stopped");
        on_exit();
    });

    QueueHandle {
        tx,
        ctx,
        last_activity,
        worker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingSink {
        batches: AsyncMutex<Vec<UserBatch>>,
        flushes: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: AsyncMutex::new(Vec::new()),
                flushes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn flush(&self, _ctx: &ConversationCtx, batch: UserBatch) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().await.push(batch);
            Ok(())
        }
    }

    fn ctx() -> ConversationCtx {
        ConversationCtx {
            user_id: "u-1".into(),
            thread_id: Some("t-1".into()),
            project_id: None,
        }
    }

    fn config() -> QueueWorkerConfig {
        QueueWorkerConfig {
            batch_timeout: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(60),
        }
    }

    fn text_item(text: &str) -> QueueItem {
        QueueItem::Message(BatchItem {
            text: Some(text.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn rapid_messages_coalesce_into_one_flush() {
        let sink = RecordingSink::new();
        let metrics = Arc::new(HandlerMetrics::default());
        let handle = spawn_queue_worker(
            "k".into(),
            ctx(),
            500,
            config(),
            sink.clone(),
            Arc::new(Semaphore::new(4)),
            metrics.clone(),
            || {},
        );

        handle.try_push(text_item("hi")).unwrap();
        handle.try_push(text_item("there")).unwrap();
        handle.try_push(text_item("?")).unwrap();
        handle.send_stop().await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
        let batches = sink.batches.lock().await;
        assert_eq!(batches[0].messages, vec!["hi", "there", "?"]);
        assert_eq!(metrics.messages_processed(), 1);
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let sink = RecordingSink::new();
        let handle = spawn_queue_worker(
            "k".into(),
            ctx(),
            500,
            config(),
            sink.clone(),
            Arc::new(Semaphore::new(1)),
            Arc::new(HandlerMetrics::default()),
            || {},
        );

        for i in 0..20 {
            handle.try_push(text_item(&format!("m{}", i))).unwrap();
        }
        handle.send_stop().await;
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let batches = sink.batches.lock().await;
        let all: Vec<String> = batches.iter().flat_map(|b| b.messages.clone()).collect();
        let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn stop_flushes_pending_batch() {
        let sink = RecordingSink::new();
        let handle = spawn_queue_worker(
            "k".into(),
            ctx(),
            500,
            config(),
            sink.clone(),
            Arc::new(Semaphore::new(4)),
            Arc::new(HandlerMetrics::default()),
            || {},
        );

        handle.try_push(text_item("остаток")).unwrap();
        handle.try_push(QueueItem::Stop).unwrap();
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let batches = sink.batches.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].messages, vec!["остаток"]);
    }

    #[tokio::test]
    async fn idle_worker_exits_and_reports() {
        let sink = RecordingSink::new();
        let exited = Arc::new(AtomicUsize::new(0));
        let flag = exited.clone();
        let handle = spawn_queue_worker(
            "k".into(),
            ctx(),
            500,
            QueueWorkerConfig {
                batch_timeout: Duration::from_millis(20),
                idle_timeout: Duration::from_millis(30),
            },
            sink,
            Arc::new(Semaphore::new(4)),
            Arc::new(HandlerMetrics::default()),
            move || {
                flag.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(exited.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_queue_rejects_when_full() {
        let sink = RecordingSink::new();
        let handle = spawn_queue_worker(
            "k".into(),
            ctx(),
            3,
            QueueWorkerConfig {
                // long timeout so the worker never drains during the test
                batch_timeout: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(60),
            },
            sink,
            Arc::new(Semaphore::new(1)),
            Arc::new(HandlerMetrics::default()),
            || {},
        );

        // the worker consumes the first item into its batch; fill the buffer
        // behind it until try_send rejects
        let mut rejected = 0;
        for i in 0..10 {
            if handle.try_push(text_item(&format!("m{}", i))).is_err() {
                rejected += 1;
            }
        }
        assert!(rejected > 0);
        handle.abort();
    }
}
