mod common;

use async_trait::async_trait;
use common::offline_pool;
use mixrelay::config::DispatchConfig;
use mixrelay::error::{Error, Result};
use mixrelay::models::agent::{AgentReply, KnowledgeOptions, ToolUsage};
use mixrelay::models::conversation::FileRef;
use mixrelay::models::events::BusinessEvent;
use mixrelay::services::agent_instance::AgentInvoker;
use mixrelay::services::channels::{Channel, ChannelSender, OutboundMessage, SendContext};
use mixrelay::services::conversation_queue::ConversationCtx;
use mixrelay::services::dispatcher::{AgentFactory, Dispatcher, INVOKE_TIMEOUT_FALLBACK};
use mixrelay::services::handler_registry::HandlerScope;
use mixrelay::services::message_handler::HandlerMetrics;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

struct MockSender {
    sends: Mutex<Vec<OutboundMessage>>,
    events: Mutex<Vec<BusinessEvent>>,
    /// Sends that fail before the sender starts succeeding.
    failures_remaining: AtomicU32,
}

impl MockSender {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            sends: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(failures),
        })
    }
}

#[async_trait]
impl ChannelSender for MockSender {
    async fn send(&self, _ctx: &SendContext, message: &OutboundMessage) -> Result<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::ChannelSend("simulated hiccup".into()));
        }
        self.sends.lock().await.push(message.clone());
        Ok(())
    }

    async fn publish_business_event(&self, _business_id: Uuid, event: BusinessEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

struct ScriptedAgent {
    reply: AgentReply,
    delay: std::time::Duration,
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(
        &self,
        _thread_id: Option<&str>,
        _project_id: Option<&str>,
        _user_message: &str,
        _attachments: &[String],
        _files_meta: &[FileRef],
        _knowledge_options: Option<KnowledgeOptions>,
        _project_tools: &[String],
    ) -> Result<AgentReply> {
        tokio::time::sleep(self.delay).await;
        Ok(self.reply.clone())
    }

    async fn shutdown(&self) {}
}

fn scope() -> HandlerScope {
    HandlerScope {
        business_id: Uuid::now_v7(),
        business_name: "Цветы Алматы".to_string(),
        agent_id: Uuid::now_v7(),
        agent_name: Some("flower-bot".to_string()),
        channel: Channel::Ws,
        customer_name: None,
        phone_number_id: None,
        access_token: None,
        thread_id: Some("T1".to_string()),
        project_id: None,
    }
}

fn ctx(project_id: Option<&str>) -> ConversationCtx {
    ConversationCtx {
        user_id: "customer-1".to_string(),
        thread_id: Some("T1".to_string()),
        project_id: project_id.map(|p| p.to_string()),
    }
}

fn config(invoke_timeout_secs: u64) -> DispatchConfig {
    DispatchConfig {
        max_agents: 10,
        cleanup_interval_secs: 1800,
        invoke_timeout_secs,
        send_retries: 3,
        block_max_chars: 999,
        calendar_merge_accept: 0.45,
    }
}

fn dispatcher_with(
    sender: Arc<MockSender>,
    metrics: Arc<HandlerMetrics>,
    reply: AgentReply,
    delay: std::time::Duration,
    invoke_timeout_secs: u64,
) -> Dispatcher {
    let factory: AgentFactory = Box::new(move |_customer, _project| {
        Arc::new(ScriptedAgent {
            reply: reply.clone(),
            delay,
        })
    });
    Dispatcher::new(
        scope(),
        offline_pool(),
        config(invoke_timeout_secs),
        sender,
        metrics,
        factory,
    )
}

fn reply(text: &str) -> AgentReply {
    AgentReply {
        final_output: text.to_string(),
        tools: Vec::new(),
    }
}

#[tokio::test]
async fn timeout_sends_fallback_and_reraises() {
    let sender = MockSender::new(0);
    let metrics = Arc::new(HandlerMetrics::default());
    let dispatcher = dispatcher_with(
        sender.clone(),
        metrics.clone(),
        reply("никогда не дойдёт"),
        std::time::Duration::from_secs(30),
        1,
    );

    let result = dispatcher
        .dispatch(&ctx(None), "привет".into(), vec![], vec![])
        .await;

    assert!(matches!(result, Err(Error::InvokeTimeout(1))));
    assert_eq!(metrics.ai_invoke_timeouts(), 1);

    let sends = sender.sends.lock().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].text, INVOKE_TIMEOUT_FALLBACK);
}

#[tokio::test]
async fn response_is_split_into_channel_blocks() {
    let sender = MockSender::new(0);
    let metrics = Arc::new(HandlerMetrics::default());
    let dispatcher = dispatcher_with(
        sender.clone(),
        metrics.clone(),
        reply("Здравствуйте! | Чем могу помочь?"),
        std::time::Duration::ZERO,
        60,
    );

    let out = dispatcher
        .dispatch(&ctx(None), "привет".into(), vec![], vec![])
        .await
        .unwrap();
    assert_eq!(out, "Здравствуйте! | Чем могу помочь?");

    let sends = sender.sends.lock().await;
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0].text, "Здравствуйте!");
    assert_eq!(sends[1].text, "Чем могу помочь?");

    // each accepted block gets its own quotable message id, which is also
    // what the persisted row carries as its idempotency key
    assert!(sends.iter().all(|s| s.message_id.is_some()));
    assert_ne!(sends[0].message_id, sends[1].message_id);

    // a mark_read event is published per accepted block
    let events = sender.events.lock().await;
    assert!(events
        .iter()
        .all(|e| matches!(e, BusinessEvent::MarkRead { customer_id, .. } if customer_id == "customer-1")));
    assert!(!events.is_empty());
}

#[tokio::test]
async fn project_scoped_responses_are_not_split() {
    let sender = MockSender::new(0);
    let metrics = Arc::new(HandlerMetrics::default());
    let dispatcher = dispatcher_with(
        sender.clone(),
        metrics.clone(),
        reply("Раздел 1 | Раздел 2\n\nРаздел 3"),
        std::time::Duration::ZERO,
        60,
    );

    dispatcher
        .dispatch(&ctx(Some("proj-1")), "вопрос".into(), vec![], vec![])
        .await
        .unwrap();

    let sends = sender.sends.lock().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].text, "Раздел 1 | Раздел 2\n\nРаздел 3");
}

#[tokio::test]
async fn transient_send_failures_are_retried() {
    let sender = MockSender::new(2);
    let metrics = Arc::new(HandlerMetrics::default());
    let dispatcher = dispatcher_with(
        sender.clone(),
        metrics.clone(),
        reply("Готово"),
        std::time::Duration::ZERO,
        60,
    );

    dispatcher
        .dispatch(&ctx(None), "привет".into(), vec![], vec![])
        .await
        .unwrap();

    let sends = sender.sends.lock().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].text, "Готово");
}

#[tokio::test]
async fn exhausted_send_retries_surface_the_error() {
    let sender = MockSender::new(10);
    let metrics = Arc::new(HandlerMetrics::default());
    let dispatcher = dispatcher_with(
        sender.clone(),
        metrics.clone(),
        reply("Готово"),
        std::time::Duration::ZERO,
        60,
    );

    let result = dispatcher
        .dispatch(&ctx(None), "привет".into(), vec![], vec![])
        .await;
    assert!(matches!(result, Err(Error::ChannelSend(_))));
    assert!(sender.sends.lock().await.is_empty());
}

#[tokio::test]
async fn tool_cards_ride_along_with_the_message() {
    let sender = MockSender::new(0);
    let metrics = Arc::new(HandlerMetrics::default());
    let mut agent_reply = reply("Запись создана");
    agent_reply.tools.push(ToolUsage {
        id: "t_calendar_calendar_create".into(),
        tool: "calendar_create".into(),
        kind: "calendar".into(),
        icon: None,
        title: "calendar_create".into(),
        text: serde_json::json!({ "task_id": "42", "title": "Встреча", "start": "2025-11-03 14:00" })
            .to_string(),
        created_at: chrono::Utc::now(),
    });
    let dispatcher = dispatcher_with(
        sender.clone(),
        metrics,
        agent_reply,
        std::time::Duration::ZERO,
        60,
    );

    dispatcher
        .dispatch(&ctx(None), "запиши меня".into(), vec![], vec![])
        .await
        .unwrap();

    let sends = sender.sends.lock().await;
    assert_eq!(sends.len(), 1);
    let tools = &sends[0].tools;
    assert_eq!(tools.len(), 1);
    // the raw calendar payload surfaces as a card with a stable id and icon
    assert_eq!(tools[0].id, "cal_42");
    assert_eq!(tools[0].title, "Встреча");
    assert!(tools[0].icon.is_some());
}
