use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::models::agent::{AgentReply, KnowledgeOptions, ProjectMeta, ToolUsage};
use crate::models::conversation::{FileRef, NewHistoryMessage, UserBatch};
use crate::models::events::BusinessEvent;
use crate::queries;
use crate::services::agent_cache::{agent_key, LruAgentCache};
use crate::services::agent_instance::AgentInvoker;
use crate::services::calendar_fusion::merge_calendar_tools;
use crate::services::channels::{ChannelSender, OutboundMessage, SendContext};
use crate::services::conversation_queue::{BatchSink, ConversationCtx};
use crate::services::handler_registry::HandlerScope;
use crate::services::message_handler::HandlerMetrics;
use crate::services::response::{split_block_response, ResponseBlock};
use crate::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// User-facing reply when the agent invocation times out.
pub const INVOKE_TIMEOUT_FALLBACK: &str =
    "Извините, временные проблемы с ассистентом — попробуйте чуть позже.";

/// Backoff between channel send attempts.
const SEND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Local business timezone used for the batch date prefix.
fn business_timezone() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600).expect("static offset")
}

/// Builds the dispatched content for a coalesced batch: a bracketed date/time
/// prefix, then the batched texts one per line.
pub fn compose_batch_content(now: DateTime<FixedOffset>, messages: &[String]) -> String {
    let prefix = format!(
        "[Дата и время текущего сообщения: {} - {}]",
        now.format("%d-%m-%Y"),
        now.format("%H:%M")
    );
    if messages.is_empty() {
        return prefix;
    }
    format!("{} Сообщение от пользователя: {}", prefix, messages.join("\n"))
}

/// Icon fallbacks for known tool kinds.
fn tool_icon(kind: &str) -> &'static str {
    match kind {
        "gmail" => "/project/images/gmail-icon.svg",
        "notion" => "/project/images/notion-icon.webp",
        _ => "/project/images/mix-icon.webp",
    }
}

/// Builds an agent instance for a (customer, project) scope.
pub type AgentFactory = Box<dyn Fn(&str, Option<&str>) -> Arc<dyn AgentInvoker> + Send + Sync>;

/// Orchestrates one user-to-agent round-trip: agent resolution, invocation
/// with deadline, response normalization, channel routing, and persistence.
pub struct Dispatcher {
    scope: HandlerScope,
    pool: DbPool,
    config: DispatchConfig,
    agents: Arc<LruAgentCache<dyn AgentInvoker>>,
    sender: Arc<dyn ChannelSender>,
    metrics: Arc<HandlerMetrics>,
    agent_factory: AgentFactory,
}

impl Dispatcher {
    pub fn new(
        scope: HandlerScope,
        pool: DbPool,
        config: DispatchConfig,
        sender: Arc<dyn ChannelSender>,
        metrics: Arc<HandlerMetrics>,
        agent_factory: AgentFactory,
    ) -> Self {
        let agents = Arc::new(LruAgentCache::new(
            config.max_agents,
            Duration::from_secs(config.cleanup_interval_secs),
            |key: String, agent: Arc<dyn AgentInvoker>| {
                tokio::spawn(async move {
                    agent.shutdown().await;
                    tracing::debug!(key = %key, "evicted agent instance shut down");
                });
            },
        ));
        Self {
            scope,
            pool,
            config,
            agents,
            sender,
            metrics,
            agent_factory,
        }
    }

    /// Periodic sweep of idle agent instances.
    pub fn cleanup_agents(&self) -> usize {
        self.agents.sweep_idle()
    }

    fn agent_for(&self, customer_id: &str, project_id: Option<&str>) -> Arc<dyn AgentInvoker> {
        let key = agent_key(customer_id, project_id);
        self.agents.get_or_insert_with(&key, || {
            tracing::info!(key = %key, "creating agent instance");
            (self.agent_factory)(customer_id, project_id)
        })
    }

    async fn project_context(
        &self,
        project_id: Option<&str>,
    ) -> (Option<KnowledgeOptions>, Vec<String>) {
        let Some(project_id) = project_id else {
            return (None, Vec::new());
        };

        let meta = match self.pool.acquire().await {
            Ok(mut conn) => {
                match queries::agents::get_project_meta(&mut conn, self.scope.business_id, project_id)
                    .await
                {
                    Ok(meta) => meta,
                    Err(e) => {
                        tracing::error!(project_id, error = %e, "project meta load failed");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::error!(project_id, error = %e, "no connection for project meta");
                None
            }
        };

        let parsed = ProjectMeta::from_value(meta.as_ref());
        let options = KnowledgeOptions::from_project(&parsed);
        (Some(options), parsed.tools)
    }

    fn send_context(&self, ctx: &ConversationCtx) -> SendContext {
        SendContext {
            channel: self.scope.channel,
            business_id: self.scope.business_id,
            agent_id: self.scope.agent_id,
            customer_id: ctx.user_id.clone(),
            thread_id: ctx.thread_id.clone(),
            project_id: ctx.project_id.clone(),
            phone_number_id: self.scope.phone_number_id.clone(),
            access_token: self.scope.access_token.clone(),
        }
    }

    async fn send_fallback(&self, ctx: &ConversationCtx) {
        let message = OutboundMessage {
            message_id: None,
            text: INVOKE_TIMEOUT_FALLBACK.to_string(),
            image_url: None,
            tools: Vec::new(),
        };
        if let Err(e) = self.sender.send(&self.send_context(ctx), &message).await {
            tracing::error!(error = %e, "failed to send timeout fallback");
        }
    }

    /// Decorates tool cards: stable icons, calendar fusion, and the
    /// project-tools placeholder fallback when the agent used nothing.
    fn finalize_tools(&self, reply_tools: Vec<ToolUsage>, project_tools: &[String]) -> Vec<ToolUsage> {
        let mut tools: Vec<ToolUsage> = reply_tools
            .into_iter()
            .map(|mut usage| {
                if usage.icon.is_none() {
                    usage.icon = Some(tool_icon(&usage.kind).to_string());
                }
                usage
            })
            .collect();

        tools = merge_calendar_tools(tools, self.config.calendar_merge_accept);

        if tools.is_empty() && !project_tools.is_empty() {
            tools = project_tools
                .iter()
                .map(|name| ToolUsage {
                    id: format!("proj_{}", name),
                    tool: name.clone(),
                    kind: name.clone(),
                    icon: Some(tool_icon(name).to_string()),
                    title: name.clone(),
                    text: String::new(),
                    created_at: Utc::now(),
                })
                .collect();
        }

        tools
    }

    async fn send_with_retry(&self, ctx: &ConversationCtx, message: &OutboundMessage) -> Result<()> {
        let send_ctx = self.send_context(ctx);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.sender.send(&send_ctx, message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.send_retries => {
                    tracing::warn!(attempt, error = %e, customer_id = %ctx.user_id, "send failed, retrying");
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(attempts = attempt, error = %e, "send failed, giving up");
                    return Err(e);
                }
            }
        }
    }

    /// Persists the assistant reply strictly after the channel accepted it.
    /// The message id becomes the row's idempotency key, which is what
    /// quoted-reply resolution looks messages up by.
    async fn persist_reply(&self, ctx: &ConversationCtx, text: &str, message_id: &str) {
        let assistant_response = serde_json::json!({ "role": "assistant", "content": text });

        match self.pool.acquire().await {
            Ok(mut conn) => {
                if let Err(e) = queries::history::upsert_summary(
                    &mut conn,
                    self.scope.business_id,
                    &self.scope.business_name,
                    self.scope.agent_id,
                    ctx.thread_id.as_deref(),
                    ctx.project_id.as_deref(),
                    &ctx.user_id,
                    &assistant_response,
                )
                .await
                {
                    tracing::error!(error = %e, "summary upsert failed");
                }

                if let Err(e) = queries::history::insert_message(
                    &mut conn,
                    NewHistoryMessage {
                        business_id: self.scope.business_id,
                        business_name: self.scope.business_name.clone(),
                        agent_id: self.scope.agent_id,
                        agent_name: self.scope.agent_name.clone(),
                        service: self.scope.channel.to_string(),
                        thread_id: ctx.thread_id.clone(),
                        project_id: ctx.project_id.clone(),
                        customer_id: ctx.user_id.clone(),
                        idempotency_key: Some(message_id.to_string()),
                        customer_message: None,
                        assistant_response: Some(assistant_response),
                        business_response: None,
                    },
                )
                .await
                {
                    tracing::error!(error = %e, "history insert failed");
                }

                if let Err(e) =
                    queries::history::upsert_last_read(&mut conn, self.scope.business_id, &ctx.user_id)
                        .await
                {
                    tracing::error!(error = %e, "last_read upsert failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "no connection to persist reply"),
        }

        let mark_read = BusinessEvent::MarkRead {
            customer_id: ctx.user_id.clone(),
            thread_id: ctx.thread_id.clone(),
        };
        if let Err(e) = self
            .sender
            .publish_business_event(self.scope.business_id, mark_read)
            .await
        {
            tracing::error!(error = %e, "mark_read publish failed");
        }
    }

    /// Runs one coalesced batch through the agent and delivers the reply.
    pub async fn dispatch(
        &self,
        ctx: &ConversationCtx,
        content: String,
        images: Vec<String>,
        files: Vec<FileRef>,
    ) -> Result<String> {
        let agent = self.agent_for(&ctx.user_id, ctx.project_id.as_deref());
        let (knowledge_options, project_tools) =
            self.project_context(ctx.project_id.as_deref()).await;

        let invoke = agent.invoke(
            ctx.thread_id.as_deref(),
            ctx.project_id.as_deref(),
            &content,
            &images,
            &files,
            knowledge_options,
            &project_tools,
        );
        let reply: AgentReply = match tokio::time::timeout(
            Duration::from_secs(self.config.invoke_timeout_secs),
            invoke,
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::error!(customer_id = %ctx.user_id, error = %e, "agent invocation failed");
                return Err(e);
            }
            Err(_) => {
                tracing::error!(
                    agent_id = %self.scope.agent_id,
                    customer_id = %ctx.user_id,
                    timeout_secs = self.config.invoke_timeout_secs,
                    "agent invocation timed out"
                );
                self.metrics.inc_invoke_timeouts();
                self.send_fallback(ctx).await;
                return Err(Error::InvokeTimeout(self.config.invoke_timeout_secs));
            }
        };

        if reply.final_output.trim().is_empty() {
            return Err(Error::Llm("assistant returned an empty response".into()));
        }

        // Project-scoped responses are delivered unsplit; everything else is
        // normalized into channel blocks.
        let blocks: Vec<ResponseBlock> = if ctx.project_id.is_some() {
            vec![ResponseBlock {
                text: reply.final_output.clone(),
                image_url: None,
            }]
        } else {
            split_block_response(&reply.final_output, self.config.block_max_chars)
        };

        let tools = self.finalize_tools(reply.tools, &project_tools);

        for block in &blocks {
            let message_id = Uuid::new_v4().to_string();
            let message = OutboundMessage {
                message_id: Some(message_id.clone()),
                text: block.text.clone(),
                image_url: block.image_url.clone(),
                tools: tools.clone(),
            };
            self.send_with_retry(ctx, &message).await?;
            self.persist_reply(ctx, &block.text, &message_id).await;
        }

        Ok(reply.final_output)
    }
}

/// Adapter feeding coalesced queue batches into the dispatcher.
pub struct DispatchSink {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchSink {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl BatchSink for DispatchSink {
    async fn flush(&self, ctx: &ConversationCtx, batch: UserBatch) -> Result<()> {
        let now = Utc::now().with_timezone(&business_timezone());
        let content = compose_batch_content(now, &batch.messages);
        self.dispatcher
            .dispatch(ctx, content, batch.images, batch.files)
            .await
            .map(|_| ())
    }
}
