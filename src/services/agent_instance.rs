use crate::error::{Error, Result};
use crate::models::agent::{AgentReply, KnowledgeMode, KnowledgeOptions, ToolUsage};
use crate::models::conversation::FileRef;
use crate::queries;
use crate::services::memory::Memory;
use crate::services::retrieval::RetrievalService;
use crate::utils::{safe_preview, tool_slug, truncate_safe};
use crate::DbPool;
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Recorded tool calls kept per invocation.
const TOOLS_USED_CAP: usize = 20;
/// Tool results are truncated to this many characters before recording.
const TOOL_RESULT_CAP: usize = 2000;
/// History image download limits.
const IMAGE_FETCH_TIMEOUT_SECS: u64 = 15;
const IMAGE_MAX_BYTES: usize = 5 * 1024 * 1024;
/// The assembled input sequence is capped at this many entries.
const HISTORY_CAP: usize = 250;
/// Deadline for (re)binding tools before an invocation proceeds without it.
const SETUP_TIMEOUT_SECS: u64 = 25;

/// Context a tool may declare a need for. The wrapper injects exactly the
/// declared capabilities, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    BusinessId,
    ProjectId,
    CustomerId,
    Retrieval,
    KnowledgeOptions,
}

/// Static description of a tool: its public name, card type, and the
/// capabilities it consumes.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub kind: String,
    pub icon: Option<String>,
    pub description: String,
    pub parameters: serde_json::Value,
    pub capabilities: HashSet<Capability>,
}

/// Call-site context resolved per invocation; the wrapper copies declared
/// capabilities into [`ToolArgs`].
#[derive(Clone)]
pub struct ToolContext {
    pub business_id: Uuid,
    pub project_id: Option<String>,
    pub customer_id: String,
    pub retrieval: Option<Arc<RetrievalService>>,
    pub knowledge: Option<KnowledgeOptions>,
}

/// What a tool actually receives: the model-provided arguments plus the
/// capabilities its spec declared.
pub struct ToolArgs {
    pub arguments: serde_json::Value,
    pub business_id: Option<Uuid>,
    pub project_id: Option<String>,
    pub customer_id: Option<String>,
    pub retrieval: Option<Arc<RetrievalService>>,
    pub knowledge: Option<KnowledgeOptions>,
}

/// A named capability callable by the agent. Implementations beyond the
/// built-in knowledge retriever come from external collaborators.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn spec(&self) -> &ToolSpec;
    async fn call(&self, args: ToolArgs) -> Result<serde_json::Value>;
}

/// A tool bound to one agent instance: injects context per the declared
/// capabilities, records usage, and converts failures into structured
/// results instead of aborting the run.
pub struct ToolBinding {
    tool: Arc<dyn AgentTool>,
    context: ToolContext,
    usage_log: Arc<Mutex<Vec<ToolUsage>>>,
}

impl ToolBinding {
    pub fn spec(&self) -> &ToolSpec {
        self.tool.spec()
    }

    pub async fn invoke(&self, arguments: serde_json::Value) -> serde_json::Value {
        let spec = self.tool.spec();
        let caps = &spec.capabilities;
        let args = ToolArgs {
            arguments,
            business_id: caps
                .contains(&Capability::BusinessId)
                .then_some(self.context.business_id),
            project_id: caps
                .contains(&Capability::ProjectId)
                .then(|| self.context.project_id.clone())
                .flatten(),
            customer_id: caps
                .contains(&Capability::CustomerId)
                .then(|| self.context.customer_id.clone()),
            retrieval: caps
                .contains(&Capability::Retrieval)
                .then(|| self.context.retrieval.clone())
                .flatten(),
            knowledge: caps
                .contains(&Capability::KnowledgeOptions)
                .then(|| self.context.knowledge.clone())
                .flatten(),
        };

        match self.tool.call(args).await {
            Ok(result) => {
                let text = result.to_string();
                self.record(truncate_safe(&text, TOOL_RESULT_CAP).to_string()).await;
                result
            }
            Err(e) => {
                tracing::error!(tool = %spec.name, error = %e, "tool raised");
                self.record(format!("error: {}", e)).await;
                serde_json::json!({
                    "ok": false,
                    "error": "tool_exception",
                    "tool": spec.name,
                    "detail": e.to_string(),
                })
            }
        }
    }

    async fn record(&self, text: String) {
        let spec = self.tool.spec();
        let mut log = self.usage_log.lock().await;
        log.push(ToolUsage {
            id: tool_slug(&spec.kind, &spec.name),
            tool: spec.name.clone(),
            kind: spec.kind.clone(),
            icon: spec.icon.clone(),
            title: spec.name.clone(),
            text,
            created_at: Utc::now(),
        });
        if log.len() > TOOLS_USED_CAP {
            let excess = log.len() - TOOLS_USED_CAP;
            log.drain(..excess);
        }
    }
}

/// One entry of the assembled runner input.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerMessage {
    pub role: String,
    pub content: RunnerContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerContent {
    Text(String),
    /// Inlined images as data URIs.
    Images(Vec<String>),
}

impl RunnerMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: RunnerContent::Text(text.into()),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: RunnerContent::Text(text.into()),
        }
    }
}

/// LLM agent-runner collaborator: consumes the assembled input and the bound
/// tools, drives the model (including tool round-trips), and returns the
/// final text.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        instructions: &str,
        input: Vec<RunnerMessage>,
        tools: &[Arc<ToolBinding>],
    ) -> Result<String>;
}

/// The dispatcher-facing surface of an agent instance. The cache holds these
/// as owned handles; eviction calls `shutdown` off the hot path.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn invoke(
        &self,
        thread_id: Option<&str>,
        project_id: Option<&str>,
        user_message: &str,
        attachments: &[String],
        files_meta: &[FileRef],
        knowledge_options: Option<KnowledgeOptions>,
        project_tools: &[String],
    ) -> Result<AgentReply>;

    async fn shutdown(&self);
}

struct InstanceState {
    initialized: bool,
    current_project_tools: Vec<String>,
    bindings: Vec<Arc<ToolBinding>>,
    instructions: String,
}

/// A per-customer LLM runtime holding tool bindings, memory access, and
/// history assembly.
pub struct AgentInstance {
    business_id: Uuid,
    agent_id: Uuid,
    customer_id: String,
    pool: DbPool,
    runner: Arc<dyn AgentRunner>,
    memory: Arc<dyn Memory>,
    retrieval: Arc<RetrievalService>,
    /// Collaborator-supplied tools available for binding, by public name.
    catalog: Vec<Arc<dyn AgentTool>>,
    http: reqwest::Client,
    setup_lock: Mutex<()>,
    state: Mutex<InstanceState>,
    usage_log: Arc<Mutex<Vec<ToolUsage>>>,
}

fn norm_tool_key(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

impl AgentInstance {
    pub fn new(
        business_id: Uuid,
        agent_id: Uuid,
        customer_id: String,
        pool: DbPool,
        runner: Arc<dyn AgentRunner>,
        memory: Arc<dyn Memory>,
        retrieval: Arc<RetrievalService>,
        catalog: Vec<Arc<dyn AgentTool>>,
    ) -> Self {
        Self {
            business_id,
            agent_id,
            customer_id,
            pool,
            runner,
            memory,
            retrieval,
            catalog,
            http: reqwest::Client::new(),
            setup_lock: Mutex::new(()),
            state: Mutex::new(InstanceState {
                initialized: false,
                current_project_tools: Vec::new(),
                bindings: Vec::new(),
                instructions: String::new(),
            }),
            usage_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Best-effort teardown on cache eviction.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.initialized = false;
        state.bindings.clear();
        tracing::debug!(agent_id = %self.agent_id, customer_id = %self.customer_id, "agent instance shut down");
    }

    /// Resolves the active tool set: project tool names matched against the
    /// agent's configured tools (normalized, with partial matches), project
    /// extras allowed through as-is.
    fn resolve_active_tools(agent_tools: &[String], project_tools: &[String]) -> Vec<String> {
        if project_tools.is_empty() {
            return agent_tools.to_vec();
        }

        let agent_norm: Vec<(String, &String)> = agent_tools
            .iter()
            .map(|t| (norm_tool_key(t), t))
            .collect();

        let mut resolved: Vec<String> = Vec::new();
        for p in project_tools {
            let pn = norm_tool_key(p);
            let matched = agent_norm
                .iter()
                .find(|(an, _)| *an == pn)
                .or_else(|| agent_norm.iter().find(|(an, _)| an.contains(&pn) || pn.contains(an)));
            let name = matched.map(|(_, orig)| (*orig).clone()).unwrap_or_else(|| p.clone());
            if !resolved.contains(&name) {
                resolved.push(name);
            }
        }
        resolved
    }

    /// Loads the config row and (re)binds tools when the project tool set
    /// changed since the last invocation. Guarded by a per-instance lock so
    /// concurrent invocations cannot double-bind.
    async fn ensure_ready(
        &self,
        project_id: Option<&str>,
        project_tools: &[String],
        knowledge: Option<&KnowledgeOptions>,
    ) -> Result<()> {
        let _guard = self.setup_lock.lock().await;

        let incoming: HashSet<String> = project_tools.iter().map(|t| norm_tool_key(t)).collect();
        {
            let state = self.state.lock().await;
            let current: HashSet<String> = state
                .current_project_tools
                .iter()
                .map(|t| norm_tool_key(t))
                .collect();
            if state.initialized && incoming == current {
                return Ok(());
            }
            if state.initialized {
                tracing::info!(agent_id = %self.agent_id, "project tools changed, rebinding agent tools");
            }
        }

        let mut conn = self.pool.acquire().await.map_err(Error::Sqlx)?;
        let config = queries::agents::get_agent_config(&mut conn, self.business_id, self.agent_id).await?;
        drop(conn);

        let active = Self::resolve_active_tools(&config.tool_names(), project_tools);
        let allowed: HashSet<String> = active.iter().map(|t| norm_tool_key(t)).collect();

        let context = ToolContext {
            business_id: self.business_id,
            project_id: project_id.map(|p| p.to_string()),
            customer_id: self.customer_id.clone(),
            retrieval: Some(self.retrieval.clone()),
            knowledge: knowledge.cloned(),
        };

        // The knowledge retriever is always bound; collaborator tools only
        // when the active set names them.
        let mut bindings: Vec<Arc<ToolBinding>> = Vec::new();
        for tool in &self.catalog {
            let name_key = norm_tool_key(&tool.spec().name);
            let kind_key = norm_tool_key(&tool.spec().kind);
            let always = tool.spec().name == KnowledgeRetrieverTool::NAME;
            if always || allowed.contains(&name_key) || allowed.contains(&kind_key) {
                bindings.push(Arc::new(ToolBinding {
                    tool: tool.clone(),
                    context: context.clone(),
                    usage_log: self.usage_log.clone(),
                }));
            }
        }

        let mut instructions = config.agent_instructions.clone().unwrap_or_default();
        if let Some(role) = &config.agent_role {
            if !role.is_empty() {
                instructions = format!("{}\n\n{}", role, instructions);
            }
        }

        let mut state = self.state.lock().await;
        state.initialized = true;
        state.current_project_tools = project_tools.to_vec();
        state.bindings = bindings;
        state.instructions = instructions;
        tracing::info!(
            agent_id = %self.agent_id,
            customer_id = %self.customer_id,
            tools = state.bindings.len(),
            "agent instance ready"
        );
        Ok(())
    }

    async fn fetch_image_data_uri(&self, url: &str) -> Result<String> {
        if url.starts_with("data:") {
            return Ok(url.to_string());
        }

        let response = self
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(IMAGE_FETCH_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("image fetch failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("image fetch failed: {}", e)))?;

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Internal(format!("image body read failed: {}", e)))?;
        if bytes.len() > IMAGE_MAX_BYTES {
            return Err(Error::Validation(format!(
                "image too large: {} bytes",
                bytes.len()
            )));
        }

        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(format!("data:{};base64,{}", mime, b64))
    }

    /// Assembles the runner input: normalized history turns with inlined
    /// image attachments, current attachments, file previews, and the current
    /// user message, capped at the trailing `HISTORY_CAP` entries.
    async fn assemble_input(
        &self,
        thread_id: Option<&str>,
        project_id: Option<&str>,
        user_message: &str,
        attachments: &[String],
        files_meta: &[FileRef],
    ) -> Result<Vec<RunnerMessage>> {
        let mut input: Vec<RunnerMessage> = Vec::new();

        let history = self
            .memory
            .history(
                self.business_id,
                self.agent_id,
                thread_id,
                project_id,
                &self.customer_id,
            )
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "history fetch failed, continuing with empty history");
                Vec::new()
            });

        for record in history {
            if let Some(raw) = &record.customer_message {
                let norm = normalize_to_role_content(raw);
                if let Some(text) = norm.text {
                    input.push(RunnerMessage::user_text(text));
                }
                for url in norm.image_urls {
                    match self.fetch_image_data_uri(&url).await {
                        Ok(data_uri) => input.push(RunnerMessage {
                            role: "user".into(),
                            content: RunnerContent::Images(vec![data_uri]),
                        }),
                        Err(e) => tracing::error!(url = %safe_preview(&url, 120), error = %e, "history image fetch failed"),
                    }
                }
            }

            let reply = record
                .assistant_response
                .as_ref()
                .or(record.business_response.as_ref());
            if let Some(raw) = reply {
                let norm = normalize_to_role_content(raw);
                if let Some(text) = norm.text {
                    input.push(RunnerMessage::assistant_text(text));
                }
            }
        }

        if !attachments.is_empty() {
            let mut images = Vec::new();
            for url in attachments {
                match self.fetch_image_data_uri(url).await {
                    Ok(data_uri) => images.push(data_uri),
                    Err(e) => tracing::error!(url = %safe_preview(url, 120), error = %e, "attachment fetch failed"),
                }
            }
            if !images.is_empty() {
                input.push(RunnerMessage {
                    role: "user".into(),
                    content: RunnerContent::Images(images),
                });
            }
        }

        for file in files_meta {
            let filename = file.url.rsplit('/').next().unwrap_or(&file.url);
            let preview = match &file.mime {
                Some(mime) => format!(
                    "Файл {} ({}). Полный текст доступен через инструмент Parse-Document('{}').",
                    filename, mime, file.url
                ),
                None => format!(
                    "Файл {}. Полный текст доступен через инструмент Parse-Document('{}').",
                    filename, file.url
                ),
            };
            input.push(RunnerMessage::user_text(preview));
        }

        if !user_message.trim().is_empty() {
            input.push(RunnerMessage::user_text(user_message.to_string()));
        }

        if input.len() > HISTORY_CAP {
            input.drain(..input.len() - HISTORY_CAP);
        }

        Ok(input)
    }

    /// Runs one batch through the agent and returns the final output plus the
    /// recorded tool usage.
    #[allow(clippy::too_many_arguments)]
    pub async fn invoke(
        &self,
        thread_id: Option<&str>,
        project_id: Option<&str>,
        user_message: &str,
        attachments: &[String],
        files_meta: &[FileRef],
        knowledge_options: Option<KnowledgeOptions>,
        project_tools: &[String],
    ) -> Result<AgentReply> {
        match tokio::time::timeout(
            std::time::Duration::from_secs(SETUP_TIMEOUT_SECS),
            self.ensure_ready(project_id, project_tools, knowledge_options.as_ref()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::error!(agent_id = %self.agent_id, "agent setup timed out");
                return Err(Error::Llm("agent setup timed out".into()));
            }
        }

        self.usage_log.lock().await.clear();

        let input = self
            .assemble_input(thread_id, project_id, user_message, attachments, files_meta)
            .await?;

        let (instructions, bindings) = {
            let state = self.state.lock().await;
            if !state.initialized {
                return Err(Error::Llm("agent instance is not initialized".into()));
            }
            (state.instructions.clone(), state.bindings.clone())
        };

        let final_output = self
            .runner
            .run(&instructions, input, &bindings)
            .await
            .map_err(|e| Error::Llm(format!("agent run failed: {}", e)))?;

        // Stable ids, deduplicated while preserving the latest entry per id.
        let mut tools: Vec<ToolUsage> = Vec::new();
        for usage in self.usage_log.lock().await.iter() {
            if let Some(existing) = tools.iter_mut().find(|t| t.id == usage.id) {
                *existing = usage.clone();
            } else {
                tools.push(usage.clone());
            }
        }

        Ok(AgentReply {
            final_output,
            tools,
        })
    }
}

#[async_trait]
impl AgentInvoker for AgentInstance {
    async fn invoke(
        &self,
        thread_id: Option<&str>,
        project_id: Option<&str>,
        user_message: &str,
        attachments: &[String],
        files_meta: &[FileRef],
        knowledge_options: Option<KnowledgeOptions>,
        project_tools: &[String],
    ) -> Result<AgentReply> {
        AgentInstance::invoke(
            self,
            thread_id,
            project_id,
            user_message,
            attachments,
            files_meta,
            knowledge_options,
            project_tools,
        )
        .await
    }

    async fn shutdown(&self) {
        AgentInstance::shutdown(self).await
    }
}

struct NormalizedTurn {
    text: Option<String>,
    image_urls: Vec<String>,
}

/// Normalizes any stored message shape to text + attachment URLs: a bare
/// string, `{role, content}`, or `{content, attachments: [{type, payload}]}`.
fn normalize_to_role_content(raw: &serde_json::Value) -> NormalizedTurn {
    let mut image_urls = Vec::new();

    let text = match raw {
        serde_json::Value::String(s) => {
            // stored rows sometimes hold a JSON string of the message object
            match serde_json::from_str::<serde_json::Value>(s) {
                Ok(inner) if inner.is_object() => {
                    let nested = normalize_to_role_content(&inner);
                    image_urls = nested.image_urls;
                    nested.text
                }
                _ => Some(s.clone()),
            }
        }
        serde_json::Value::Object(map) => {
            if let Some(atts) = map.get("attachments").and_then(|v| v.as_array()) {
                for att in atts {
                    let is_image = att.get("type").and_then(|t| t.as_str()) == Some("image");
                    let url = att
                        .get("payload")
                        .and_then(|p| p.get("url"))
                        .and_then(|u| u.as_str());
                    if let (true, Some(url)) = (is_image, url) {
                        image_urls.push(url.to_string());
                    }
                }
            }
            map.get("content")
                .or_else(|| map.get("text"))
                .or_else(|| map.get("text_response"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty())
        }
        _ => None,
    };

    NormalizedTurn { text, image_urls }
}

/// Built-in retrieval tool: searches the owner's indexed knowledge and
/// returns source snippets.
pub struct KnowledgeRetrieverTool {
    spec: ToolSpec,
}

impl KnowledgeRetrieverTool {
    pub const NAME: &'static str = "knowledge_retriever";

    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: Self::NAME.to_string(),
                kind: "knowledge".to_string(),
                icon: None,
                description:
                    "Ищет релевантные фрагменты знаний в базе. Возвращает JSON со списком источников."
                        .to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "k": { "type": "integer", "minimum": 1, "maximum": 20 }
                    },
                    "required": ["query"]
                }),
                capabilities: HashSet::from([
                    Capability::BusinessId,
                    Capability::Retrieval,
                    Capability::KnowledgeOptions,
                ]),
            },
        }
    }
}

impl Default for KnowledgeRetrieverTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTool for KnowledgeRetrieverTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, args: ToolArgs) -> Result<serde_json::Value> {
        let business_id = args
            .business_id
            .ok_or_else(|| Error::Internal("knowledge retriever needs business context".into()))?;
        let retrieval = args
            .retrieval
            .ok_or_else(|| Error::Internal("knowledge retriever needs a retrieval handle".into()))?;

        let query = args
            .arguments
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("query is required".into()))?;
        let default_k = args.knowledge.as_ref().map(|k| k.top_k).unwrap_or(5);
        let k = args
            .arguments
            .get("k")
            .and_then(|v| v.as_u64())
            .map(|k| k as usize)
            .unwrap_or(default_k);

        let allowed: Option<Vec<String>> = match &args.knowledge {
            Some(opts) if opts.mode != KnowledgeMode::All && !opts.selected_ids.is_empty() => {
                Some(opts.selected_ids.clone())
            }
            _ => None,
        };

        let hits = retrieval
            .search_and_fetch(business_id, query, allowed.as_deref(), None, k, None)
            .await?;

        let sources: Vec<serde_json::Value> = hits
            .into_iter()
            .map(|hit| {
                let title = hit
                    .db
                    .as_ref()
                    .map(|db| db.title.clone())
                    .filter(|t| !t.is_empty())
                    .or_else(|| {
                        hit.payload
                            .get("title")
                            .and_then(|t| t.as_str())
                            .map(|t| t.to_string())
                    })
                    .unwrap_or_default();
                serde_json::json!({
                    "source_id": hit.payload.get("source_id").cloned().unwrap_or(serde_json::Value::Null),
                    "title": title,
                    "text": hit.text_preview,
                    "score": hit.score,
                })
            })
            .collect();

        Ok(serde_json::json!({ "ok": true, "sources": sources }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_bare_strings() {
        let turn = normalize_to_role_content(&serde_json::json!("привет"));
        assert_eq!(turn.text.as_deref(), Some("привет"));
        assert!(turn.image_urls.is_empty());
    }

    #[test]
    fn normalize_handles_role_content_objects() {
        let turn = normalize_to_role_content(&serde_json::json!({
            "role": "assistant",
            "content": "Здравствуйте!",
        }));
        assert_eq!(turn.text.as_deref(), Some("Здравствуйте!"));
    }

    #[test]
    fn normalize_extracts_image_attachments() {
        let turn = normalize_to_role_content(&serde_json::json!({
            "content": "вот фото",
            "attachments": [
                { "type": "image", "payload": { "url": "https://cdn/x.jpg" } },
                { "type": "video", "payload": { "url": "https://cdn/x.mp4" } },
            ],
        }));
        assert_eq!(turn.text.as_deref(), Some("вот фото"));
        assert_eq!(turn.image_urls, vec!["https://cdn/x.jpg"]);
    }

    #[test]
    fn normalize_unwraps_json_encoded_strings() {
        let inner = serde_json::json!({ "role": "user", "content": "вложенный" }).to_string();
        let turn = normalize_to_role_content(&serde_json::Value::String(inner));
        assert_eq!(turn.text.as_deref(), Some("вложенный"));
    }

    #[test]
    fn resolve_active_tools_matches_partially() {
        let agent = vec!["calendar_list".to_string(), "gmail".to_string()];
        let project = vec!["Calendar".to_string(), "notion".to_string()];
        let active = AgentInstance::resolve_active_tools(&agent, &project);
        assert_eq!(active, vec!["calendar_list", "notion"]);
    }

    #[test]
    fn resolve_active_tools_defaults_to_agent_set() {
        let agent = vec!["gmail".to_string()];
        assert_eq!(AgentInstance::resolve_active_tools(&agent, &[]), agent);
    }

    #[tokio::test]
    async fn binding_injects_only_declared_capabilities() {
        struct Probe {
            spec: ToolSpec,
        }

        #[async_trait]
        impl AgentTool for Probe {
            fn spec(&self) -> &ToolSpec {
                &self.spec
            }
            async fn call(&self, args: ToolArgs) -> Result<serde_json::Value> {
                assert!(args.business_id.is_some());
                assert!(args.project_id.is_none(), "undeclared capability must not be injected");
                assert!(args.customer_id.is_none());
                Ok(serde_json::json!({ "ok": true }))
            }
        }

        let binding = ToolBinding {
            tool: Arc::new(Probe {
                spec: ToolSpec {
                    name: "probe".into(),
                    kind: "probe".into(),
                    icon: None,
                    description: String::new(),
                    parameters: serde_json::json!({}),
                    capabilities: HashSet::from([Capability::BusinessId]),
                },
            }),
            context: ToolContext {
                business_id: Uuid::now_v7(),
                project_id: Some("p-1".into()),
                customer_id: "c-1".into(),
                retrieval: None,
                knowledge: None,
            },
            usage_log: Arc::new(Mutex::new(Vec::new())),
        };

        let result = binding.invoke(serde_json::json!({})).await;
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn tool_exception_is_captured_not_propagated() {
        struct Exploder {
            spec: ToolSpec,
        }

        #[async_trait]
        impl AgentTool for Exploder {
            fn spec(&self) -> &ToolSpec {
                &self.spec
            }
            async fn call(&self, _args: ToolArgs) -> Result<serde_json::Value> {
                Err(Error::Internal("boom".into()))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let binding = ToolBinding {
            tool: Arc::new(Exploder {
                spec: ToolSpec {
                    name: "exploder".into(),
                    kind: "demo".into(),
                    icon: None,
                    description: String::new(),
                    parameters: serde_json::json!({}),
                    capabilities: HashSet::new(),
                },
            }),
            context: ToolContext {
                business_id: Uuid::now_v7(),
                project_id: None,
                customer_id: "c-1".into(),
                retrieval: None,
                knowledge: None,
            },
            usage_log: log.clone(),
        };

        let result = binding.invoke(serde_json::json!({})).await;
        assert_eq!(result["ok"], false);
        assert_eq!(result["error"], "tool_exception");
        assert_eq!(result["tool"], "exploder");

        let entries = log.lock().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].text.starts_with("error:"));
        assert_eq!(entries[0].id, "t_demo_exploder");
    }

    #[tokio::test]
    async fn usage_log_is_ring_capped() {
        struct Ok0 {
            spec: ToolSpec,
        }

        #[async_trait]
        impl AgentTool for Ok0 {
            fn spec(&self) -> &ToolSpec {
                &self.spec
            }
            async fn call(&self, _args: ToolArgs) -> Result<serde_json::Value> {
                Ok(serde_json::json!({ "ok": true }))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let binding = ToolBinding {
            tool: Arc::new(Ok0 {
                spec: ToolSpec {
                    name: "noop".into(),
                    kind: "demo".into(),
                    icon: None,
                    description: String::new(),
                    parameters: serde_json::json!({}),
                    capabilities: HashSet::new(),
                },
            }),
            context: ToolContext {
                business_id: Uuid::now_v7(),
                project_id: None,
                customer_id: "c".into(),
                retrieval: None,
                knowledge: None,
            },
            usage_log: log.clone(),
        };

        for _ in 0..30 {
            binding.invoke(serde_json::json!({})).await;
        }
        assert_eq!(log.lock().await.len(), TOOLS_USED_CAP);
    }

    #[test]
    fn long_tool_results_are_truncated() {
        let long = "щ".repeat(5000);
        assert_eq!(truncate_safe(&long, TOOL_RESULT_CAP).chars().count(), TOOL_RESULT_CAP);
    }
}
