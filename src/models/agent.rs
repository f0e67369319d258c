use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// An agent configuration row, loaded by (business, agent).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentConfigRow {
    pub business_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub agent_role: Option<String>,
    pub agent_instructions: Option<String>,
    /// JSON array of tool names enabled for this agent.
    pub agent_tools: Option<serde_json::Value>,
    /// JSON array of channels this agent serves.
    pub agent_channels: Option<serde_json::Value>,
    pub agent_active: bool,
}

impl AgentConfigRow {
    /// Tool names, tolerating a JSON array, a JSON string, or a bare string.
    pub fn tool_names(&self) -> Vec<String> {
        flatten_string_list(self.agent_tools.as_ref())
    }
}

/// Which knowledge sources a project exposes to its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeMode {
    Pinned,
    Selected,
    All,
}

/// Project metadata stored in the projects.meta jsonb column.
#[derive(Debug, Clone)]
pub struct ProjectMeta {
    pub knowledge_mode: KnowledgeMode,
    pub knowledge_active: Vec<String>,
    pub tools: Vec<String>,
}

impl Default for ProjectMeta {
    fn default() -> Self {
        Self {
            knowledge_mode: KnowledgeMode::Pinned,
            knowledge_active: Vec::new(),
            tools: Vec::new(),
        }
    }
}

impl ProjectMeta {
    /// Parses the meta jsonb tolerantly; unknown or malformed fields fall back
    /// to defaults rather than failing the dispatch.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        let Some(meta) = value else {
            return Self::default();
        };

        let knowledge_mode = meta
            .get("knowledge_mode")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(KnowledgeMode::Pinned);

        Self {
            knowledge_mode,
            knowledge_active: flatten_string_list(meta.get("knowledge_active")),
            tools: flatten_string_list(meta.get("tools")),
        }
    }
}

/// Retrieval policy handed to the agent instance for one invocation.
#[derive(Debug, Clone)]
pub struct KnowledgeOptions {
    pub mode: KnowledgeMode,
    pub selected_ids: Vec<String>,
    pub top_k: usize,
}

impl KnowledgeOptions {
    pub fn from_project(meta: &ProjectMeta) -> Self {
        Self {
            mode: meta.knowledge_mode,
            selected_ids: meta.knowledge_active.clone(),
            top_k: 5,
        }
    }
}

/// One recorded tool invocation, surfaced alongside the assistant response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUsage {
    pub id: String,
    pub tool: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub title: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// The agent instance's answer for one batch.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub final_output: String,
    pub tools: Vec<ToolUsage>,
}

/// Accepts a JSON array of strings, a JSON-encoded array in a string, or a
/// single bare string, and returns the flat list.
pub fn flatten_string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        Some(serde_json::Value::String(s)) => {
            match serde_json::from_str::<Vec<String>>(s) {
                Ok(parsed) => parsed,
                Err(_) if s.is_empty() => Vec::new(),
                Err(_) => s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect(),
            }
        }
        Some(other) => vec![other.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_accepts_array_string_and_bare() {
        assert_eq!(
            flatten_string_list(Some(&serde_json::json!(["calendar", "gmail"]))),
            vec!["calendar", "gmail"]
        );
        assert_eq!(
            flatten_string_list(Some(&serde_json::json!("[\"calendar\"]"))),
            vec!["calendar"]
        );
        assert_eq!(
            flatten_string_list(Some(&serde_json::json!("calendar, gmail"))),
            vec!["calendar", "gmail"]
        );
        assert!(flatten_string_list(None).is_empty());
    }

    #[test]
    fn project_meta_defaults_to_pinned() {
        let meta = ProjectMeta::from_value(None);
        assert_eq!(meta.knowledge_mode, KnowledgeMode::Pinned);
        assert!(meta.tools.is_empty());
    }

    #[test]
    fn project_meta_parses_selected_mode() {
        let value = serde_json::json!({
            "knowledge_mode": "selected",
            "knowledge_active": ["src-1", "src-2"],
            "tools": "[\"calendar\"]",
        });
        let meta = ProjectMeta::from_value(Some(&value));
        assert_eq!(meta.knowledge_mode, KnowledgeMode::Selected);
        assert_eq!(meta.knowledge_active, vec!["src-1", "src-2"]);
        assert_eq!(meta.tools, vec!["calendar"]);

        let opts = KnowledgeOptions::from_project(&meta);
        assert_eq!(opts.top_k, 5);
        assert_eq!(opts.selected_ids.len(), 2);
    }
}
