use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::agent::ToolUsage;

/// Message body published with an `ai_response` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponseMessage {
    /// Quotable message id; clients send it back as `reply_to_message_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub text_response: String,
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolUsage>,
}

/// Events published to a business's WebSocket channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusinessEvent {
    AiResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        message: AiResponseMessage,
        created_at: DateTime<Utc>,
    },
    MarkRead {
        customer_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ai_response_serializes_with_type_tag() {
        let event = BusinessEvent::AiResponse {
            project_id: None,
            thread_id: Some("t-1".into()),
            message: AiResponseMessage {
                message_id: Some("msg-7".into()),
                text_response: "Здравствуйте!".into(),
                attachments: vec![],
                tools: vec![],
            },
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ai_response");
        assert_eq!(json["thread_id"], "t-1");
        assert!(json.get("project_id").is_none());
        assert_eq!(json["message"]["text_response"], "Здравствуйте!");
        assert_eq!(json["message"]["message_id"], "msg-7");
    }

    #[test]
    fn mark_read_serializes_with_type_tag() {
        let event = BusinessEvent::MarkRead {
            customer_id: "c-9".into(),
            thread_id: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "mark_read");
        assert_eq!(json["customer_id"], "c-9");
    }
}
