use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A file attachment reference carried through the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileRef {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// One inbound message as it enters a per-conversation queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchItem {
    pub text: Option<String>,
    pub images: Vec<String>,
    pub files: Vec<FileRef>,
}

impl BatchItem {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.images.is_empty() && self.files.is_empty()
    }
}

/// Messages coalesced by the queue worker into a single dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserBatch {
    pub messages: Vec<String>,
    pub images: Vec<String>,
    pub files: Vec<FileRef>,
}

impl UserBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.images.is_empty() && self.files.is_empty()
    }

    pub fn absorb(&mut self, item: BatchItem) {
        if let Some(text) = item.text {
            self.messages.push(text);
        }
        self.images.extend(item.images);
        self.files.extend(item.files);
    }
}

/// A persisted conversation message row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryRecord {
    pub customer_message: Option<serde_json::Value>,
    pub assistant_response: Option<serde_json::Value>,
    pub business_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn is_empty(&self) -> bool {
        self.customer_message.is_none()
            && self.assistant_response.is_none()
            && self.business_response.is_none()
    }
}

/// Insert shape for a conversation message row.
#[derive(Debug, Clone)]
pub struct NewHistoryMessage {
    pub business_id: Uuid,
    pub business_name: String,
    pub agent_id: Uuid,
    pub agent_name: Option<String>,
    pub service: String,
    pub thread_id: Option<String>,
    pub project_id: Option<String>,
    pub customer_id: String,
    pub idempotency_key: Option<String>,
    pub customer_message: Option<serde_json::Value>,
    pub assistant_response: Option<serde_json::Value>,
    pub business_response: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_merges_in_order() {
        let mut batch = UserBatch::default();
        batch.absorb(BatchItem {
            text: Some("hi".into()),
            images: vec!["https://cdn/img1.png".into()],
            ..Default::default()
        });
        batch.absorb(BatchItem {
            text: Some("there".into()),
            files: vec![FileRef {
                url: "https://cdn/doc.pdf".into(),
                ..Default::default()
            }],
            ..Default::default()
        });

        assert_eq!(batch.messages, vec!["hi", "there"]);
        assert_eq!(batch.images.len(), 1);
        assert_eq!(batch.files.len(), 1);
    }

    #[test]
    fn empty_item_contributes_nothing() {
        let mut batch = UserBatch::default();
        batch.absorb(BatchItem::default());
        assert!(batch.is_empty());
    }
}
