use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Logical kind of a knowledge source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Text,
    File,
    Url,
    Site,
}

/// Indexing lifecycle status of a knowledge source.
///
/// Transitions are monotone (pending -> indexing -> ready | error) except for
/// an explicit reindex request, which moves ready/error back to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeStatus {
    Pending,
    Indexing,
    Ready,
    Error,
}

/// A knowledge-source row as stored in Postgres.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KnowledgeSource {
    pub owner_id: Uuid,
    pub source_id: String,
    /// Stored as text; parse with [`KnowledgeSource::kind`].
    pub r#type: String,
    pub uri: String,
    pub title: String,
    pub status: String,
    pub progress: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeSource {
    pub fn kind(&self) -> Option<SourceKind> {
        self.r#type.parse().ok()
    }

    pub fn status(&self) -> Option<KnowledgeStatus> {
        self.status.parse().ok()
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Serialized form for downstream consumers: common metadata sub-keys are
    /// lifted to the top level.
    pub fn into_view(self) -> SourceView {
        let meta = &self.metadata;
        let text = meta.get("text").and_then(|v| v.as_str());
        let content = text.map(|t| t.to_string());
        let preview = text.map(|t| t.chars().take(400).collect());
        let filename = meta
            .get("orig_filename")
            .or_else(|| meta.get("safe_filename"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let file_url = meta
            .get("file_url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        SourceView {
            source_id: self.source_id,
            r#type: self.r#type,
            uri: self.uri,
            title: self.title,
            status: self.status,
            progress: self.progress,
            content,
            preview,
            filename,
            file_url,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// The serialized knowledge-source shape handed to consumers (retrieval hits,
/// listings). `content`/`preview`/`filename`/`file_url` are lifted out of the
/// metadata column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceView {
    pub source_id: String,
    pub r#type: String,
    pub uri: String,
    pub title: String,
    pub status: String,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of the headless preview-PDF conversion, recorded in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PreviewPdfGeneration {
    Ok,
    Failed,
    SkippedNoSoffice,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with_meta(meta: serde_json::Value) -> KnowledgeSource {
        KnowledgeSource {
            owner_id: Uuid::nil(),
            source_id: "src-1".into(),
            r#type: "text".into(),
            uri: String::new(),
            title: "Notes".into(),
            status: "ready".into(),
            progress: 100,
            metadata: meta,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_and_kind_parse() {
        let src = source_with_meta(serde_json::json!({}));
        assert_eq!(src.kind(), Some(SourceKind::Text));
        assert_eq!(src.status(), Some(KnowledgeStatus::Ready));
    }

    #[test]
    fn view_lifts_metadata_fields() {
        let src = source_with_meta(serde_json::json!({
            "text": "hello world",
            "orig_filename": "notes.txt",
            "file_url": "/knowledge/file/src-1",
        }));
        let view = src.into_view();
        assert_eq!(view.content.as_deref(), Some("hello world"));
        assert_eq!(view.preview.as_deref(), Some("hello world"));
        assert_eq!(view.filename.as_deref(), Some("notes.txt"));
        assert_eq!(view.file_url.as_deref(), Some("/knowledge/file/src-1"));
    }

    #[test]
    fn view_preview_caps_at_400_chars() {
        let long = "я".repeat(1000);
        let src = source_with_meta(serde_json::json!({ "text": long }));
        let view = src.into_view();
        assert_eq!(view.preview.unwrap().chars().count(), 400);
    }

    #[test]
    fn preview_generation_labels() {
        assert_eq!(PreviewPdfGeneration::SkippedNoSoffice.to_string(), "skipped_no_soffice");
        assert_eq!(PreviewPdfGeneration::Ok.to_string(), "ok");
    }
}
