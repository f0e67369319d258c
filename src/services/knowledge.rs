use crate::error::{Error, Result};
use crate::models::knowledge::{KnowledgeStatus, SourceKind, SourceView};
use crate::queries;
use crate::services::file_store::FileStore;
use crate::services::indexer::{IndexJob, IndexingWorker};
use crate::services::vector_index::VectorIndex;
use crate::DbPool;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Inline text content is clamped to this many characters on create.
const MAX_INLINE_TEXT_CHARS: usize = 200_000;

/// Result of a reindex request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReindexOutcome {
    /// A background job was scheduled; exactly one caller gets this per
    /// pending cycle.
    Queued,
    /// A job is already pending or running for this source.
    AlreadyPendingOrIndexing,
    /// The source kind has nothing to reindex from (a crawled site without a
    /// stored document).
    RequiresCrawler,
}

/// New-source payload from the API collaborator.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub kind: SourceKind,
    pub title: String,
    pub uri: String,
    pub content: Option<String>,
}

/// Owner-facing knowledge lifecycle: create/upload, reindex, delete. Deleting
/// a source also removes its vector points and stored file.
pub struct KnowledgeService {
    pool: DbPool,
    index: Arc<VectorIndex>,
    file_store: Arc<FileStore>,
    indexer: Arc<IndexingWorker>,
}

impl KnowledgeService {
    pub fn new(
        pool: DbPool,
        index: Arc<VectorIndex>,
        file_store: Arc<FileStore>,
        indexer: Arc<IndexingWorker>,
    ) -> Self {
        Self {
            pool,
            index,
            file_store,
            indexer,
        }
    }

    pub async fn list_sources(&self, owner_id: Uuid) -> Result<Vec<SourceView>> {
        let mut conn = self.pool.acquire().await?;
        let sources = queries::knowledge::list_by_owner(&mut conn, owner_id).await?;
        Ok(sources.into_iter().map(|s| s.into_view()).collect())
    }

    pub async fn get_source(&self, owner_id: Uuid, source_id: &str) -> Result<SourceView> {
        let mut conn = self.pool.acquire().await?;
        queries::knowledge::get(&mut conn, owner_id, source_id)
            .await?
            .map(|s| s.into_view())
            .ok_or_else(|| Error::NotFound(format!("source {} not found", source_id)))
    }

    /// Creates a source row. Text sources with content are immediately queued
    /// for indexing.
    pub async fn create_source(&self, owner_id: Uuid, payload: NewSource) -> Result<String> {
        if payload.title.trim().is_empty() {
            return Err(Error::Validation("title is required".into()));
        }

        let source_id = Uuid::new_v4().to_string();
        let mut metadata = serde_json::Map::new();
        if payload.kind == SourceKind::Text {
            let content = payload
                .content
                .as_deref()
                .ok_or_else(|| Error::Validation("text sources need content".into()))?;
            metadata.insert(
                "text".to_string(),
                serde_json::Value::String(content.chars().take(MAX_INLINE_TEXT_CHARS).collect()),
            );
        }

        let mut conn = self.pool.acquire().await?;
        queries::knowledge::insert(
            &mut conn,
            owner_id,
            &source_id,
            &payload.kind.to_string(),
            &payload.uri,
            &payload.title,
            KnowledgeStatus::Pending,
            0,
            serde_json::Value::Object(metadata),
        )
        .await?;
        drop(conn);

        if payload.kind == SourceKind::Text {
            self.indexer.schedule(IndexJob {
                owner_id,
                source_id: source_id.clone(),
                saved_path: None,
                title: payload.title,
                source_type: payload.kind.to_string(),
            });
        }

        Ok(source_id)
    }

    /// Accepts an uploaded document: policy checks, safe storage, source row,
    /// and a background indexing job.
    pub async fn upload_file(
        &self,
        owner_id: Uuid,
        orig_filename: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<String> {
        self.file_store
            .validate_upload(orig_filename, content_type, bytes.len() as u64)?;

        let safe = FileStore::safe_name(orig_filename);
        // prefix with the source id so concurrent uploads of the same name
        // cannot collide
        let source_id = Uuid::new_v4().to_string();
        let stored_name = format!("{}_{}", source_id, safe);
        let saved_path = self.file_store.save_stream(&stored_name, bytes).await?;

        let title = safe.clone();
        let metadata = serde_json::json!({
            "saved_path": saved_path.display().to_string(),
            "orig_filename": orig_filename,
            "safe_filename": safe,
            "file_url": format!("/knowledge/file/{}", source_id),
        });

        let mut conn = self.pool.acquire().await?;
        queries::knowledge::insert(
            &mut conn,
            owner_id,
            &source_id,
            &SourceKind::File.to_string(),
            "",
            &title,
            KnowledgeStatus::Pending,
            0,
            metadata,
        )
        .await?;
        drop(conn);

        self.indexer.schedule(IndexJob {
            owner_id,
            source_id: source_id.clone(),
            saved_path: Some(saved_path),
            title,
            source_type: SourceKind::File.to_string(),
        });

        Ok(source_id)
    }

    /// Requests a reindex.
    ///
    /// The pending transition is claimed by a conditional UPDATE, so of any
    /// number of concurrent requests exactly one schedules a job; the rest
    /// observe `AlreadyPendingOrIndexing`.
    pub async fn reindex_source(&self, owner_id: Uuid, source_id: &str) -> Result<ReindexOutcome> {
        let mut conn = self.pool.acquire().await?;
        let Some(record) = queries::knowledge::get(&mut conn, owner_id, source_id).await? else {
            return Err(Error::NotFound(format!("source {} not found", source_id)));
        };

        if matches!(
            record.status(),
            Some(KnowledgeStatus::Pending) | Some(KnowledgeStatus::Indexing)
        ) {
            return Ok(ReindexOutcome::AlreadyPendingOrIndexing);
        }

        let saved_path = record.metadata_str("saved_path").map(PathBuf::from);
        let has_inline_text = record.metadata_str("text").is_some();
        if record.kind() == Some(SourceKind::Site) && saved_path.is_none() && !has_inline_text {
            return Ok(ReindexOutcome::RequiresCrawler);
        }

        let patch = serde_json::json!({
            "reindex_requested_at": Utc::now().to_rfc3339(),
        });
        let claimed =
            queries::knowledge::mark_reindex_requested(&mut conn, owner_id, source_id, patch).await?;
        if !claimed {
            return Ok(ReindexOutcome::AlreadyPendingOrIndexing);
        }
        drop(conn);

        // stale points are removed again inside the job; this early delete
        // keeps search results clean while the job is queued
        if let Err(e) = self.index.delete_for_source(owner_id, source_id).await {
            tracing::error!(source_id, error = %e, "point delete before reindex failed");
        }

        self.indexer.schedule(IndexJob {
            owner_id,
            source_id: source_id.to_string(),
            saved_path,
            title: record.title.clone(),
            source_type: record.r#type.clone(),
        });

        Ok(ReindexOutcome::Queued)
    }

    /// Rebuilds the TF-IDF vocabulary from the owner's extracted texts so
    /// sparse search stays aligned with the indexed corpus.
    pub async fn fit_sparse_vocabulary(
        &self,
        owner_id: Uuid,
        sparse: &crate::services::sparse::TfidfSparseEmbedder,
    ) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        let sources = queries::knowledge::list_by_owner(&mut conn, owner_id).await?;
        drop(conn);

        let corpus: Vec<String> = sources
            .iter()
            .filter_map(|s| {
                s.metadata_str("extracted_text")
                    .or_else(|| s.metadata_str("text"))
                    .map(|t| t.to_string())
            })
            .filter(|t| !t.trim().is_empty())
            .collect();

        if corpus.is_empty() {
            return Err(Error::Validation(
                "owner has no extracted texts to fit a vocabulary from".into(),
            ));
        }

        let documents = corpus.len();
        sparse.fit(&corpus).await?;
        tracing::info!(owner_id = %owner_id, documents, "sparse vocabulary refitted");
        Ok(documents)
    }

    /// Deletes a source together with its vector points and stored file.
    pub async fn delete_source(&self, owner_id: Uuid, source_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let record = queries::knowledge::get(&mut conn, owner_id, source_id).await?;

        if let Err(e) = self.index.delete_for_source(owner_id, source_id).await {
            tracing::error!(source_id, error = %e, "vector point delete failed, continuing");
        }

        if let Some(path) = record.as_ref().and_then(|r| r.metadata_str("saved_path")) {
            self.file_store.delete(Path::new(path)).await;
        }
        if let Some(path) = record.as_ref().and_then(|r| r.metadata_str("preview_pdf")) {
            self.file_store.delete(Path::new(path)).await;
        }

        let removed = queries::knowledge::delete(&mut conn, owner_id, source_id).await?;
        if removed == 0 {
            return Err(Error::NotFound(format!("source {} not found", source_id)));
        }
        Ok(())
    }
}
