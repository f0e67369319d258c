use crate::config::IngestConfig;
use crate::error::{Error, Result};
use crate::models::knowledge::{KnowledgeStatus, PreviewPdfGeneration};
use crate::queries;
use crate::services::embeddings::Embedder;
use crate::services::parse::{self, PreviewOutcome};
use crate::services::sparse::TfidfSparseEmbedder;
use crate::services::vector_index::{ChunkPoint, VectorIndex};
use crate::DbPool;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Chunks per embedding request.
const EMB_BATCH: usize = 8;

/// One indexing job: parse a stored document (or take inline text), chunk,
/// embed, and upsert into the vector index.
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub owner_id: Uuid,
    pub source_id: String,
    pub saved_path: Option<PathBuf>,
    pub title: String,
    pub source_type: String,
}

/// Background indexing pipeline (parse -> chunk -> embed -> upsert), writing
/// status and progress into the knowledge repository at each step.
pub struct IndexingWorker {
    pool: DbPool,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    sparse: Option<Arc<TfidfSparseEmbedder>>,
    config: IngestConfig,
}

impl IndexingWorker {
    pub fn new(
        pool: DbPool,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        sparse: Option<Arc<TfidfSparseEmbedder>>,
        config: IngestConfig,
    ) -> Self {
        Self {
            pool,
            index,
            embedder,
            sparse,
            config,
        }
    }

    /// Spawns a job in the background. Failures are recorded on the source
    /// row and logged; they never propagate to the scheduler.
    pub fn schedule(self: &Arc<Self>, job: IndexJob) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let owner_id = job.owner_id;
            let source_id = job.source_id.clone();
            if let Err(e) = worker.process(job).await {
                tracing::error!(
                    owner_id = %owner_id,
                    source_id = %source_id,
                    error = %e,
                    "indexing job failed"
                );
                worker
                    .mark_error(owner_id, &source_id, &e.to_string())
                    .await;
            }
        });
    }

    async fn mark_error(&self, owner_id: Uuid, source_id: &str, reason: &str) {
        let Ok(mut conn) = self.pool.acquire().await else {
            return;
        };
        let patch = serde_json::json!({
            "indexing_error": true,
            "indexing_error_reason": crate::utils::safe_preview(reason, 500),
        });
        if let Err(e) = queries::knowledge::update_metadata(
            &mut conn,
            owner_id,
            source_id,
            patch,
            Some(KnowledgeStatus::Error),
            Some(0),
        )
        .await
        {
            tracing::error!(source_id, error = %e, "failed to record indexing error");
        }
    }

    /// Runs the full pipeline for one source.
    pub async fn process(&self, job: IndexJob) -> Result<()> {
        tracing::info!(
            owner_id = %job.owner_id,
            source_id = %job.source_id,
            saved_path = ?job.saved_path,
            "indexing started"
        );

        let mut meta = serde_json::Map::new();
        if let Some(path) = &job.saved_path {
            meta.insert(
                "saved_path".to_string(),
                serde_json::Value::String(path.display().to_string()),
            );
        }

        // 1. Parse the document, or fall back to inline metadata text.
        let mut text = match &job.saved_path {
            Some(path) => match parse::extract_text(path).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "document parse failed");
                    None
                }
            },
            None => None,
        };

        if text.is_none() && job.saved_path.is_none() {
            text = self.inline_text(job.owner_id, &job.source_id).await?;
        }

        // Preview PDF for file-backed sources, recorded regardless of whether
        // parsing produced text.
        if let Some(path) = &job.saved_path {
            let (preview_patch, preview_path) = match parse::generate_pdf_preview(path).await {
                PreviewOutcome::Ok(pdf) => (
                    serde_json::json!({
                        "preview_pdf_generation": PreviewPdfGeneration::Ok.to_string(),
                    }),
                    Some(pdf),
                ),
                PreviewOutcome::Failed(detail) => (
                    serde_json::json!({
                        "preview_pdf_generation": PreviewPdfGeneration::Failed.to_string(),
                        "preview_pdf_error": detail,
                    }),
                    None,
                ),
                PreviewOutcome::SkippedNoSoffice => (
                    serde_json::json!({
                        "preview_pdf_generation": PreviewPdfGeneration::SkippedNoSoffice.to_string(),
                    }),
                    None,
                ),
            };
            let mut patch = preview_patch;
            if let Some(pdf) = preview_path {
                patch["preview_pdf"] = serde_json::Value::String(pdf.display().to_string());
            }
            self.update(job.owner_id, &job.source_id, patch, None, None).await;
        }

        // 2-3. Nothing to index: leave the source pending for a later retry.
        let Some(text) = text else {
            meta.insert("tried_parse".to_string(), serde_json::Value::Bool(true));
            self.update(
                job.owner_id,
                &job.source_id,
                serde_json::Value::Object(meta),
                Some(KnowledgeStatus::Pending),
                Some(0),
            )
            .await;
            tracing::info!(source_id = %job.source_id, "no text extracted, leaving pending");
            return Ok(());
        };

        // 4. Trim and mark indexing started. The progress tick carries only a
        // short snippet; the full extracted text lands with the final write.
        let preview: String = text.chars().take(self.config.max_text_chars).collect();
        let mut tick = meta.clone();
        tick.insert(
            "extracted_text".to_string(),
            serde_json::Value::String(preview.chars().take(400).collect()),
        );
        self.update(
            job.owner_id,
            &job.source_id,
            serde_json::Value::Object(tick),
            Some(KnowledgeStatus::Indexing),
            Some(10),
        )
        .await;

        // 5. Remove stale points before writing the new generation.
        self.index
            .delete_for_source(job.owner_id, &job.source_id)
            .await?;

        // 6. Chunk.
        let chunks = chunk_text(&preview, self.config.chunk_size, self.config.overlap);
        if chunks.is_empty() {
            tracing::warn!(source_id = %job.source_id, "no chunks produced");
            self.update(
                job.owner_id,
                &job.source_id,
                serde_json::json!({}),
                Some(KnowledgeStatus::Ready),
                Some(100),
            )
            .await;
            return Ok(());
        }

        // 7. Embed in fixed-size batches, walking progress 10 -> 90.
        let batch_size = EMB_BATCH;
        let total_batches = chunks.len().div_ceil(batch_size);
        let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(chunks.len());
        for (batch_idx, batch) in chunks.chunks(batch_size).enumerate() {
            match self.embedder.embed(batch).await {
                Ok(batch_embeddings) => embeddings.extend(batch_embeddings),
                Err(e) => {
                    tracing::warn!(batch = batch_idx, error = %e, "embedding batch failed");
                    embeddings.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
            }

            let progress = 10 + (80 * (batch_idx + 1) / total_batches) as i32;
            self.update(
                job.owner_id,
                &job.source_id,
                serde_json::json!({}),
                Some(KnowledgeStatus::Indexing),
                Some(progress),
            )
            .await;
        }

        // 8. Validate embeddings.
        let expect = self.index.vector_size();
        let none_count = embeddings.iter().filter(|e| e.is_none()).count();
        let mismatched = embeddings
            .iter()
            .flatten()
            .filter(|e| e.len() != expect)
            .count();
        let valid = embeddings
            .iter()
            .flatten()
            .filter(|e| e.len() == expect)
            .count();
        tracing::info!(
            source_id = %job.source_id,
            total = embeddings.len(),
            none = none_count,
            mismatched,
            "embedding diagnostics"
        );

        if valid == 0 {
            let reason = if none_count == embeddings.len() {
                "all_none_embeddings".to_string()
            } else {
                format!("mismatched_vector_size ({} of {})", mismatched, embeddings.len())
            };
            self.update(
                job.owner_id,
                &job.source_id,
                serde_json::json!({ "indexing_error": true, "indexing_error_reason": reason }),
                Some(KnowledgeStatus::Error),
                Some(0),
            )
            .await;
            return Ok(());
        }

        // 9. Optional sparse vectors; any failure downgrades to dense-only.
        let sparse_vectors = match &self.sparse {
            Some(embedder) => match embedder.encode_batch(&chunks).await {
                Ok(vectors) if vectors.len() == chunks.len() => Some(vectors),
                Ok(vectors) => {
                    tracing::warn!(
                        got = vectors.len(),
                        want = chunks.len(),
                        "sparse embedder returned wrong count, skipping sparse"
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "sparse encoding failed, proceeding dense-only");
                    None
                }
            },
            None => None,
        };

        // 10. Upsert with deterministic ids, then mark ready.
        let points: Vec<ChunkPoint> = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .filter_map(|(offset, (text, dense))| {
                dense.map(|dense| ChunkPoint {
                    offset,
                    text,
                    dense,
                    sparse: sparse_vectors.as_ref().and_then(|sv| sv.get(offset).cloned()),
                })
            })
            .collect();

        let written = self
            .index
            .upsert_chunks(
                job.owner_id,
                &job.source_id,
                &job.source_type,
                &job.title,
                points,
            )
            .await?;

        // the full extracted text is the TF-IDF corpus for later vocabulary
        // fits; the repository clamps it at its own storage cap
        meta.insert(
            "extracted_text".to_string(),
            serde_json::Value::String(preview),
        );
        self.update(
            job.owner_id,
            &job.source_id,
            serde_json::Value::Object(meta),
            Some(KnowledgeStatus::Ready),
            Some(100),
        )
        .await;

        tracing::info!(
            source_id = %job.source_id,
            points = written,
            "indexing complete"
        );
        Ok(())
    }

    /// Source rows of kind `text` carry their content in metadata.
    async fn inline_text(&self, owner_id: Uuid, source_id: &str) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await.map_err(Error::Sqlx)?;
        let Some(record) = queries::knowledge::get(&mut conn, owner_id, source_id).await? else {
            tracing::info!(source_id, "no record found while looking for inline text");
            return Ok(None);
        };
        Ok(record
            .metadata_str("text")
            .map(|t| t.chars().take(self.config.max_text_chars).collect()))
    }

    /// Progress writes are best-effort: a failed write never aborts the job.
    async fn update(
        &self,
        owner_id: Uuid,
        source_id: &str,
        patch: serde_json::Value,
        status: Option<KnowledgeStatus>,
        progress: Option<i32>,
    ) {
        let conn = self.pool.acquire().await;
        match conn {
            Ok(mut conn) => {
                if let Err(e) = queries::knowledge::update_metadata(
                    &mut conn, owner_id, source_id, patch, status, progress,
                )
                .await
                {
                    tracing::error!(source_id, error = %e, "progress write failed");
                }
            }
            Err(e) => tracing::error!(source_id, error = %e, "no connection for progress write"),
        }
    }
}

/// Splits text into overlapping character windows. The final chunk always
/// reaches the end of the text; every boundary is a char boundary.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + chunk_size).min(len);
        chunks.push(chars[start..end].iter().collect());
        if end >= len {
            break;
        }
        start = end - overlap.min(end);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_the_text_with_overlap() {
        let text = "a".repeat(7000);
        let chunks = chunk_text(&text, 3000, 300);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 3000);
        assert_eq!(chunks[1].len(), 3000);
        // third chunk starts at 5400 and runs to the end
        assert_eq!(chunks[2].len(), 7000 - 5400);
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("короткий текст", 3000, 300);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "короткий текст");
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("", 3000, 300).is_empty());
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "пример текста ".repeat(500);
        assert_eq!(chunk_text(&text, 3000, 300), chunk_text(&text, 3000, 300));
    }

    #[test]
    fn multibyte_text_chunks_on_char_boundaries() {
        let text = "ё".repeat(4000);
        let chunks = chunk_text(&text, 3000, 300);
        assert_eq!(chunks[0].chars().count(), 3000);
        for chunk in &chunks {
            assert!(chunk.chars().all(|c| c == 'ё'));
        }
    }
}
