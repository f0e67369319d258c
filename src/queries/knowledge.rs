use crate::{
    error::{Error, Result},
    models::knowledge::{KnowledgeSource, KnowledgeStatus},
};
use chrono::Utc;
use uuid::Uuid;

use crate::DbConn;

/// Hard cap on stored extracted text, enforced before every metadata write.
const MAX_EXTRACTED_TEXT_CHARS: usize = 200_000;

/// Lists all knowledge sources for an owner, newest first.
pub async fn list_by_owner(conn: &mut DbConn, owner_id: Uuid) -> Result<Vec<KnowledgeSource>> {
    let sources = sqlx::query_as::<_, KnowledgeSource>(
        r#"
        SELECT owner_id, source_id, type, uri, title, status, progress, metadata, created_at, updated_at
        FROM mxr.knowledge
        WHERE owner_id = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(owner_id)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(sources)
}

/// Inserts a new knowledge source row.
#[allow(clippy::too_many_arguments)]
pub async fn insert(
    conn: &mut DbConn,
    owner_id: Uuid,
    source_id: &str,
    kind: &str,
    uri: &str,
    title: &str,
    status: KnowledgeStatus,
    progress: i32,
    metadata: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO mxr.knowledge (
            owner_id, source_id, type, uri, title, status, progress, metadata, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), now())
        "#,
    )
    .bind(owner_id)
    .bind(source_id)
    .bind(kind)
    .bind(uri)
    .bind(title)
    .bind(status.to_string())
    .bind(progress)
    .bind(metadata)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(())
}

/// Gets a single source. The source may not exist.
pub async fn get(conn: &mut DbConn, owner_id: Uuid, source_id: &str) -> Result<Option<KnowledgeSource>> {
    let source = sqlx::query_as::<_, KnowledgeSource>(
        r#"
        SELECT owner_id, source_id, type, uri, title, status, progress, metadata, created_at, updated_at
        FROM mxr.knowledge
        WHERE owner_id = $1 AND source_id = $2
        LIMIT 1
        "#,
    )
    .bind(owner_id)
    .bind(source_id)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(source)
}

/// Clamps the `extracted_text` metadata field to the storage cap.
fn clamp_extracted_text(patch: &mut serde_json::Value) {
    if let Some(text) = patch.get("extracted_text").and_then(|v| v.as_str()) {
        if text.chars().count() > MAX_EXTRACTED_TEXT_CHARS {
            let clamped: String = text.chars().take(MAX_EXTRACTED_TEXT_CHARS).collect();
            patch["extracted_text"] = serde_json::Value::String(clamped);
        }
    }
}

/// Shallow-merges a metadata patch into the source's metadata column and
/// optionally updates status/progress. Null values in the patch remove keys
/// (jsonb_strip_nulls).
pub async fn update_metadata(
    conn: &mut DbConn,
    owner_id: Uuid,
    source_id: &str,
    mut metadata_patch: serde_json::Value,
    status: Option<KnowledgeStatus>,
    progress: Option<i32>,
) -> Result<()> {
    clamp_extracted_text(&mut metadata_patch);

    sqlx::query(
        r#"
        UPDATE mxr.knowledge
            SET metadata = jsonb_strip_nulls(coalesce(metadata::jsonb, '{}'::jsonb) || $3::jsonb),
                status = COALESCE($4, status),
                progress = COALESCE($5, progress),
                updated_at = $6
        WHERE owner_id = $1 AND source_id = $2
        "#,
    )
    .bind(owner_id)
    .bind(source_id)
    .bind(metadata_patch)
    .bind(status.map(|s| s.to_string()))
    .bind(progress)
    .bind(Utc::now())
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(())
}

/// Atomically marks a source as pending for reindexing.
///
/// The conditional UPDATE succeeds only when the current status is neither
/// `pending` nor `indexing`, so concurrent reindex requests collapse to a
/// single scheduled job. Returns whether this caller won the transition.
pub async fn mark_reindex_requested(
    conn: &mut DbConn,
    owner_id: Uuid,
    source_id: &str,
    mut metadata_patch: serde_json::Value,
) -> Result<bool> {
    clamp_extracted_text(&mut metadata_patch);

    let row: Option<(String,)> = sqlx::query_as(
        r#"
        UPDATE mxr.knowledge
        SET metadata = jsonb_strip_nulls(coalesce(metadata::jsonb, '{}'::jsonb) || $3::jsonb),
            status = 'pending',
            progress = 0,
            updated_at = $4
        WHERE owner_id = $1 AND source_id = $2 AND status NOT IN ('pending', 'indexing')
        RETURNING source_id
        "#,
    )
    .bind(owner_id)
    .bind(source_id)
    .bind(metadata_patch)
    .bind(Utc::now())
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(row.is_some())
}

/// Deletes a source row. Vector points and stored files are removed by the
/// calling service.
pub async fn delete(conn: &mut DbConn, owner_id: Uuid, source_id: &str) -> Result<u64> {
    let rows_affected = sqlx::query(
        r#"
        DELETE FROM mxr.knowledge
        WHERE owner_id = $1 AND source_id = $2
        "#,
    )
    .bind(owner_id)
    .bind(source_id)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?
    .rows_affected();

    Ok(rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_leaves_short_text_alone() {
        let mut patch = serde_json::json!({ "extracted_text": "short" });
        clamp_extracted_text(&mut patch);
        assert_eq!(patch["extracted_text"], "short");
    }

    #[test]
    fn clamp_truncates_long_text() {
        let mut patch = serde_json::json!({ "extracted_text": "ы".repeat(200_005) });
        clamp_extracted_text(&mut patch);
        assert_eq!(
            patch["extracted_text"].as_str().unwrap().chars().count(),
            200_000
        );
    }

    #[test]
    fn clamp_ignores_other_keys() {
        let mut patch = serde_json::json!({ "preview_pdf": "/tmp/a.pdf" });
        clamp_extracted_text(&mut patch);
        assert_eq!(patch["preview_pdf"], "/tmp/a.pdf");
    }
}
