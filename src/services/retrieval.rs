use crate::error::{Error, Result};
use crate::models::knowledge::SourceView;
use crate::queries;
use crate::services::embeddings::Embedder;
use crate::services::sparse::TfidfSparseEmbedder;
use crate::services::vector_index::{
    rrf_fuse, Hit, VectorIndex, DENSE_WEIGHT, EXPAND_TOPN_EACH, RRF_K, SPARSE_WEIGHT,
};
use crate::DbPool;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A retrieval hit joined with its knowledge-source record.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub id: String,
    pub score: f32,
    pub fused_score: Option<f64>,
    pub payload: serde_json::Value,
    pub text_preview: String,
    pub db: Option<SourceView>,
}

/// Query-time fusion search over the vector index, joined with the knowledge
/// repository.
pub struct RetrievalService {
    pool: DbPool,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl RetrievalService {
    pub fn new(pool: DbPool, index: Arc<VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            pool,
            index,
            embedder,
        }
    }

    /// Searches the owner's chunks for a query and attaches the backing
    /// source row to each hit.
    ///
    /// With a sparse embedder, dense and sparse searches run with
    /// `EXPAND_TOPN_EACH` candidates each and are fused by RRF; without one,
    /// a plain dense search is used. An empty query embedding returns no
    /// hits rather than failing.
    pub async fn search_and_fetch(
        &self,
        owner_id: Uuid,
        query: &str,
        allowed_source_ids: Option<&[String]>,
        allowed_source_types: Option<&[String]>,
        topn: usize,
        sparse_embedder: Option<&TfidfSparseEmbedder>,
    ) -> Result<Vec<RetrievedChunk>> {
        let embeddings = self.embedder.embed(std::slice::from_ref(&query.to_string())).await?;
        let Some(Some(dense_vec)) = embeddings.into_iter().next() else {
            tracing::warn!(owner_id = %owner_id, "empty embedding for query");
            return Ok(Vec::new());
        };
        if dense_vec.is_empty() {
            tracing::warn!(owner_id = %owner_id, "empty embedding for query");
            return Ok(Vec::new());
        }

        let filter =
            VectorIndex::search_filter(owner_id, allowed_source_ids, allowed_source_types);

        let hits: Vec<Hit> = match sparse_embedder {
            None => {
                self.index
                    .search_dense(dense_vec, filter, topn)
                    .await?
            }
            Some(sparse) => {
                let dense_hits = self
                    .index
                    .search_dense(dense_vec, filter.clone(), EXPAND_TOPN_EACH)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::error!(error = %e, "dense search failed");
                        Vec::new()
                    });

                let sparse_hits = match sparse.encode(query).await {
                    Ok(sparse_query) if !sparse_query.is_empty() => self
                        .index
                        .search_sparse(&sparse_query, filter, EXPAND_TOPN_EACH)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::error!(error = %e, "sparse search failed");
                            Vec::new()
                        }),
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        tracing::warn!(error = %e, "sparse query encoding failed");
                        Vec::new()
                    }
                };

                rrf_fuse(
                    &[dense_hits, sparse_hits],
                    &[DENSE_WEIGHT, SPARSE_WEIGHT],
                    RRF_K,
                )
                .into_iter()
                .take(topn)
                .collect()
            }
        };

        // Fetch each distinct source record once, concurrently.
        let mut source_ids: Vec<String> = Vec::new();
        for hit in &hits {
            if let Some(sid) = hit.source_id() {
                if !source_ids.iter().any(|s| s == sid) {
                    source_ids.push(sid.to_string());
                }
            }
        }

        let fetches = source_ids.iter().map(|sid| {
            let pool = self.pool.clone();
            let sid = sid.clone();
            async move {
                let mut conn = pool.acquire().await.map_err(Error::Sqlx)?;
                let record = queries::knowledge::get(&mut conn, owner_id, &sid).await?;
                Ok::<_, Error>((sid, record.map(|r| r.into_view())))
            }
        });

        let mut db_map: HashMap<String, Option<SourceView>> = HashMap::new();
        for result in futures::future::join_all(fetches).await {
            match result {
                Ok((sid, view)) => {
                    db_map.insert(sid, view);
                }
                Err(e) => tracing::error!(error = %e, "source fetch failed during retrieval"),
            }
        }

        Ok(hits
            .into_iter()
            .map(|hit| {
                let db = hit
                    .source_id()
                    .and_then(|sid| db_map.get(sid).cloned())
                    .flatten();
                RetrievedChunk {
                    text_preview: hit.text_preview().unwrap_or_default().to_string(),
                    id: hit.id,
                    score: hit.score,
                    fused_score: hit.fused_score,
                    payload: hit.payload,
                    db,
                }
            })
            .collect())
    }
}
