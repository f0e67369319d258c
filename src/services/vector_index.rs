use crate::config::QdrantConfig;
use crate::error::{Error, Result};
use crate::services::sparse::SparseVector;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, Condition, CreateCollectionBuilder,
    DeletePointsBuilder, Distance, Filter, NamedVectors, PointStruct, ScoredPoint,
    SearchPointsBuilder, SparseVectorParamsBuilder, SparseVectorsConfigBuilder,
    UpsertPointsBuilder, Vector, VectorParamsBuilder, VectorsConfigBuilder,
};
use qdrant_client::{Payload, Qdrant};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use uuid::Uuid;

/// Points per upsert request.
const UPSERT_BATCH: usize = 128;
/// Upsert retry attempts for transient store errors.
const UPSERT_RETRIES: u32 = 3;
/// Candidates fetched per method before rank fusion.
pub const EXPAND_TOPN_EACH: usize = 8;
/// Default reciprocal-rank-fusion weights and smoothing constant.
pub const DENSE_WEIGHT: f64 = 0.7;
pub const SPARSE_WEIGHT: f64 = 0.3;
pub const RRF_K: f64 = 60.0;

/// A normalized search hit.
#[derive(Debug, Clone)]
pub struct Hit {
    pub id: String,
    pub score: f32,
    pub fused_score: Option<f64>,
    pub payload: serde_json::Value,
}

impl Hit {
    pub fn text_preview(&self) -> Option<&str> {
        self.payload.get("text_preview").and_then(|v| v.as_str())
    }

    pub fn source_id(&self) -> Option<&str> {
        self.payload.get("source_id").and_then(|v| v.as_str())
    }
}

/// One chunk ready for upsert.
#[derive(Debug, Clone)]
pub struct ChunkPoint {
    pub offset: usize,
    pub text: String,
    pub dense: Vec<f32>,
    pub sparse: Option<SparseVector>,
}

/// Chunk-embedding store backed by a Qdrant collection with named
/// `text_dense` / `text_sparse` vectors.
pub struct VectorIndex {
    client: Qdrant,
    collection: String,
    vector_name: String,
    sparse_name: String,
    vector_size: usize,
}

impl VectorIndex {
    pub fn connect(config: &QdrantConfig) -> Result<Self> {
        let mut builder = Qdrant::from_url(&config.url);
        let api_key = config.api_key.expose_secret();
        if !api_key.is_empty() {
            builder = builder.api_key(api_key.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| Error::VectorStore(format!("failed to build qdrant client: {}", e)))?;

        Ok(Self {
            client,
            collection: config.collection.clone(),
            vector_name: config.vector_name.clone(),
            sparse_name: config.sparse_name.clone(),
            vector_size: config.vector_size,
        })
    }

    pub fn vector_size(&self) -> usize {
        self.vector_size
    }

    /// Idempotently ensures the collection exists. Creation only happens when
    /// `create_allowed` is set (explicit configuration opt-in); otherwise a
    /// missing collection is an error rather than a silent create.
    pub async fn ensure_collection(&self, create_allowed: bool) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| Error::VectorStore(format!("collection_exists failed: {}", e)))?;
        if exists {
            return Ok(());
        }
        if !create_allowed {
            return Err(Error::VectorStore(format!(
                "collection '{}' does not exist and collection creation is disabled",
                self.collection
            )));
        }

        let mut vectors_config = VectorsConfigBuilder::default();
        vectors_config.add_named_vector_params(
            &self.vector_name,
            VectorParamsBuilder::new(self.vector_size as u64, Distance::Cosine),
        );
        let mut sparse_config = SparseVectorsConfigBuilder::default();
        sparse_config
            .add_named_vector_params(&self.sparse_name, SparseVectorParamsBuilder::default());

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(vectors_config)
                    .sparse_vectors_config(sparse_config),
            )
            .await
            .map_err(|e| Error::VectorStore(format!("create_collection failed: {}", e)))?;

        tracing::info!(collection = %self.collection, size = self.vector_size, "created qdrant collection");
        Ok(())
    }

    /// Deterministic point id derived from (owner, source, offset), stable
    /// across reindexing runs.
    pub fn point_id(owner_id: Uuid, source_id: &str, offset: usize) -> String {
        let name = format!("{}/{}/{}", owner_id, source_id, offset);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
    }

    /// Upserts chunk points in batches, skipping chunks whose dense embedding
    /// size does not match the collection dimension.
    pub async fn upsert_chunks(
        &self,
        owner_id: Uuid,
        source_id: &str,
        source_type: &str,
        title: &str,
        chunks: Vec<ChunkPoint>,
    ) -> Result<usize> {
        let mut points: Vec<PointStruct> = Vec::with_capacity(UPSERT_BATCH);
        let mut written = 0usize;

        for chunk in chunks {
            if chunk.dense.len() != self.vector_size {
                tracing::warn!(
                    got = chunk.dense.len(),
                    expect = self.vector_size,
                    offset = chunk.offset,
                    "embedding size mismatch, skipping chunk"
                );
                continue;
            }

            let preview: String = chunk.text.chars().take(400).collect();
            let payload = Payload::try_from(serde_json::json!({
                "owner_id": owner_id.to_string(),
                "source_id": source_id,
                "title": title,
                "offset": chunk.offset as i64,
                "text_preview": preview,
                "source_type": source_type,
            }))
            .map_err(|e| Error::VectorStore(format!("payload conversion failed: {}", e)))?;

            let mut vectors =
                NamedVectors::default().add_vector(&self.vector_name, Vector::new_dense(chunk.dense));
            if let Some(sparse) = chunk.sparse {
                if !sparse.is_empty() {
                    if sparse.indexes.len() != sparse.values.len() {
                        tracing::warn!(
                            offset = chunk.offset,
                            "sparse vector length mismatch, skipping sparse part"
                        );
                    } else {
                        vectors = vectors.add_vector(
                            &self.sparse_name,
                            Vector::new_sparse(sparse.indexes, sparse.values),
                        );
                    }
                }
            }

            points.push(PointStruct::new(
                Self::point_id(owner_id, source_id, chunk.offset),
                vectors,
                payload,
            ));
            written += 1;

            if points.len() >= UPSERT_BATCH {
                self.upsert_with_retry(std::mem::take(&mut points)).await?;
            }
        }

        if !points.is_empty() {
            self.upsert_with_retry(points).await?;
        }

        Ok(written)
    }

    async fn upsert_with_retry(&self, points: Vec<PointStruct>) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=UPSERT_RETRIES {
            match self
                .client
                .upsert_points(UpsertPointsBuilder::new(&self.collection, points.clone()).wait(true))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "qdrant upsert failed");
                    last_err = Some(e);
                    let backoff = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(Error::VectorStore(format!(
            "upsert failed after {} attempts: {}",
            UPSERT_RETRIES,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Removes every point belonging to (owner, source).
    pub async fn delete_for_source(&self, owner_id: Uuid, source_id: &str) -> Result<()> {
        if source_id.is_empty() {
            tracing::debug!("delete_for_source called with empty source_id, skipping");
            return Ok(());
        }
        let filter = Filter::must([
            Condition::matches("owner_id", owner_id.to_string()),
            Condition::matches("source_id", source_id.to_string()),
        ]);
        self.delete_by_filter(filter).await
    }

    /// Removes every point belonging to an owner.
    pub async fn delete_for_owner(&self, owner_id: Uuid) -> Result<()> {
        let filter = Filter::must([Condition::matches("owner_id", owner_id.to_string())]);
        self.delete_by_filter(filter).await
    }

    async fn delete_by_filter(&self, filter: Filter) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| Error::VectorStore(format!("delete failed: {}", e)))?;
        Ok(())
    }

    /// Builds the payload filter shared by dense and sparse searches.
    pub fn search_filter(
        owner_id: Uuid,
        allowed_source_ids: Option<&[String]>,
        allowed_source_types: Option<&[String]>,
    ) -> Filter {
        let mut conditions = vec![Condition::matches("owner_id", owner_id.to_string())];
        if let Some(ids) = allowed_source_ids {
            if !ids.is_empty() {
                conditions.push(Condition::matches("source_id", ids.to_vec()));
            }
        }
        if let Some(types) = allowed_source_types {
            if !types.is_empty() {
                conditions.push(Condition::matches("source_type", types.to_vec()));
            }
        }
        Filter::must(conditions)
    }

    /// Dense search against the named dense vector. Query vectors of the
    /// wrong dimension are rejected before hitting the store.
    pub async fn search_dense(
        &self,
        query_vec: Vec<f32>,
        filter: Filter,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        if query_vec.len() != self.vector_size {
            return Err(Error::VectorStore(format!(
                "query embedding size mismatch: {} != {}",
                query_vec.len(),
                self.vector_size
            )));
        }

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query_vec, limit as u64)
                    .vector_name(&self.vector_name)
                    .filter(filter)
                    .with_payload(true),
            )
            .await
            .map_err(|e| Error::VectorStore(format!("dense search failed: {}", e)))?;

        Ok(response.result.into_iter().map(normalize_hit).collect())
    }

    /// Sparse search against the named sparse vector.
    pub async fn search_sparse(
        &self,
        query: &SparseVector,
        filter: Filter,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query.values.clone(), limit as u64)
                    .sparse_indices(query.indexes.clone())
                    .vector_name(&self.sparse_name)
                    .filter(filter)
                    .with_payload(true),
            )
            .await
            .map_err(|e| Error::VectorStore(format!("sparse search failed: {}", e)))?;

        Ok(response.result.into_iter().map(normalize_hit).collect())
    }
}

fn normalize_hit(point: ScoredPoint) -> Hit {
    let id = match point.id.and_then(|p| p.point_id_options) {
        Some(PointIdOptions::Uuid(s)) => s,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    };
    Hit {
        id,
        score: point.score,
        fused_score: None,
        payload: payload_to_json(point.payload),
    }
}

fn payload_to_json(payload: HashMap<String, qdrant_client::qdrant::Value>) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = payload
        .into_iter()
        .map(|(k, v)| (k, qdrant_value_to_json(v)))
        .collect();
    serde_json::Value::Object(map)
}

fn qdrant_value_to_json(value: qdrant_client::qdrant::Value) -> serde_json::Value {
    match value.kind {
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => {
            serde_json::Number::from_f64(d).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null)
        }
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(qdrant_value_to_json).collect())
        }
        Some(Kind::StructValue(st)) => {
            let map: serde_json::Map<String, serde_json::Value> = st
                .fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_value_to_json(v)))
                .collect();
            serde_json::Value::Object(map)
        }
    }
}

/// Reciprocal Rank Fusion over ranked hit lists.
///
/// For each candidate id, `score = Σ_method w / (rrf_k + rank)` with ranks
/// starting at 1. Ties break by the candidate's rank in the first method.
/// Returns fused hits ordered best-first, each carrying the representative
/// payload from the first list it appeared in.
pub fn rrf_fuse(lists: &[Vec<Hit>], weights: &[f64], rrf_k: f64) -> Vec<Hit> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut first_method_rank: HashMap<String, usize> = HashMap::new();
    let mut details: HashMap<String, Hit> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for (method_idx, hits) in lists.iter().enumerate() {
        let w = weights.get(method_idx).copied().unwrap_or(1.0);
        for (rank0, hit) in hits.iter().enumerate() {
            if hit.id.is_empty() {
                continue;
            }
            let rank = rank0 + 1;
            *scores.entry(hit.id.clone()).or_insert(0.0) += w / (rrf_k + rank as f64);
            if method_idx == 0 {
                first_method_rank.entry(hit.id.clone()).or_insert(rank);
            }
            if !details.contains_key(&hit.id) {
                details.insert(hit.id.clone(), hit.clone());
                order.push(hit.id.clone());
            }
        }
    }

    order.sort_by(|a, b| {
        let sa = scores.get(a).copied().unwrap_or(0.0);
        let sb = scores.get(b).copied().unwrap_or(0.0);
        sb.partial_cmp(&sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ra = first_method_rank.get(a).copied().unwrap_or(usize::MAX);
                let rb = first_method_rank.get(b).copied().unwrap_or(usize::MAX);
                ra.cmp(&rb)
            })
    });

    order
        .into_iter()
        .filter_map(|id| {
            let mut hit = details.remove(&id)?;
            hit.fused_score = scores.get(&id).copied();
            Some(hit)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str) -> Hit {
        Hit {
            id: id.to_string(),
            score: 0.5,
            fused_score: None,
            payload: serde_json::json!({ "source_id": id }),
        }
    }

    #[test]
    fn point_ids_are_deterministic() {
        let owner = Uuid::parse_str("6f0a0cc4-9f0b-4f3e-9eb7-0d2f4a9f4b10").unwrap();
        let a = VectorIndex::point_id(owner, "src-1", 3);
        let b = VectorIndex::point_id(owner, "src-1", 3);
        let c = VectorIndex::point_id(owner, "src-1", 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn rrf_scores_sum_weighted_reciprocal_ranks() {
        let dense = vec![hit("a"), hit("b")];
        let sparse = vec![hit("b"), hit("a")];
        let fused = rrf_fuse(&[dense, sparse], &[0.7, 0.3], 60.0);

        // a: 0.7/61 + 0.3/62, b: 0.7/62 + 0.3/61
        let score_a = 0.7 / 61.0 + 0.3 / 62.0;
        let score_b = 0.7 / 62.0 + 0.3 / 61.0;
        assert_eq!(fused[0].id, "a");
        assert!((fused[0].fused_score.unwrap() - score_a).abs() < 1e-12);
        assert!((fused[1].fused_score.unwrap() - score_b).abs() < 1e-12);
    }

    #[test]
    fn rrf_dense_top1_wins_iff_weights_say_so() {
        // dense-top-1 != sparse-top-1: the dense leader keeps the fused top
        // spot iff 0.7/61 > 0.3/61 + 0.7/62. With rrf_k = 60 the inequality
        // fails, so the candidate ranked by both methods takes over.
        let dense = vec![hit("d"), hit("s")];
        let sparse = vec![hit("s")];
        let fused = rrf_fuse(&[dense, sparse], &[0.7, 0.3], 60.0);

        let dense_leader_wins = 0.7 / 61.0 > 0.3 / 61.0 + 0.7 / 62.0;
        assert!(!dense_leader_wins);
        assert_eq!(fused[0].id, "s");
        assert_eq!(fused[1].id, "d");

        // a sparse-only leader with no dense support cannot displace the
        // dense leader: 0.7/61 > 0.3/61
        let dense = vec![hit("d")];
        let sparse = vec![hit("s")];
        let fused = rrf_fuse(&[dense, sparse], &[0.7, 0.3], 60.0);
        assert_eq!(fused[0].id, "d");
    }

    #[test]
    fn rrf_monotone_in_rank() {
        // Doubling an item's rank in both lists must not increase its score.
        let near = vec![hit("x"), hit("y")];
        let near2 = vec![hit("x"), hit("y")];
        let fused_near = rrf_fuse(&[near, near2], &[0.7, 0.3], 60.0);
        let x_near = fused_near.iter().find(|h| h.id == "x").unwrap().fused_score.unwrap();

        let far = vec![hit("p"), hit("x"), hit("y")];
        let far2 = vec![hit("q"), hit("x"), hit("y")];
        let fused_far = rrf_fuse(&[far, far2], &[0.7, 0.3], 60.0);
        let x_far = fused_far.iter().find(|h| h.id == "x").unwrap().fused_score.unwrap();

        assert!(x_far < x_near);
    }

    #[test]
    fn rrf_ties_break_by_first_method_rank() {
        // Symmetric weights produce equal scores; the first method's order
        // decides.
        let dense = vec![hit("a"), hit("b")];
        let sparse = vec![hit("b"), hit("a")];
        let fused = rrf_fuse(&[dense, sparse], &[0.5, 0.5], 60.0);
        assert_eq!(fused[0].id, "a");
        assert_eq!(fused[1].id, "b");
    }

    #[test]
    fn qdrant_values_convert_to_json() {
        use qdrant_client::qdrant::Value;
        let mut payload = HashMap::new();
        payload.insert("title".to_string(), Value::from("Прайс".to_string()));
        payload.insert("offset".to_string(), Value::from(3i64));
        let json = payload_to_json(payload);
        assert_eq!(json["title"], "Прайс");
        assert_eq!(json["offset"], 3);
    }
}
