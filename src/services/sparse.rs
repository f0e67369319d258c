use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// A sparse vector in index/value form, as stored in the vector index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SparseVector {
    pub indexes: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

/// Persisted TF-IDF state: vocabulary (term -> index) and per-term document
/// frequencies gathered during fitting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TfidfState {
    vocabulary: HashMap<String, u32>,
    idf: HashMap<u32, f32>,
    documents_fitted: usize,
}

/// TF-IDF sparse embedder with a fixed vocabulary.
///
/// Tokenization is lowercase alphanumeric unigrams plus adjacent bigrams.
/// `fit` builds the vocabulary (capped at `max_features`) and persists it
/// atomically; `encode_batch` keeps the `top_k` highest-weight entries per
/// text, sorted by descending value.
pub struct TfidfSparseEmbedder {
    persist_path: Option<PathBuf>,
    max_features: u32,
    top_k: usize,
    state: RwLock<Option<TfidfState>>,
}

impl TfidfSparseEmbedder {
    pub const DEFAULT_MAX_FEATURES: u32 = 50_000;
    pub const DEFAULT_TOP_K: usize = 64;

    pub fn new(persist_path: Option<PathBuf>, max_features: u32, top_k: usize) -> Self {
        Self {
            persist_path,
            max_features,
            top_k,
            state: RwLock::new(None),
        }
    }

    fn tokenize(text: &str) -> Vec<String> {
        let words: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_string())
            .collect();

        let mut tokens = words.clone();
        for pair in words.windows(2) {
            tokens.push(format!("{} {}", pair[0], pair[1]));
        }
        tokens
    }

    /// Builds the vocabulary from a corpus and persists it when a path is set.
    pub async fn fit(&self, texts: &[String]) -> Result<()> {
        if texts.is_empty() {
            return Err(Error::Validation("cannot fit TF-IDF on an empty corpus".into()));
        }

        // document frequency per term
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for text in texts {
            let mut seen: Vec<String> = Self::tokenize(text);
            seen.sort();
            seen.dedup();
            for token in seen {
                *doc_freq.entry(token).or_insert(0) += 1;
            }
        }

        // keep the most frequent terms, capped at max_features, with a
        // deterministic order (frequency desc, then term) so refits on the
        // same corpus yield the same vocabulary
        let mut terms: Vec<(String, usize)> = doc_freq.into_iter().collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        terms.truncate(self.max_features as usize);

        let n_docs = texts.len() as f32;
        let mut vocabulary = HashMap::with_capacity(terms.len());
        let mut idf = HashMap::with_capacity(terms.len());
        for (index, (term, df)) in terms.into_iter().enumerate() {
            let index = index as u32;
            // smoothed idf, always positive
            let weight = ((1.0 + n_docs) / (1.0 + df as f32)).ln() + 1.0;
            vocabulary.insert(term, index);
            idf.insert(index, weight);
        }

        let state = TfidfState {
            vocabulary,
            idf,
            documents_fitted: texts.len(),
        };

        self.persist(&state).await?;
        *self.state.write().await = Some(state);
        Ok(())
    }

    /// Writes the fitted state atomically: temp file, 0o600, rename.
    async fn persist(&self, state: &TfidfState) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        let tmp = path.with_extension("json.tmp");
        let encoded = serde_json::to_vec(state)?;
        tokio::fs::write(&tmp, &encoded).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, path).await?;
        tracing::info!(path = %path.display(), "TF-IDF vocabulary persisted");
        Ok(())
    }

    /// Lazy-loads persisted state. A corrupt or missing file leaves the
    /// embedder unfitted rather than failing the caller.
    pub async fn load(&self) -> bool {
        if self.state.read().await.is_some() {
            return true;
        }
        let Some(path) = &self.persist_path else {
            return false;
        };

        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<TfidfState>(&bytes) {
                Ok(state) => {
                    tracing::info!(path = %path.display(), terms = state.vocabulary.len(), "TF-IDF vocabulary loaded");
                    *self.state.write().await = Some(state);
                    true
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "persisted TF-IDF state is corrupt");
                    false
                }
            },
            Err(_) => false,
        }
    }

    pub async fn is_fitted(&self) -> bool {
        self.load().await
    }

    /// Encodes a batch of texts into sparse vectors.
    pub async fn encode_batch(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        if !self.load().await {
            return Err(Error::Internal(
                "TF-IDF embedder is not fitted and no persisted vocabulary is available".into(),
            ));
        }
        let guard = self.state.read().await;
        let state = guard.as_ref().expect("state checked above");

        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.encode_one(state, text));
        }
        Ok(out)
    }

    pub async fn encode(&self, text: &str) -> Result<SparseVector> {
        let mut batch = self.encode_batch(std::slice::from_ref(&text.to_string())).await?;
        Ok(batch.pop().unwrap_or_default())
    }

    fn encode_one(&self, state: &TfidfState, text: &str) -> SparseVector {
        let tokens = Self::tokenize(text);
        if tokens.is_empty() {
            return SparseVector::default();
        }

        let mut counts: HashMap<u32, f32> = HashMap::new();
        for token in &tokens {
            if let Some(&index) = state.vocabulary.get(token) {
                *counts.entry(index).or_insert(0.0) += 1.0;
            }
        }
        if counts.is_empty() {
            return SparseVector::default();
        }

        let total = tokens.len() as f32;
        let mut weighted: Vec<(u32, f32)> = counts
            .into_iter()
            .filter_map(|(index, count)| {
                let idf = state.idf.get(&index)?;
                Some((index, (count / total) * idf))
            })
            .collect();

        // keep top_k by weight, output sorted by descending value
        weighted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        weighted.truncate(self.top_k);

        let mut indexes = Vec::with_capacity(weighted.len());
        let mut values = Vec::with_capacity(weighted.len());
        for (index, value) in weighted {
            if index >= self.max_features {
                tracing::warn!(index, max_features = self.max_features, "TF-IDF index out of range, skipping");
                continue;
            }
            indexes.push(index);
            values.push(value);
        }

        SparseVector { indexes, values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<String> {
        vec![
            "доставка цветов по городу".to_string(),
            "букет роз с доставкой".to_string(),
            "свадебные букеты на заказ".to_string(),
            "price list and delivery terms".to_string(),
        ]
    }

    #[tokio::test]
    async fn fit_then_encode_produces_descending_values() {
        let emb = TfidfSparseEmbedder::new(None, 1000, 8);
        emb.fit(&corpus()).await.unwrap();

        let vecs = emb.encode_batch(&corpus()).await.unwrap();
        assert_eq!(vecs.len(), 4);
        for v in &vecs {
            assert!(!v.is_empty());
            assert_eq!(v.indexes.len(), v.values.len());
            for pair in v.values.windows(2) {
                assert!(pair[0] >= pair[1], "values must be sorted descending");
            }
        }
    }

    #[tokio::test]
    async fn top_k_caps_entry_count() {
        let emb = TfidfSparseEmbedder::new(None, 1000, 2);
        emb.fit(&corpus()).await.unwrap();
        let v = emb.encode("доставка цветов по городу и букет роз").await.unwrap();
        assert!(v.indexes.len() <= 2);
    }

    #[tokio::test]
    async fn indexes_stay_under_max_features() {
        let emb = TfidfSparseEmbedder::new(None, 5, 64);
        emb.fit(&corpus()).await.unwrap();
        let v = emb.encode("доставка цветов и букет роз").await.unwrap();
        assert!(v.indexes.iter().all(|&i| i < 5));
    }

    #[tokio::test]
    async fn unfitted_encode_errors() {
        let emb = TfidfSparseEmbedder::new(None, 100, 8);
        assert!(emb.encode("query").await.is_err());
    }

    #[tokio::test]
    async fn out_of_vocabulary_text_encodes_empty() {
        let emb = TfidfSparseEmbedder::new(None, 1000, 8);
        emb.fit(&corpus()).await.unwrap();
        let v = emb.encode("零知识证明").await.unwrap();
        assert!(v.is_empty());
    }

    #[tokio::test]
    async fn persist_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");

        let emb = TfidfSparseEmbedder::new(Some(path.clone()), 1000, 8);
        emb.fit(&corpus()).await.unwrap();
        let before = emb.encode("доставка цветов").await.unwrap();

        let reloaded = TfidfSparseEmbedder::new(Some(path.clone()), 1000, 8);
        assert!(reloaded.load().await);
        let after = reloaded.encode("доставка цветов").await.unwrap();
        assert_eq!(before, after);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn corrupt_persisted_state_leaves_unfitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, b"not json at all").unwrap();

        let emb = TfidfSparseEmbedder::new(Some(path), 1000, 8);
        assert!(!emb.load().await);
        assert!(emb.encode("query").await.is_err());
    }
}
