use crate::config::EmbeddingsConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Retry attempts for transient provider failures.
const EMBED_RETRIES: u32 = 3;
/// Initial backoff in milliseconds, doubled per attempt.
const RETRY_BACKOFF_MS: u64 = 1000;

/// Dense-embedding provider seam. The indexing worker and retrieval service
/// only ever see this trait; tests plug in an in-process fake.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds a batch of texts. A failed element comes back as `None` rather
    /// than failing the whole batch.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>>;
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client with a process-wide concurrency cap.
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    api_base: String,
    api_key: SecretString,
    model: String,
    permits: Arc<Semaphore>,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
        }
    }

    async fn request_once(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let url = format!("{}/embeddings", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!(
                "provider returned {}: {}",
                status,
                crate::utils::safe_preview(&body, 200)
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("malformed response: {}", e)))?;

        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for datum in parsed.data {
            if datum.index < out.len() {
                out[datum.index] = Some(datum.embedding);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Internal("embedding semaphore closed".into()))?;

        let mut last_err = None;
        for attempt in 1..=EMBED_RETRIES {
            match self.request_once(texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "embedding request failed");
                    last_err = Some(e);
                    if attempt < EMBED_RETRIES {
                        let backoff =
                            std::time::Duration::from_millis(RETRY_BACKOFF_MS * (1 << (attempt - 1)));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Embedding("embedding failed".into())))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    /// Deterministic fake embedder for tests: hashes the text into a unit
    /// vector of the requested dimension.
    pub struct FakeEmbedder {
        pub dimension: usize,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut hasher = DefaultHasher::new();
                    text.hash(&mut hasher);
                    let seed = hasher.finish();
                    let mut vec: Vec<f32> = (0..self.dimension)
                        .map(|i| (((seed.rotate_left(i as u32 % 63)) % 1000) as f32) / 1000.0)
                        .collect();
                    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
                    if norm > 0.0 {
                        for v in &mut vec {
                            *v /= norm;
                        }
                    }
                    Some(vec)
                })
                .collect())
        }
    }
}
