use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use std::fmt;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub qdrant: QdrantConfig,
    pub embeddings: EmbeddingsConfig,
    pub llm: LlmConfig,
    pub ingest: IngestConfig,
    pub queues: QueueConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub user: String,
    #[serde(skip_serializing, default = "empty_secret")]
    pub password: SecretString,
    pub host: String,
    pub port: u16,
    pub database: String,
}

/// Secrets are skipped on serialization, so the defaults overlay never
/// carries them; a missing env value must surface through `validate`, not as
/// a serde "missing field" error.
fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

impl Config {
    /// Load configuration from environment variables, with defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            // Override with environment variables using `MIXRELAY` prefix and
            // `__` separator, e.g. MIXRELAY__AUTH__SECRET_KEY
            .add_source(
                config::Environment::with_prefix("MIXRELAY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;

        config.validate().map_err(|e| {
            config::ConfigError::Message(format!("Configuration validation failed: {}", e))
        })?;

        Ok(config)
    }

    /// Validates required secrets and numeric bounds. Startup refuses to
    /// proceed on any failure here.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let secret = self.auth.secret_key.expose_secret();
        if secret.is_empty() {
            return Err("MIXRELAY__AUTH__SECRET_KEY must be set".into());
        }
        if secret.len() < 32 {
            return Err(format!(
                "MIXRELAY__AUTH__SECRET_KEY must be at least 32 characters (got {} chars)",
                secret.len()
            )
            .into());
        }

        if self.auth.algorithm.parse::<jsonwebtoken::Algorithm>().is_err() {
            return Err(format!("unsupported JWT algorithm '{}'", self.auth.algorithm).into());
        }

        if self.auth.access_token_expire_minutes <= 0 {
            return Err("MIXRELAY__AUTH__ACCESS_TOKEN_EXPIRE_MINUTES must be positive".into());
        }
        if self.auth.refresh_token_expire_days <= 0 {
            return Err("MIXRELAY__AUTH__REFRESH_TOKEN_EXPIRE_DAYS must be positive".into());
        }
        if self.auth.encryption_key.expose_secret().is_empty() {
            return Err("MIXRELAY__AUTH__ENCRYPTION_KEY must be set".into());
        }

        if self.qdrant.vector_size == 0 {
            return Err("MIXRELAY__QDRANT__VECTOR_SIZE must be positive".into());
        }
        if self.embeddings.concurrency == 0 {
            return Err("MIXRELAY__EMBEDDINGS__CONCURRENCY must be positive".into());
        }
        if self.ingest.chunk_size <= self.ingest.overlap {
            return Err("ingest.chunk_size must be larger than ingest.overlap".into());
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Constructs the database connection string.
    pub fn connection_string(&self) -> SecretString {
        SecretString::from(format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user,
            self.password.expose_secret(),
            self.host,
            self.port,
            self.database
        ))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: "password".to_string().into(),
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Secret key for signing access and refresh JWTs.
    #[serde(skip_serializing, default = "empty_secret")]
    pub secret_key: SecretString,
    /// JWT signing algorithm name (must parse, default HS256).
    pub algorithm: String,
    /// Access token lifetime in minutes.
    pub access_token_expire_minutes: i64,
    /// Refresh token lifetime in days.
    pub refresh_token_expire_days: i64,
    /// Symmetric envelope key for stored third-party credentials.
    #[serde(skip_serializing, default = "empty_secret")]
    pub encryption_key: SecretString,
    /// Password-reset token lifetime in seconds.
    pub reset_token_ttl_secs: i64,
    /// How long expired revoked refresh tokens are retained before the
    /// cleanup worker deletes them, in minutes.
    pub revoked_token_retention_minutes: i64,
}

// Custom Debug implementation to redact secrets
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret_key", &"<REDACTED>")
            .field("algorithm", &self.algorithm)
            .field(
                "access_token_expire_minutes",
                &self.access_token_expire_minutes,
            )
            .field("refresh_token_expire_days", &self.refresh_token_expire_days)
            .field("encryption_key", &"<REDACTED>")
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        // Secrets require explicit configuration - no weak defaults
        Self {
            secret_key: SecretString::from(String::new()),
            algorithm: "HS256".to_string(),
            access_token_expire_minutes: 15,
            refresh_token_expire_days: 30,
            encryption_key: SecretString::from(String::new()),
            reset_token_ttl_secs: 3600,
            revoked_token_retention_minutes: 1440,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct QdrantConfig {
    pub url: String,
    #[serde(skip_serializing, default = "empty_secret")]
    pub api_key: SecretString,
    pub collection: String,
    pub vector_name: String,
    pub sparse_name: String,
    pub vector_size: usize,
    /// Collection creation is an explicit opt-in; runtime code never creates
    /// collections unless this is set.
    pub create_collections: bool,
}

impl fmt::Debug for QdrantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QdrantConfig")
            .field("url", &self.url)
            .field("api_key", &"<REDACTED>")
            .field("collection", &self.collection)
            .field("vector_name", &self.vector_name)
            .field("sparse_name", &self.sparse_name)
            .field("vector_size", &self.vector_size)
            .field("create_collections", &self.create_collections)
            .finish()
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: SecretString::from(String::new()),
            collection: "knowledge".to_string(),
            vector_name: "text_dense".to_string(),
            sparse_name: "text_sparse".to_string(),
            vector_size: 1536,
            create_collections: false,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct EmbeddingsConfig {
    pub api_base: String,
    #[serde(skip_serializing, default = "empty_secret")]
    pub api_key: SecretString,
    pub model: String,
    /// Simultaneous in-flight embedding requests (semaphore width).
    pub concurrency: usize,
}

impl fmt::Debug for EmbeddingsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingsConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &"<REDACTED>")
            .field("model", &self.model)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: SecretString::from(String::new()),
            model: "text-embedding-3-small".to_string(),
            concurrency: 4,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    pub api_base: String,
    #[serde(skip_serializing, default = "empty_secret")]
    pub api_key: SecretString,
    pub model: String,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &"<REDACTED>")
            .field("model", &self.model)
            .finish()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: SecretString::from(String::new()),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Chunk window in characters.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks in characters.
    pub overlap: usize,
    /// Extracted text is truncated to this many characters before indexing.
    pub max_text_chars: usize,
    /// Upload size cap in bytes.
    pub max_upload_bytes: u64,
    /// Directory for uploaded documents.
    pub upload_dir: String,
    /// Persisted TF-IDF vocabulary path.
    pub sparse_vocab_path: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: 3000,
            overlap: 300,
            max_text_chars: 200_000,
            max_upload_bytes: 50 * 1024 * 1024,
            upload_dir: "/tmp/knowledge_uploads".to_string(),
            sparse_vocab_path: "/tmp/knowledge_uploads/tfidf_vocab.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Batch coalescing window in seconds.
    pub batch_timeout_secs: u64,
    /// Queue-worker idle shutdown in seconds.
    pub idle_timeout_secs: u64,
    /// Per-conversation queue depth.
    pub max_queue_size: usize,
    /// Total per-conversation queues per handler.
    pub max_total_queues: usize,
    /// Simultaneous agent calls per handler (semaphore width).
    pub max_concurrent_workers: usize,
    /// Handlers kept in the registry (LRU bound).
    pub max_handlers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_timeout_secs: 5,
            idle_timeout_secs: 120,
            max_queue_size: 500,
            max_total_queues: 5000,
            max_concurrent_workers: 80,
            max_handlers: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Agent instances kept per dispatcher (LRU bound).
    pub max_agents: usize,
    /// Idle eviction threshold for cached agent instances, in seconds.
    pub cleanup_interval_secs: u64,
    /// Agent invocation deadline in seconds.
    pub invoke_timeout_secs: u64,
    /// Per-message channel send attempts.
    pub send_retries: u32,
    /// Word-safe wrap width for channel text blocks.
    pub block_max_chars: usize,
    /// Acceptance threshold for fuzzy calendar-card fusion.
    pub calendar_merge_accept: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_agents: 1000,
            cleanup_interval_secs: 1800,
            invoke_timeout_secs: 60,
            send_retries: 3,
            block_max_chars: 999,
            calendar_merge_accept: 0.45,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets are skipped by serde, so the printed form is safe
        match serde_json::to_string_pretty(&self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "Error serializing config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.auth.secret_key = SecretString::from("0123456789abcdef0123456789abcdef".to_string());
        cfg.auth.encryption_key = SecretString::from("envelope-key".to_string());
        cfg
    }

    #[test]
    fn missing_secret_key_fails_validation() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn short_secret_key_fails_validation() {
        let mut cfg = valid_config();
        cfg.auth.secret_key = SecretString::from("short".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unparseable_algorithm_fails_validation() {
        let mut cfg = valid_config();
        cfg.auth.algorithm = "ROT13".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn collection_creation_defaults_to_off() {
        assert!(!QdrantConfig::default().create_collections);
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn display_redacts_secrets() {
        let cfg = valid_config();
        let printed = format!("{}", cfg);
        assert!(!printed.contains("0123456789abcdef"));
        assert!(!printed.contains("envelope-key"));
    }
}
