//! Engine Configuration
//!
//! Every external collaborator (LLM endpoint, embedding model, relational
//! store) is configured here and handed to component constructors. Nothing
//! reads credentials from ambient process state after startup.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Row cap used when the generated query carries no limit
pub const DEFAULT_ROW_CAP: u64 = 1_000;
/// Hard ceiling for any limit, requested or generated
pub const MAX_ROW_CAP: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            temperature: 0.0,
            max_tokens: 800,
            timeout_secs: 30,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// Local character-trigram hashing, no network
    Hashing,
    /// OpenAI-compatible `/embeddings` endpoint
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hashing,
            model: "text-embedding-3-small".to_string(),
            dimension: 384,
            timeout_secs: 10,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub max_connections: u32,
    pub statement_timeout_ms: u64,
    /// Cap handed to the translator and the executor for every request
    pub row_cap: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            statement_timeout_ms: 30_000,
            row_cap: DEFAULT_ROW_CAP,
        }
    }
}

impl DatabaseConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    /// Configured cap, clamped to the hard ceiling
    pub fn effective_row_cap(&self) -> u64 {
        self.row_cap.clamp(1, MAX_ROW_CAP)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub index_path: PathBuf,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            index_path: PathBuf::from("data/vector_store/index.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub database: DatabaseConfig,
    pub retrieval: RetrievalConfig,
    /// JSON schema override; the built-in ARGO schema is used when absent
    pub schema_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Load from a JSON file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        Self::read_file(path)?.with_env_overrides()
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(key) = env("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = env("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = env("OPENAI_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = env("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(cap) = env("OCEAN_ROW_CAP") {
            self.database.row_cap = parse_env("OCEAN_ROW_CAP", &cap)?;
        }
        if let Some(ms) = env("OCEAN_STATEMENT_TIMEOUT_MS") {
            self.database.statement_timeout_ms = parse_env("OCEAN_STATEMENT_TIMEOUT_MS", &ms)?;
        }
        if let Some(k) = env("OCEAN_TOP_K") {
            self.retrieval.top_k = parse_env("OCEAN_TOP_K", &k)?;
        }
        if let Some(path) = env("OCEAN_INDEX_PATH") {
            self.retrieval.index_path = PathBuf::from(path);
        }
        if let Some(path) = env("OCEAN_SCHEMA_PATH") {
            self.schema_path = Some(PathBuf::from(path));
        }
        if let Some(provider) = env("OCEAN_EMBEDDING_PROVIDER") {
            self.embedding.provider = match provider.to_lowercase().as_str() {
                "hashing" => EmbeddingProviderKind::Hashing,
                "openai" => EmbeddingProviderKind::OpenAi,
                other => {
                    return Err(EngineError::Config(format!(
                        "Unknown embedding provider: {}",
                        other
                    )))
                }
            };
        }
        if let Some(model) = env("OCEAN_EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(dim) = env("OCEAN_EMBEDDING_DIMENSION") {
            self.embedding.dimension = parse_env("OCEAN_EMBEDDING_DIMENSION", &dim)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(EngineError::Config("Embedding dimension must be positive".to_string()));
        }
        if self.database.row_cap == 0 {
            return Err(EngineError::Config("Row cap must be positive".to_string()));
        }
        Ok(())
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("Invalid value for {}: {}", name, value)))
}
