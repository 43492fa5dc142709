//! Embedding Generator
//!
//! Maps free text to fixed-dimension dense vectors. Two providers:
//! a local hashing embedder (deterministic, offline) and an
//! OpenAI-compatible `/embeddings` client.

use crate::config::{EmbeddingConfig, EmbeddingProviderKind, LlmConfig};
use crate::error::{EngineError, Result};
use crate::rag::vector_store::Embedding;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input, in input order. The whole batch fails or succeeds.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EngineError::EmbeddingUnavailable("Provider returned no vector".to_string()))
    }
}

/// Build the provider selected in configuration
pub fn build_embedder(
    config: &EmbeddingConfig,
    llm: &LlmConfig,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider {
        EmbeddingProviderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dimension))),
        EmbeddingProviderKind::OpenAi => {
            let api_key = llm.api_key.clone().ok_or_else(|| {
                EngineError::Config("OpenAI embeddings need OPENAI_API_KEY".to_string())
            })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                api_key,
                llm.base_url.clone(),
                config.model.clone(),
                config.dimension,
                config.timeout(),
            )?))
        }
    }
}

/// Feature-hashing embedder over word tokens and character trigrams.
/// Output depends only on the text and the dimension.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut embedding = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();

        // Word features
        for word in lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let hash = fnv1a(word.as_bytes());
            let idx = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            embedding[idx] += 2.0 * sign;
        }

        // Character trigram features
        let chars: Vec<char> = format!(" {} ", lower).chars().collect();
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            let hash = fnv1a(trigram.as_bytes());
            let idx = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            embedding[idx] += sign;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for e in &mut embedding {
                *e /= norm;
            }
        }
        embedding
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Embedding client using the OpenAI API
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimension: usize,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimension,
        });

        debug!(model = %self.model, batch = texts.len(), "Requesting embeddings");

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::EmbeddingUnavailable(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::EmbeddingUnavailable(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            EngineError::EmbeddingUnavailable(format!("Failed to parse embedding response: {}", e))
        })?;

        parse_embedding_response(&response_json, texts.len(), self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Order vectors by the `index` field and check count and dimension
fn parse_embedding_response(
    response_json: &serde_json::Value,
    expected: usize,
    dimension: usize,
) -> Result<Vec<Embedding>> {
    let data = response_json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EngineError::EmbeddingUnavailable("No embedding data in response".to_string()))?;

    if data.len() != expected {
        return Err(EngineError::EmbeddingUnavailable(format!(
            "Expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }

    let mut indexed: Vec<(usize, Embedding)> = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding: Embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EngineError::EmbeddingUnavailable("No embedding vector in response".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if embedding.len() != dimension {
            return Err(EngineError::EmbeddingUnavailable(format!(
                "Embedding has {} dimensions, expected {}",
                embedding.len(),
                dimension
            )));
        }
        indexed.push((index, embedding));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, e)| e).collect())
}
