use crate::config::LlmConfig;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a completion could not be produced
#[derive(Error, Debug, Clone)]
#[error("{reason}")]
pub struct CompletionFailure {
    pub reason: String,
}

impl CompletionFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Opaque text-completion capability: one prompt in, one text out.
/// No streaming and no conversation state.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionFailure>;
}

/// Chat-completions client for OpenAI-compatible endpoints
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, CompletionFailure> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| CompletionFailure::new("No API key configured (set OPENAI_API_KEY)"))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CompletionFailure::new(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionProvider for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionFailure> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You translate questions into a single PostgreSQL SELECT statement. Return SQL only."},
                {"role": "user", "content": prompt}
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        debug!(model = %self.model, prompt_chars = prompt.len(), "Calling completion endpoint");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionFailure::new(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CompletionFailure::new(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionFailure::new(format!("Failed to parse LLM response: {}", e)))?;

        extract_content(&response_json)
    }
}

fn extract_content(response_json: &serde_json::Value) -> Result<String, CompletionFailure> {
    if let Some(error) = response_json.get("error") {
        return Err(CompletionFailure::new(format!("LLM API error: {}", error)));
    }

    let choice = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| CompletionFailure::new("No choices in LLM response"))?;

    match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => warn!("LLM response was truncated due to length limit"),
        Some("content_filter") => {
            return Err(CompletionFailure::new("LLM response was filtered by content policy"))
        }
        _ => {}
    }

    let content = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| CompletionFailure::new("No content in LLM response"))?;

    if content.trim().is_empty() {
        return Err(CompletionFailure::new("Empty content in LLM response"));
    }

    Ok(content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content() {
        let response = serde_json::json!({
            "choices": [{"message": {"content": "SELECT 1"}, "finish_reason": "stop"}]
        });
        assert_eq!(extract_content(&response).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_extract_content_api_error() {
        let response = serde_json::json!({"error": {"message": "quota exceeded"}});
        let err = extract_content(&response).unwrap_err();
        assert!(err.reason.contains("quota exceeded"));
    }

    #[test]
    fn test_extract_content_filtered() {
        let response = serde_json::json!({
            "choices": [{"message": {"content": "x"}, "finish_reason": "content_filter"}]
        });
        assert!(extract_content(&response).is_err());
    }

    #[test]
    fn test_client_requires_api_key() {
        let config = LlmConfig::default();
        assert!(LlmClient::new(&config).is_err());
    }
}
