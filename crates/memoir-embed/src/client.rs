//! HTTP embedding clients for Ollama and OpenAI-compatible endpoints.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::{normalize_in_place, EmbeddingModel};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;

/// Configuration shared by the HTTP embedding clients.
#[derive(Debug, Clone)]
pub struct EmbeddingClientConfig {
    pub endpoint: String,
    pub model: String,
    pub dimension: usize,
    pub timeout_seconds: u64,
    pub api_key: Option<String>,
}

impl Default for EmbeddingClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 768,
            timeout_seconds: 30,
            api_key: None,
        }
    }
}

/// Local Ollama embedding client (`/api/embed`).
#[derive(Debug, Clone)]
pub struct OllamaEmbeddingClient {
    config: EmbeddingClientConfig,
    client: reqwest::Client,
}

impl OllamaEmbeddingClient {
    pub fn new(config: EmbeddingClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { config, client })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.config.endpoint);
        let payload = serde_json::json!({
            "model": self.config.model,
            "input": inputs,
        });
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send request to Ollama: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Ollama embed request failed with status {}: {}",
                status,
                text
            ));
        }
        let result: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse Ollama response: {}", e))?;
        parse_embedding_rows(result.get("embeddings"), inputs.len(), self.config.dimension)
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbeddingClient {
    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut rows = self.embed_batch(&[text.to_string()]).await?;
        rows.pop()
            .ok_or_else(|| anyhow!("Ollama returned no embedding"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        with_retry(|| self.request(texts)).await
    }
}

/// OpenAI-compatible embedding client (`/v1/embeddings`).
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingClient {
    config: EmbeddingClientConfig,
    client: reqwest::Client,
}

impl OpenAiEmbeddingClient {
    pub fn new(config: EmbeddingClientConfig) -> Result<Self> {
        if config.api_key.is_none() {
            return Err(anyhow!("OpenAI API key is required"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { config, client })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.config.endpoint);
        let payload = serde_json::json!({
            "model": self.config.model,
            "input": inputs,
        });
        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.api_key.as_deref().unwrap_or("")),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send request to embedding endpoint: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Embedding request failed with status {}: {}",
                status,
                text
            ));
        }
        let result: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse embedding response: {}", e))?;
        let rows: Vec<Value> = result
            .get("data")
            .and_then(|d| d.as_array())
            .map(|arr| arr.iter().filter_map(|item| item.get("embedding").cloned()).collect())
            .ok_or_else(|| anyhow!("Invalid response format from embedding endpoint"))?;
        parse_embedding_rows(Some(&Value::Array(rows)), inputs.len(), self.config.dimension)
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddingClient {
    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut rows = self.embed_batch(&[text.to_string()]).await?;
        rows.pop()
            .ok_or_else(|| anyhow!("Embedding endpoint returned no embedding"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        with_retry(|| self.request(texts)).await
    }
}

fn parse_embedding_rows(
    rows: Option<&Value>,
    expected_count: usize,
    dimension: usize,
) -> Result<Vec<Vec<f32>>> {
    let rows = rows
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("Embedding response is missing the embeddings array"))?;
    if rows.len() != expected_count {
        return Err(anyhow!(
            "Embedding response count mismatch: expected {}, got {}",
            expected_count,
            rows.len()
        ));
    }
    let mut parsed = Vec::with_capacity(rows.len());
    for row in rows {
        let mut vector: Vec<f32> = row
            .as_array()
            .ok_or_else(|| anyhow!("Embedding row is not an array"))?
            .iter()
            .map(|x| x.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if vector.len() != dimension {
            return Err(anyhow!(
                "Embedding dimension mismatch: expected {}, got {}",
                dimension,
                vector.len()
            ));
        }
        normalize_in_place(&mut vector);
        parsed.push(vector);
    }
    Ok(parsed)
}

/// Retry a transient-failure-prone call with exponential backoff.
async fn with_retry<T, F, Fut>(mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt, error = %e, "embedding request failed");
                last_error = Some(e);
                if attempt + 1 < RETRY_ATTEMPTS {
                    let delay = RETRY_BASE_DELAY_MS << attempt;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("embedding request failed")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_count_mismatch() {
        let rows = serde_json::json!([[1.0, 0.0]]);
        assert!(parse_embedding_rows(Some(&rows), 2, 2).is_err());
    }

    #[test]
    fn parse_normalizes_rows() {
        let rows = serde_json::json!([[3.0, 4.0]]);
        let parsed = parse_embedding_rows(Some(&rows), 1, 2).unwrap();
        let norm = parsed[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn openai_client_requires_api_key() {
        let config = EmbeddingClientConfig::default();
        assert!(OpenAiEmbeddingClient::new(config).is_err());
    }
}
