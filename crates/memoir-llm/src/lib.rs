//! # Memoir LLM
//!
//! Trait-based language-model integration: completion clients (Ollama,
//! OpenAI-compatible, mock), the knowledge extractor, the stage-1 query
//! translator, and the answer generator.

pub mod answers;
pub mod extractor;
pub mod translator;

pub use answers::{AnswerGenerator, AnswerResponse, AnswerType};
pub use extractor::LlmKnowledgeExtractor;
pub use translator::SearchQueryTranslator;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// LLM client trait for structured-output prompting.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
}

/// Configuration for LLM clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub api_key: Option<String>,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout_seconds: 60,
            max_tokens: Some(2000),
            temperature: Some(0.1),
            api_key: None,
        }
    }
}

/// Local Ollama client.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    config: LLMConfig,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: LLMConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { config, client })
    }

    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.config.endpoint);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl LLMClient for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.config.endpoint);
        let payload = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.config.temperature.unwrap_or(0.1),
                "num_predict": self.config.max_tokens.unwrap_or(2000),
            }
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
                "Ollama request failed with status {}: {}",
                status,
                text
            ));
        }
        let result: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse Ollama response: {}", e))?;
        result
            .get("response")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid response format from Ollama"))
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// OpenAI-compatible client.
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    config: LLMConfig,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(config: LLMConfig) -> Result<Self> {
        if config.api_key.is_none() {
            return Err(anyhow!("OpenAI API key is required"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.config.endpoint);
        let payload = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": self.config.max_tokens.unwrap_or(2000),
            "temperature": self.config.temperature.unwrap_or(0.1),
        });
        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.api_key.as_deref().unwrap_or("")),
            )
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send request to OpenAI: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "OpenAI request failed with status {}: {}",
                status,
                text
            ));
        }
        let result: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse OpenAI response: {}", e))?;
        result
            .get("choices")
            .and_then(|choices| choices.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid response format from OpenAI"))
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn is_available(&self) -> bool {
        self.config.api_key.is_some()
    }
}

/// Mock client for tests: canned responses keyed by prompt substring,
/// with a default fallback.
#[derive(Debug, Clone, Default)]
pub struct MockLLMClient {
    responses: HashMap<String, String>,
    fallback: Option<String>,
}

impl MockLLMClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, prompt_contains: &str, response: &str) -> Self {
        self.responses
            .insert(prompt_contains.to_string(), response.to_string());
        self
    }

    pub fn with_fallback(mut self, response: &str) -> Self {
        self.fallback = Some(response.to_string());
        self
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        for (needle, response) in &self.responses {
            if prompt.contains(needle) {
                return Ok(response.clone());
            }
        }
        self.fallback
            .clone()
            .ok_or_else(|| anyhow!("mock client has no response for prompt"))
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Factory for creating LLM clients from configuration.
pub struct LLMClientFactory;

impl LLMClientFactory {
    pub fn create_client(config: &LLMConfig) -> Result<std::sync::Arc<dyn LLMClient>> {
        match config.provider.to_lowercase().as_str() {
            "ollama" => Ok(std::sync::Arc::new(OllamaClient::new(config.clone())?)),
            "openai" => Ok(std::sync::Arc::new(OpenAIClient::new(config.clone())?)),
            "mock" => Ok(std::sync::Arc::new(MockLLMClient::new())),
            other => Err(anyhow!("Unsupported LLM provider: {}", other)),
        }
    }
}

/// Extract the first JSON object or array from a model response,
/// tolerating code fences and prose around it.
pub(crate) fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    let start = trimmed
        .find(|c| c == '{' || c == '[')
        .ok_or_else(|| anyhow!("response contains no JSON"))?;
    let open = trimmed.as_bytes()[start] as char;
    let close = if open == '{' { '}' } else { ']' };
    let end = trimmed
        .rfind(close)
        .ok_or_else(|| anyhow!("response contains unterminated JSON"))?;
    if end < start {
        return Err(anyhow!("response contains malformed JSON"));
    }
    serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| anyhow!("response JSON failed to parse: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_config_default() {
        let config = LLMConfig::default();
        assert_eq!(config.provider, "ollama");
        assert_eq!(config.model, "llama3.2");
    }

    #[test]
    fn client_factory_builds_by_provider() {
        let client = LLMClientFactory::create_client(&LLMConfig::default()).unwrap();
        assert_eq!(client.name(), "ollama");
        let mock = LLMClientFactory::create_client(&LLMConfig {
            provider: "mock".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(mock.name(), "mock");
        assert!(LLMClientFactory::create_client(&LLMConfig {
            provider: "nope".into(),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn openai_requires_api_key() {
        let config = LLMConfig {
            provider: "openai".into(),
            ..Default::default()
        };
        assert!(OpenAIClient::new(config).is_err());
    }

    #[test]
    fn json_is_extracted_from_fenced_responses() {
        let fenced = "Here you go:\n```json\n{\"a\": 1}\n```";
        let value = extract_json(fenced).unwrap();
        assert_eq!(value["a"], 1);
        assert!(extract_json("no json here").is_err());
    }

    #[tokio::test]
    async fn mock_client_matches_by_substring() {
        let client = MockLLMClient::new()
            .with_response("weather", r#"{"answer": "sunny"}"#)
            .with_fallback("{}");
        let response = client.complete("what is the weather like").await.unwrap();
        assert!(response.contains("sunny"));
        assert_eq!(client.complete("unrelated").await.unwrap(), "{}");
    }
}
