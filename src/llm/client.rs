//! Provider client for advisory calls.
//!
//! Supports OpenAI-compatible chat completions and the Anthropic messages
//! API. Responses are expected to be JSON; markdown fences are stripped
//! before parsing. The key `dummy-api-key` switches the client into mock
//! mode so the pipeline can be exercised without network access.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::config::Settings;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-latest";

const MOCK_API_KEY: &str = "dummy-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

/// Typed failure so callers can record the right lineage reason.
#[derive(Debug)]
pub enum LlmCallError {
    Timeout,
    Api(String),
}

impl std::fmt::Display for LlmCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmCallError::Timeout => write!(f, "Provider call timed out"),
            LlmCallError::Api(msg) => write!(f, "{}", msg),
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl LlmClient {
    /// Build a client from settings; `None` when the advisory layer is
    /// disabled or no key is configured for the selected provider.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        if !settings.use_llm {
            return None;
        }
        let (provider, api_key, default_model, base_url) =
            match settings.llm_provider.as_str() {
                "anthropic" => (
                    Provider::Anthropic,
                    settings.anthropic_api_key.clone()?,
                    DEFAULT_ANTHROPIC_MODEL,
                    ANTHROPIC_BASE_URL.to_string(),
                ),
                _ => (
                    Provider::OpenAi,
                    settings.openai_api_key.clone()?,
                    DEFAULT_OPENAI_MODEL,
                    OPENAI_BASE_URL.to_string(),
                ),
            };

        Some(Self {
            provider,
            api_key,
            model: settings
                .llm_model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            base_url,
            timeout: Duration::from_secs(settings.llm_timeout_secs),
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One prompt in, raw text out.
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmCallError> {
        if self.api_key == MOCK_API_KEY {
            debug!("mock advisory client; returning canned response");
            return Ok(r#"{"mock": true}"#.to_string());
        }

        match self.provider {
            Provider::OpenAi => self.complete_openai(prompt).await,
            Provider::Anthropic => self.complete_anthropic(prompt).await,
        }
    }

    async fn complete_openai(&self, prompt: &str) -> Result<String, LlmCallError> {
        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "Return JSON only, no text."},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.2,
            "max_tokens": 1000,
        });

        let response = client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmCallError::Api(format!(
                "Provider error ({}): {}",
                status, error_text
            )));
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| LlmCallError::Api(format!("Failed to parse provider response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(LlmCallError::Api(format!("Provider error: {}", error)));
        }

        response_json["choices"]
            .get(0)
            .and_then(|choice| choice["message"]["content"].as_str())
            .filter(|content| !content.is_empty())
            .map(|content| content.to_string())
            .ok_or_else(|| LlmCallError::Api("No content in provider response".to_string()))
    }

    async fn complete_anthropic(&self, prompt: &str) -> Result<String, LlmCallError> {
        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 1024,
            "system": "Return JSON only, no text.",
            "messages": [
                {"role": "user", "content": prompt}
            ],
        });

        let response = client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmCallError::Api(format!(
                "Provider error ({}): {}",
                status, error_text
            )));
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| LlmCallError::Api(format!("Failed to parse provider response: {}", e)))?;

        response_json["content"]
            .get(0)
            .and_then(|block| block["text"].as_str())
            .filter(|content| !content.is_empty())
            .map(|content| content.to_string())
            .ok_or_else(|| LlmCallError::Api("No content in provider response".to_string()))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> LlmCallError {
    if err.is_timeout() {
        LlmCallError::Timeout
    } else {
        LlmCallError::Api(format!("Provider call failed: {}", err))
    }
}

/// Strip markdown code fences some models wrap around JSON output.
pub fn strip_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_fences("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn disabled_settings_yield_no_client() {
        let settings = Settings {
            use_llm: false,
            openai_api_key: Some("sk-test".to_string()),
            ..Settings::default()
        };
        assert!(LlmClient::from_settings(&settings).is_none());
    }

    #[test]
    fn missing_key_yields_no_client() {
        let settings = Settings {
            use_llm: true,
            openai_api_key: None,
            ..Settings::default()
        };
        assert!(LlmClient::from_settings(&settings).is_none());
    }

    #[tokio::test]
    async fn mock_key_short_circuits() {
        let settings = Settings {
            use_llm: true,
            openai_api_key: Some(MOCK_API_KEY.to_string()),
            ..Settings::default()
        };
        let client = LlmClient::from_settings(&settings).unwrap();
        let out = client.complete("anything").await.unwrap();
        assert!(serde_json::from_str::<Value>(&out).is_ok());
    }
}
