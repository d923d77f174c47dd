//! OpenAI-compatible chat completions client
//!
//! Works against any endpoint that speaks the `/chat/completions` wire
//! format (OpenAI, vLLM, Ollama, LiteLLM proxies, ...).

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};
use crate::config::LlmConfig;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 500;

/// Delay before retry `attempt` (1-based): exponential, plus up to 25% jitter
fn backoff_delay(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF_MS * 2u64.pow(attempt.saturating_sub(1));
    let jitter = rand::rng().random_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}

/// OpenAI-compatible API client
pub struct OpenAIClient {
    endpoint: String,
    api_key: Option<String>,
    http: Client,
    max_retries: u32,
}

impl OpenAIClient {
    /// Create a new client from configuration
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        debug!(?config, "from_config: called");
        let timeout = Duration::from_millis(config.timeout_ms);

        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;

        Ok(Self {
            endpoint: config.endpoint(),
            api_key: config.resolve_api_key(),
            http,
            max_retries: config.max_retries,
        })
    }

    /// Endpoint this client posts to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build the request body for the chat completions API
    fn build_request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        debug!(%request.model, messages = request.messages.len(), "build_request_body: called");

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), serde_json::json!(request.model));
        body.insert("messages".to_string(), serde_json::json!(request.messages));

        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), serde_json::json!(temperature));
        }

        for (key, value) in &request.extra {
            body.insert(key.clone(), value.clone());
        }

        serde_json::Value::Object(body)
    }

    /// Parse the API response body
    fn parse_response(&self, api_response: OpenAIResponse) -> Result<CompletionResponse, LlmError> {
        debug!(choices = api_response.choices.len(), "parse_response: called");
        if let Some(error) = api_response.error
            && !error.message.is_empty()
        {
            return Err(LlmError::InvalidResponse(error.message));
        }

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices returned by LLM".to_string()))?;

        let usage = api_response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            usage,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        debug!(%request.model, endpoint = %self.endpoint, "complete: called");
        let body = self.build_request_body(&request);

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = backoff_delay(attempt);
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, "complete: retrying after transient error");
                tokio::time::sleep(backoff).await;
            }

            let mut builder = self
                .http
                .post(&self.endpoint)
                .header("content-type", "application/json")
                .json(&body);
            if let Some(key) = &self.api_key {
                builder = builder.header("Authorization", format!("Bearer {}", key));
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(attempt, error = %e, "complete: network error");
                    last_error = Some(LlmError::Network(e));
                    continue;
                }
            };

            let status = response.status().as_u16();

            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                let error = LlmError::ApiError {
                    status,
                    message: text.trim().to_string(),
                };
                if error.is_retryable() && attempt < self.max_retries {
                    debug!(attempt, status, "complete: retryable error");
                    last_error = Some(error);
                    continue;
                }
                debug!(%status, "complete: API error");
                return Err(error);
            }

            debug!("complete: success");
            let api_response: OpenAIResponse = response.json().await?;
            return self.parse_response(api_response);
        }

        Err(last_error.unwrap_or_else(|| LlmError::InvalidResponse("Max retries exceeded".to_string())))
    }
}

// Chat completions response types

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
    error: Option<OpenAIErrorBody>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorBody {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;
    use serde_json::json;

    fn test_client() -> OpenAIClient {
        let config = LlmConfig {
            api_base: "http://localhost:9/v1".to_string(),
            api_key: Some("test-key".to_string()),
            ..LlmConfig::default()
        };
        OpenAIClient::from_config(&config).unwrap()
    }

    #[test]
    fn test_backoff_delay_grows_with_jitter() {
        for _ in 0..50 {
            let first = backoff_delay(1).as_millis() as u64;
            assert!((500..=625).contains(&first), "first retry waited {first}ms");
            let third = backoff_delay(3).as_millis() as u64;
            assert!((2000..=2500).contains(&third), "third retry waited {third}ms");
        }
    }

    #[test]
    fn test_from_config_builds_endpoint() {
        let client = test_client();
        assert_eq!(client.endpoint(), "http://localhost:9/v1/chat/completions");
        assert_eq!(client.api_key.as_deref(), Some("test-key"));
    }

    #[test]
    fn test_build_request_body() {
        let client = test_client();
        let mut request = CompletionRequest::new("gpt-4o-mini", vec![Message::system("sys"), Message::user("hello")]);
        request.temperature = Some(0.5);
        request.extra.insert("max_tokens".to_string(), json!(256));

        let body = client.build_request_body(&request);

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn test_build_request_body_omits_unset_temperature() {
        let client = test_client();
        let request = CompletionRequest::new("m", vec![Message::user("q")]);
        let body = client.build_request_body(&request);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_parse_response_content() {
        let client = test_client();
        let raw: OpenAIResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "FINAL(\"42\")"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 3}
        }))
        .unwrap();

        let response = client.parse_response(raw).unwrap();
        assert_eq!(response.content, "FINAL(\"42\")");
        assert_eq!(response.usage.total(), 13);
    }

    #[test]
    fn test_parse_response_error_field() {
        let client = test_client();
        let raw: OpenAIResponse = serde_json::from_value(json!({
            "error": {"message": "model not found"}
        }))
        .unwrap();

        let err = client.parse_response(raw).unwrap_err();
        assert!(err.to_string().contains("model not found"));
    }

    #[test]
    fn test_parse_response_no_choices() {
        let client = test_client();
        let raw: OpenAIResponse = serde_json::from_value(json!({"choices": []})).unwrap();

        let err = client.parse_response(raw).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }
}
