//! OpenAI-compatible text-generation provider.
//!
//! Supports OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio, and any
//! endpoint that follows the OpenAI chat completions API format.

use super::{
    Generation, GenerationRequest, ResponseFormat, TextGeneration, TokenUsage, map_http_error,
    map_transport_error,
};
use crate::config::LlmConfig;
use crate::error::{ConfigError, LlmError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const PROVIDER: &str = "OpenAI-compatible";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat-completions client.
pub struct OpenAiCompatibleGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
}

impl std::fmt::Debug for OpenAiCompatibleGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleGenerator")
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

impl OpenAiCompatibleGenerator {
    /// Create a provider with an explicitly resolved API key.
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            api_key,
            timeout_secs: config.timeout_secs,
        })
    }

    fn request_body(request: &GenerationRequest) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(DEFAULT_MODEL),
            "messages": messages,
            "temperature": request.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if request.response_format == ResponseFormat::JsonObject {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    fn parse_response(json: &Value, fallback_model: &str) -> Result<Generation, LlmError> {
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "missing choices[0].message.content".to_string(),
            })?
            .to_string();
        let usage = TokenUsage {
            input_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as usize,
            output_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as usize,
        };
        Ok(Generation {
            text,
            model: json["model"]
                .as_str()
                .unwrap_or(fallback_model)
                .to_string(),
            usage,
        })
    }
}

#[async_trait]
impl TextGeneration for OpenAiCompatibleGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);

        debug!(url = %url, model = %model, task = %request.task, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(map_http_error(PROVIDER, status, &response_body));
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {e}"),
            })?;

        Self::parse_response(&json, model)
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::GenerationTask;

    #[test]
    fn test_request_body_json_mode() {
        let req = GenerationRequest::new(GenerationTask::Grading, "grade")
            .with_system("sys")
            .with_model("gpt-4o-mini")
            .with_temperature(0.1)
            .json();
        let body = OpenAiCompatibleGenerator::request_body(&req);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "grade");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_request_body_text_mode() {
        let req = GenerationRequest::new(GenerationTask::HypotheticalClaim, "idea")
            .with_max_tokens(500);
        let body = OpenAiCompatibleGenerator::request_body(&req);
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["max_tokens"], 500);
        assert!(body.get("response_format").is_none());
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_response() {
        let json = json!({
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{ "message": { "role": "assistant", "content": "A method comprising..." } }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 40 }
        });
        let generation = OpenAiCompatibleGenerator::parse_response(&json, "x").unwrap();
        assert_eq!(generation.text, "A method comprising...");
        assert_eq!(generation.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(generation.usage.input_tokens, 120);
    }

    #[test]
    fn test_parse_response_missing_content() {
        let json = json!({ "choices": [] });
        assert!(matches!(
            OpenAiCompatibleGenerator::parse_response(&json, "x"),
            Err(LlmError::ResponseParse { .. })
        ));
    }

    #[test]
    fn test_new_trims_base_url() {
        let config = LlmConfig {
            base_url: Some("http://localhost:11434/v1/".into()),
            ..Default::default()
        };
        let generator = OpenAiCompatibleGenerator::new(&config, "k".into()).unwrap();
        assert_eq!(generator.base_url, "http://localhost:11434/v1");
    }
}
