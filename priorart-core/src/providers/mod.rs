//! Text-generation providers.
//!
//! The pipeline talks to language models only through the `TextGeneration`
//! trait: hypothetical claims, query variants, relevance grades and query
//! rewrites are all blocking request/response calls.
//!
//! Use `create_generator()` to instantiate the provider named in config.

pub mod mock;
pub mod openai_compat;

use crate::config::LlmConfig;
use crate::error::{ConfigError, GenerationParseError, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub use mock::MockTextGeneration;
pub use openai_compat::OpenAiCompatibleGenerator;

/// What a generation call is for. Used for logging and test routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationTask {
    HypotheticalClaim,
    MultiQuery,
    Grading,
    Rewrite,
}

impl std::fmt::Display for GenerationTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationTask::HypotheticalClaim => write!(f, "hypothetical_claim"),
            GenerationTask::MultiQuery => write!(f, "multi_query"),
            GenerationTask::Grading => write!(f, "grading"),
            GenerationTask::Rewrite => write!(f, "rewrite"),
        }
    }
}

/// Output shape requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Text,
    JsonObject,
}

/// A single blocking generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub task: GenerationTask,
    pub system: Option<String>,
    pub prompt: String,
    /// Model override; the provider's default is used when `None`.
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    pub response_format: ResponseFormat,
}

impl GenerationRequest {
    pub fn new(task: GenerationTask, prompt: impl Into<String>) -> Self {
        Self {
            task,
            system: None,
            prompt: prompt.into(),
            model: None,
            temperature: 0.7,
            max_tokens: None,
            response_format: ResponseFormat::Text,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn json(mut self) -> Self {
        self.response_format = ResponseFormat::JsonObject;
        self
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Trait for text-generation providers.
#[async_trait]
pub trait TextGeneration: Send + Sync {
    /// Perform a full, non-streaming completion.
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, LlmError>;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// Create the text-generation provider named in config.
///
/// Credentials are resolved here so a missing key fails at construction.
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn TextGeneration>, ConfigError> {
    match config.provider.as_str() {
        "openai" | "openai-compatible" | "ollama" | "vllm" => {
            let api_key = config.resolve_api_key()?;
            Ok(Arc::new(OpenAiCompatibleGenerator::new(config, api_key)?))
        }
        other => Err(ConfigError::MissingCapability {
            capability: format!("text generation provider '{other}'"),
        }),
    }
}

/// Map a non-success HTTP response to an `LlmError`.
pub(crate) fn map_http_error(provider: &str, status: reqwest::StatusCode, body: &str) -> LlmError {
    match status.as_u16() {
        401 | 403 => {
            tracing::debug!(body = %body, status = status.as_u16(), "Authentication failed");
            LlmError::AuthFailed {
                provider: provider.to_string(),
            }
        }
        429 => {
            // "Rate limit reached ... Please try again in 7s."
            let retry_secs = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| {
                    v.get("error")?
                        .get("message")?
                        .as_str()
                        .map(|s| s.to_string())
                })
                .and_then(|msg| {
                    msg.split("in ")
                        .last()
                        .and_then(|s| s.trim_end_matches('.').trim_end_matches('s').parse::<u64>().ok())
                })
                .unwrap_or(5);
            LlmError::RateLimited {
                retry_after_secs: retry_secs,
            }
        }
        code if code >= 500 => LlmError::Server {
            status: code,
            message: body.chars().take(500).collect(),
        },
        code => LlmError::ApiRequest {
            message: format!("HTTP {code}: {}", body.chars().take(500).collect::<String>()),
        },
    }
}

/// Map a transport failure to an `LlmError`.
pub(crate) fn map_transport_error(err: reqwest::Error, timeout_secs: u64) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout { timeout_secs }
    } else if err.is_connect() {
        LlmError::Connection {
            message: err.to_string(),
        }
    } else {
        LlmError::ApiRequest {
            message: format!("Request failed: {err}"),
        }
    }
}

/// Parse a model reply that should contain one JSON object.
///
/// Tolerates Markdown code fences and prose around the object.
pub fn parse_json_object(text: &str) -> Result<Value, GenerationParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(GenerationParseError::Empty);
    }
    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => {
            return Err(GenerationParseError::InvalidJson {
                message: "no JSON object found".to_string(),
            });
        }
    };
    let value: Value =
        serde_json::from_str(candidate).map_err(|e| GenerationParseError::InvalidJson {
            message: e.to_string(),
        })?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(GenerationParseError::InvalidJson {
            message: "top-level value is not an object".to_string(),
        })
    }
}
