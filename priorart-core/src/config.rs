//! Configuration system for the retrieval pipeline.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/priorart/config.toml` and/or `.priorart/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Top-level configuration for the retrieval pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub llm: LlmConfig,
    pub models: ModelsConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub grading: GradingConfig,
    pub retry: RetryConfig,
    pub reranker: RerankerConfig,
    pub sanitize: SanitizeConfig,
    /// Upper bound on one full `run`, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            models: ModelsConfig::default(),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            grading: GradingConfig::default(),
            retry: RetryConfig::default(),
            reranker: RerankerConfig::default(),
            sanitize: SanitizeConfig::default(),
            request_timeout_secs: 120,
        }
    }
}

/// Text-generation provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name. Only OpenAI-compatible endpoints are supported.
    pub provider: String,
    /// Optional base URL override for the API endpoint.
    pub base_url: Option<String>,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Inline API key. Takes precedence over `api_key_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Per-request HTTP timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

impl LlmConfig {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
    }

    /// Whether the endpoint is a local server (Ollama, vLLM, LM Studio).
    pub fn is_local(&self) -> bool {
        self.base_url
            .as_ref()
            .map(|u| u.contains("localhost") || u.contains("127.0.0.1"))
            .unwrap_or(false)
    }

    /// Resolve the API key from the inline value or the configured env var.
    ///
    /// Local endpoints don't require a key and get a dummy bearer token.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.is_local().then(|| "local".to_string()))
            .ok_or_else(|| ConfigError::EnvVarMissing {
                var: self.api_key_env.clone(),
            })
    }
}

/// Per-purpose model names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// HyDE and multi-query generation.
    pub expansion: String,
    /// Relevance grading and query rewrite.
    pub grading: String,
    pub embedding: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            expansion: "gpt-4o-mini".to_string(),
            grading: "gpt-4o-mini".to_string(),
            embedding: "text-embedding-3-small".to_string(),
        }
    }
}

/// Which embedder produces dense vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Remote `/embeddings` endpoint on the configured LLM base URL.
    OpenAi,
    /// In-process hashing embedder. No network access.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    /// Vector size; when unset, 1536 for `openai` and 256 for `local`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::OpenAi,
            dimensions: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn dimensions(&self) -> usize {
        self.dimensions.unwrap_or(match self.provider {
            EmbeddingProvider::OpenAi => 1536,
            EmbeddingProvider::Local => 256,
        })
    }
}

/// Search and fusion parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub dense_weight: f32,
    pub sparse_weight: f32,
    /// RRF smoothing constant.
    pub rrf_k: u32,
    /// Results per query; the orchestrator returns up to twice this.
    pub top_k: usize,
    pub use_hybrid: bool,
    /// Generate a hypothetical claim (HyDE) as an extra query.
    pub include_hypothetical: bool,
    pub max_paraphrases: usize,
    /// Classification-code prefixes a document must match; empty disables filtering.
    pub category_filters: Vec<String>,
    /// Over-fetch multiplier when filters are applied client-side.
    pub filter_overfetch: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dense_weight: 0.5,
            sparse_weight: 0.5,
            rrf_k: 60,
            top_k: 5,
            use_hybrid: true,
            include_hypothetical: true,
            max_paraphrases: 3,
            category_filters: Vec::new(),
            filter_overfetch: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    /// Averages below this trigger a query rewrite.
    pub threshold: f32,
    /// 0 disables the rewrite; at most one is ever attempted.
    pub max_rewrite_attempts: u32,
    /// Characters of abstract and claims shown to the grader per candidate.
    pub digest_chars: usize,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            max_rewrite_attempts: 1,
            digest_chars: 300,
        }
    }
}

/// Retry policies per call class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub search: RetryPolicy,
    pub id_fetch: RetryPolicy,
    pub generation: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            search: RetryPolicy::search(),
            id_fetch: RetryPolicy::id_fetch(),
            generation: RetryPolicy::generation(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    pub enabled: bool,
    /// Cross-encoder model name. Unknown names leave the reranker in pass-through mode.
    pub model: String,
    pub top_k: usize,
    pub text_max_chars: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "lexical-overlap".to_string(),
            top_k: 5,
            text_max_chars: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeConfig {
    pub enabled: bool,
    pub max_input_chars: usize,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_input_chars: 2000,
        }
    }
}

impl PipelineConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let search = &self.search;
        if search.dense_weight < 0.0 || search.sparse_weight < 0.0 {
            return Err(invalid("fusion weights must be non-negative"));
        }
        if search.dense_weight == 0.0 && search.sparse_weight == 0.0 {
            return Err(invalid("dense_weight and sparse_weight cannot both be zero"));
        }
        if search.rrf_k == 0 {
            return Err(invalid("rrf_k must be positive"));
        }
        if search.top_k == 0 {
            return Err(invalid("search.top_k must be positive"));
        }
        if search.filter_overfetch == 0 {
            return Err(invalid("search.filter_overfetch must be positive"));
        }
        if !(0.0..=1.0).contains(&self.grading.threshold) {
            return Err(invalid("grading.threshold must be within [0, 1]"));
        }
        if self.grading.max_rewrite_attempts > 1 {
            return Err(invalid("grading.max_rewrite_attempts must be 0 or 1"));
        }
        for (name, policy) in [
            ("search", &self.retry.search),
            ("id_fetch", &self.retry.id_fetch),
            ("generation", &self.retry.generation),
        ] {
            if policy.max_attempts == 0 {
                return Err(invalid(&format!("retry.{name}.max_attempts must be positive")));
            }
        }
        if self.reranker.top_k == 0 {
            return Err(invalid("reranker.top_k must be positive"));
        }
        if self.embedding.dimensions() == 0 {
            return Err(invalid("embedding.dimensions must be positive"));
        }
        if self.sanitize.max_input_chars == 0 {
            return Err(invalid("sanitize.max_input_chars must be positive"));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid {
        message: message.to_string(),
    }
}

/// Load configuration from all layers.
///
/// Defaults, then `~/.config/priorart/config.toml`, then
/// `<workspace>/.priorart/config.toml`, then `PRIORART_*` environment
/// variables (`__` separates nested keys), then `overrides`.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PipelineConfig>,
) -> Result<PipelineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "priorart", "priorart") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".priorart").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (PRIORART_SEARCH__RRF_K, PRIORART_GRADING__THRESHOLD, etc.)
    figment = figment.merge(Env::prefixed("PRIORART_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.search.rrf_k, 60);
        assert_eq!(config.search.top_k, 5);
        assert!(config.search.use_hybrid);
        assert_eq!(config.search.max_paraphrases, 3);
        assert_eq!(config.grading.threshold, 0.6);
        assert_eq!(config.retry.id_fetch.max_attempts, 5);
        assert_eq!(config.reranker.text_max_chars, 1000);
        assert_eq!(config.sanitize.max_input_chars, 2000);
        assert_eq!(config.request_timeout_secs, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_embedding_dimensions_follow_provider() {
        let mut embedding = EmbeddingConfig::default();
        assert_eq!(embedding.dimensions(), 1536);
        embedding.provider = EmbeddingProvider::Local;
        assert_eq!(embedding.dimensions(), 256);
        embedding.dimensions = Some(64);
        assert_eq!(embedding.dimensions(), 64);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = PipelineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: PipelineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.search.rrf_k, config.search.rrf_k);
        assert_eq!(deserialized.models.grading, config.models.grading);
        assert_eq!(
            deserialized.retry.generation.max_attempts,
            config.retry.generation.max_attempts
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [search]
            rrf_k = 30
            use_hybrid = false
            "#,
        )
        .unwrap();
        assert_eq!(config.search.rrf_k, 30);
        assert!(!config.search.use_hybrid);
        assert_eq!(config.search.top_k, 5);
        assert_eq!(config.grading.threshold, 0.6);
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = PipelineConfig::default();
        config.search.dense_weight = -0.1;
        assert!(config.validate().is_err());

        config.search.dense_weight = 0.0;
        config.search.sparse_weight = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("both be zero"));

        config.search.sparse_weight = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.search.rrf_k = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.grading.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.retry.id_fetch.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.id_fetch"));

        let mut config = PipelineConfig::default();
        config.search.top_k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_api_key_prefers_inline() {
        let config = LlmConfig {
            api_key: Some("sk-inline".into()),
            api_key_env: "PRIORART_TEST_KEY_THAT_DOES_NOT_EXIST".into(),
            ..Default::default()
        };
        assert_eq!(config.resolve_api_key().unwrap(), "sk-inline");
    }

    #[test]
    fn test_resolve_api_key_missing_env() {
        let config = LlmConfig {
            api_key_env: "PRIORART_TEST_KEY_THAT_DOES_NOT_EXIST".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve_api_key(),
            Err(ConfigError::EnvVarMissing { .. })
        ));
    }

    #[test]
    fn test_load_config_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".priorart");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[grading]\nthreshold = 0.75\n\n[reranker]\nenabled = false\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.grading.threshold, 0.75);
        assert!(!config.reranker.enabled);
    }

    #[test]
    fn test_load_config_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let mut overrides = PipelineConfig::default();
        overrides.search.top_k = 9;
        let config = load_config(Some(dir.path()), Some(&overrides)).unwrap();
        assert_eq!(config.search.top_k, 9);
    }

    #[test]
    fn test_local_endpoint_needs_no_key() {
        let config = LlmConfig {
            base_url: Some("http://localhost:11434/v1".into()),
            api_key_env: "PRIORART_TEST_KEY_THAT_DOES_NOT_EXIST".into(),
            ..Default::default()
        };
        assert!(config.is_local());
        assert_eq!(config.resolve_api_key().unwrap(), "local");
    }

    #[test]
    fn test_llm_base_url_default() {
        let config = LlmConfig::default();
        assert_eq!(config.base_url(), "https://api.openai.com/v1");
    }
}
