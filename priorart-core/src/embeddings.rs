//! Pluggable embedding providers for dense search.
//!
//! Provides a trait-based abstraction over embedding models, with a local
//! hashing embedder (always available, no network) and the OpenAI
//! `/embeddings` API.

use crate::config::{EmbeddingProvider, PipelineConfig};
use crate::error::{ConfigError, LlmError};
use crate::providers::{map_http_error, map_transport_error};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// Generate embeddings for a batch of texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// Hashed term-frequency embedder.
///
/// Each word is hashed to a dimension and its TF accumulated; the vector is
/// L2-normalised. Deterministic, so documents and queries embedded in
/// different processes remain comparable.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }
        if tf.is_empty() {
            return vector;
        }

        for (term, count) in &tf {
            let idx = simple_hash(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn simple_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        Ok(self.embed_text(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

/// OpenAI API embedder (text-embedding-3-small by default).
pub struct OpenAiEmbedder {
    client: Client,
    api_key: String,
    model: String,
    dims: usize,
    base_url: String,
    timeout_secs: u64,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("model", &self.model)
            .field("dims", &self.dims)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: String,
        model: impl Into<String>,
        dims: usize,
        base_url: &str,
        timeout_secs: u64,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key,
            model: model.into(),
            dims,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
        })
    }

    async fn embed_api_call(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": inputs,
            "dimensions": self.dims,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {e}"),
        })?;
        if !status.is_success() {
            return Err(map_http_error("OpenAI embeddings", status, &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON: {e}"),
        })?;
        parse_embeddings(&json, inputs.len())
    }
}

fn parse_embeddings(json: &Value, expected: usize) -> Result<Vec<Vec<f32>>, LlmError> {
    let data = json["data"]
        .as_array()
        .ok_or_else(|| LlmError::ResponseParse {
            message: "missing data array".to_string(),
        })?;
    if data.len() != expected {
        return Err(LlmError::ResponseParse {
            message: format!("expected {expected} embeddings, got {}", data.len()),
        });
    }

    let mut indexed: Vec<(usize, Vec<f32>)> = data
        .iter()
        .enumerate()
        .map(|(pos, item)| {
            let index = item["index"].as_u64().map_or(pos, |i| i as usize);
            let vector = item["embedding"]
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect()
                })
                .unwrap_or_default();
            (index, vector)
        })
        .collect();
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut vectors = self.embed_api_call(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| LlmError::ResponseParse {
            message: "empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.embed_api_call(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

/// Create the embedder named in config.
pub fn create_embedder(config: &PipelineConfig) -> Result<Arc<dyn Embedder>, ConfigError> {
    let dims = config.embedding.dimensions();
    match config.embedding.provider {
        EmbeddingProvider::Local => Ok(Arc::new(LocalEmbedder::new(dims))),
        EmbeddingProvider::OpenAi => {
            let api_key = config.llm.resolve_api_key()?;
            Ok(Arc::new(OpenAiEmbedder::new(
                api_key,
                config.models.embedding.clone(),
                dims,
                config.llm.base_url(),
                config.llm.timeout_secs,
            )?))
        }
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_embedder_basic() {
        let embedder = LocalEmbedder::new(64);
        let v = embedder.embed("solid state battery electrolyte").await.unwrap();
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_local_embedder_empty_text() {
        let v = LocalEmbedder::new(16).embed_text("   ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_local_embedder_deterministic() {
        let e = LocalEmbedder::new(128);
        assert_eq!(e.embed_text("drone delivery"), e.embed_text("drone delivery"));
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let e = LocalEmbedder::new(256);
        let q = e.embed_text("battery thermal runaway detection");
        let near = e.embed_text("detection of thermal runaway in a battery pack");
        let far = e.embed_text("optical lens coating for cameras");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[tokio::test]
    async fn test_embed_batch_default() {
        let e = LocalEmbedder::new(32);
        let out = e
            .embed_batch(&["a b".to_string(), "c d".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_parse_embeddings_orders_by_index() {
        let json = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_embeddings(&json, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert!(parse_embeddings(&json, 3).is_err());
    }

    #[test]
    fn test_create_local_embedder() {
        let mut config = PipelineConfig::default();
        config.embedding.provider = EmbeddingProvider::Local;
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.dimensions(), 256);
        assert_eq!(embedder.provider_name(), "local");
    }
}
