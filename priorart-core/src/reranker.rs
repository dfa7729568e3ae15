//! Cross-encoder reranking of the graded candidates.
//!
//! The encoder is loaded once when the pipeline is built and shared through
//! `RerankerHandle`. A handle without an encoder passes candidates through
//! unchanged, as does any scoring failure.

use crate::config::RerankerConfig;
use crate::embeddings::{LocalEmbedder, cosine_similarity};
use crate::error::RetrievalError;
use crate::types::{GradedResult, RerankedResult};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the built-in lexical encoder.
pub const LEXICAL_MODEL: &str = "lexical-overlap";

/// Pairwise (query, document) relevance scorer.
///
/// Scoring is CPU-bound and synchronous; callers run it off the async
/// executor.
pub trait CrossEncoder: Send + Sync {
    /// Score every text against `query`, one score per text, in order.
    fn score_batch(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RetrievalError>;

    fn model_name(&self) -> &str;
}

/// Term-overlap cross-encoder.
///
/// Blends hashed term-frequency cosine with the fraction of query terms the
/// document contains.
#[derive(Debug, Clone)]
pub struct LexicalCrossEncoder {
    embedder: LocalEmbedder,
}

impl Default for LexicalCrossEncoder {
    fn default() -> Self {
        Self {
            embedder: LocalEmbedder::new(512),
        }
    }
}

impl LexicalCrossEncoder {
    fn score(&self, query_vec: &[f32], query_terms: &HashSet<String>, text: &str) -> f32 {
        let cosine = cosine_similarity(query_vec, &self.embedder.embed_text(text));
        if query_terms.is_empty() {
            return cosine;
        }
        let doc_terms = terms(text);
        let overlap = query_terms.intersection(&doc_terms).count() as f32 / query_terms.len() as f32;
        0.5 * cosine + 0.5 * overlap
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1)
        .map(str::to_string)
        .collect()
}

impl CrossEncoder for LexicalCrossEncoder {
    fn score_batch(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RetrievalError> {
        let query_vec = self.embedder.embed_text(query);
        let query_terms = terms(query);
        Ok(texts
            .iter()
            .map(|t| self.score(&query_vec, &query_terms, t))
            .collect())
    }

    fn model_name(&self) -> &str {
        LEXICAL_MODEL
    }
}

/// Shared reranker, built once at startup.
#[derive(Clone)]
pub struct RerankerHandle {
    encoder: Option<Arc<dyn CrossEncoder>>,
    text_max_chars: usize,
}

impl std::fmt::Debug for RerankerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RerankerHandle")
            .field("model", &self.encoder.as_ref().map(|e| e.model_name().to_string()))
            .field("text_max_chars", &self.text_max_chars)
            .finish()
    }
}

impl RerankerHandle {
    /// Load the encoder named in config.
    ///
    /// An unknown model or a disabled reranker yields a pass-through handle,
    /// never an error.
    pub fn load(config: &RerankerConfig) -> Self {
        let encoder: Option<Arc<dyn CrossEncoder>> = if !config.enabled {
            None
        } else if config.model == LEXICAL_MODEL {
            Some(Arc::new(LexicalCrossEncoder::default()))
        } else {
            warn!(model = %config.model, "Reranker model unavailable; results will pass through");
            None
        };
        if let Some(encoder) = &encoder {
            info!(model = encoder.model_name(), "Reranker loaded");
        }
        Self {
            encoder,
            text_max_chars: config.text_max_chars,
        }
    }

    pub fn with_encoder(encoder: Arc<dyn CrossEncoder>, text_max_chars: usize) -> Self {
        Self {
            encoder: Some(encoder),
            text_max_chars,
        }
    }

    pub fn pass_through() -> Self {
        Self {
            encoder: None,
            text_max_chars: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.encoder.is_some()
    }

    /// Rerank `candidates` against `query` and keep the best `top_k`.
    ///
    /// Scoring runs on the blocking pool. Without an encoder, or when
    /// scoring fails, the first `top_k` candidates are returned unchanged
    /// with no rerank score.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<GradedResult>,
        top_k: usize,
    ) -> Vec<RerankedResult> {
        let Some(encoder) = self.encoder.clone() else {
            return pass_through(candidates, top_k);
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let texts: Vec<String> = candidates
            .iter()
            .map(|c| c.candidate.payload().rerank_text(self.text_max_chars))
            .collect();
        let query = query.to_string();
        let scored = tokio::task::spawn_blocking(move || encoder.score_batch(&query, &texts))
            .await
            .map_err(|e| RetrievalError::Worker {
                message: format!("reranker task failed: {e}"),
            })
            .and_then(|r| r);

        let scores = match scored {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(scores) => {
                warn!(
                    expected = candidates.len(),
                    actual = scores.len(),
                    "Reranker returned wrong number of scores; passing through"
                );
                return pass_through(candidates, top_k);
            }
            Err(e) => {
                warn!(error = %e, "Reranking failed; passing through");
                return pass_through(candidates, top_k);
            }
        };

        let mut reranked: Vec<RerankedResult> = candidates
            .into_iter()
            .zip(scores)
            .map(|(graded, score)| RerankedResult {
                graded,
                rerank_score: Some(score),
            })
            .collect();
        reranked.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        reranked.truncate(top_k);
        reranked
    }
}

fn pass_through(candidates: Vec<GradedResult>, top_k: usize) -> Vec<RerankedResult> {
    candidates
        .into_iter()
        .take(top_k)
        .map(|graded| RerankedResult {
            graded,
            rerank_score: None,
        })
        .collect()
}
