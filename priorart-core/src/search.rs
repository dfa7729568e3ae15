//! Dense/sparse search capability.
//!
//! The pipeline never talks to an index directly; it goes through
//! `SearchClient`. Backends that can fuse server-side override
//! `hybrid_search`; the default runs both signals concurrently and fuses
//! them with RRF.

pub mod local;

use crate::error::SearchError;
use crate::fusion;
use crate::types::{DocumentPayload, FusedResult, RankedHit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use local::{CorpusRecord, LocalIndex};

/// Classification-code prefix filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// A document passes when its classification starts with any prefix.
    /// Empty disables filtering.
    pub category_prefixes: Vec<String>,
    /// Over-fetch multiplier for backends that filter client-side.
    pub overfetch: usize,
}

impl SearchFilters {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn categories(prefixes: Vec<String>, overfetch: usize) -> Self {
        Self {
            category_prefixes: prefixes,
            overfetch,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.category_prefixes.is_empty()
    }

    pub fn matches(&self, payload: &DocumentPayload) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(code) = payload.classification.as_deref() else {
            return false;
        };
        let code = code.trim().to_uppercase();
        self.category_prefixes
            .iter()
            .any(|p| code.starts_with(&p.trim().to_uppercase()))
    }

    /// How many hits to request so that `top_k` survive client-side filtering.
    pub fn fetch_k(&self, top_k: usize) -> usize {
        if self.is_empty() {
            top_k
        } else {
            top_k.saturating_mul(self.overfetch.max(1))
        }
    }

    /// Drop hits that fail the filter and cap at `top_k`, keeping order.
    pub fn apply(&self, hits: Vec<RankedHit>, top_k: usize) -> Vec<RankedHit> {
        hits.into_iter()
            .filter(|h| self.matches(&h.payload))
            .take(top_k)
            .collect()
    }
}

/// Parameters for one hybrid search.
#[derive(Debug, Clone, Copy)]
pub struct HybridQuery<'a> {
    pub vector: &'a [f32],
    /// Keyword text for the sparse side.
    pub text: &'a str,
    pub top_k: usize,
    pub dense_weight: f32,
    pub sparse_weight: f32,
    pub rrf_k: u32,
    pub filters: &'a SearchFilters,
}

/// Trait for dense/sparse search backends.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Nearest-neighbour search, best first.
    async fn dense_search(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<RankedHit>, SearchError>;

    /// Lexical search over the keyword text, best first.
    async fn sparse_search(
        &self,
        text: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<RankedHit>, SearchError>;

    /// Dense + sparse search fused with RRF.
    async fn hybrid_search(&self, query: HybridQuery<'_>) -> Result<Vec<FusedResult>, SearchError> {
        let (dense, sparse) = tokio::try_join!(
            self.dense_search(query.vector, query.top_k, query.filters),
            self.sparse_search(query.text, query.top_k, query.filters),
        )?;
        Ok(fusion::fuse(
            &dense,
            &sparse,
            query.dense_weight,
            query.sparse_weight,
            query.rrf_k,
            query.top_k,
        ))
    }

    /// Exact lookup by identifier. Missing identifiers are simply absent.
    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<RankedHit>, SearchError>;

    /// Return the backend name.
    fn backend_name(&self) -> &str;
}
